//! Preflight checks: verify the host actually has what this crate needs
//! before any component tries to use it, collecting every failure into one
//! report instead of failing opaquely on the first missing thing.

use crate::command::{self, Privilege};
use crate::config::HostNetworkConfig;
use crate::error::NetError;

/// External commands every component in this crate shells out to.
const REQUIRED_COMMANDS: &[&str] = &["ip", "iptables", "iptables-save", "sysctl", "ss"];

/// Verify required commands are on `PATH`, non-interactive `sudo` works,
/// and the runtime directory can be created and written to. Returns
/// [`NetError::PreflightFailed`] listing every problem found, not just the
/// first.
pub async fn check(config: &HostNetworkConfig) -> Result<(), NetError> {
    let mut errors = Vec::new();

    check_required_commands(&mut errors);
    check_sudo(&mut errors).await;
    check_runtime_dir(config, &mut errors);
    check_default_route(&mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(NetError::PreflightFailed(errors.join("\n")))
    }
}

fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in REQUIRED_COMMANDS {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if command::exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "non-interactive sudo is not available; configure sudoers for this user".to_string(),
        );
    }
}

fn check_runtime_dir(config: &HostNetworkConfig, errors: &mut Vec<String>) {
    if let Err(e) = std::fs::create_dir_all(&config.run_dir) {
        errors.push(format!(
            "cannot create runtime dir {}: {e}",
            config.run_dir.display()
        ));
    }
}

/// §9's open question, decided here: a host without a default route fails
/// preflight with a clear message rather than surfacing as an opaque
/// `NoDefaultInterface` later, mid-bridge-setup.
async fn check_default_route(errors: &mut Vec<String>) {
    if let Err(e) = crate::bridge::default_interface().await {
        errors.push(format!("could not determine default route/interface: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_runtime_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("nested").join("vm0");
        let config = HostNetworkConfig::new(&run_dir, "test");

        let mut errors = Vec::new();
        check_runtime_dir(&config, &mut errors);
        assert!(errors.is_empty());
        assert!(run_dir.exists());
    }
}
