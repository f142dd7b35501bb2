//! Thin wrapper around shelling out to `ip`, `iptables`, `sysctl`, and `ss`.
//!
//! Every operation in this crate that mutates or reads kernel state goes
//! through here so that failure formatting and logging stay uniform, and so
//! every call carries the bounded timeout §5 requires of suspension points
//! that invoke an external process.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

use crate::error::NetError;

/// How long an external command is given before it's considered hung.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo -n`.
    Sudo,
    /// Run as the current user.
    User,
}

fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 3);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
        parts.push("-n");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run `program args...`, returning trimmed stdout on success.
///
/// Non-zero exit becomes [`NetError::CommandFailed`] carrying trimmed stderr.
/// A command that does not complete within [`COMMAND_TIMEOUT`] is also
/// reported as `CommandFailed`, matching §5's "bounded timeout" requirement.
pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, NetError> {
    let display = format_command_display(program, args, privilege);
    trace!(command = %display, "exec");

    let run = async {
        match privilege {
            Privilege::Sudo => {
                let mut sudo_args = vec!["-n", program];
                sudo_args.extend_from_slice(args);
                Command::new("sudo").args(&sudo_args).output().await
            }
            Privilege::User => Command::new(program).args(args).output().await,
        }
    };

    let output = timeout(COMMAND_TIMEOUT, run)
        .await
        .map_err(|_| NetError::CommandFailed {
            command: display.clone(),
            stderr: format!("timed out after {COMMAND_TIMEOUT:?}"),
        })?
        .map_err(|e| NetError::CommandFailed {
            command: display.clone(),
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(NetError::CommandFailed {
            command: display,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run an existence probe such as `iptables -C ...` or `ip link show <dev>`.
///
/// These commands use exit status, not stdout, to report presence: `0` means
/// the thing being checked for exists, `1` means it does not. Any other exit
/// code (malformed rule, unknown chain) is a genuine failure and propagates,
/// matching §7: "rule-existence probes: converted to missing -> insert;
/// other failures propagate with stderr captured".
pub async fn check(program: &str, args: &[&str], privilege: Privilege) -> Result<bool, NetError> {
    let display = format_command_display(program, args, privilege);
    trace!(command = %display, "check");

    let run = async {
        match privilege {
            Privilege::Sudo => {
                let mut sudo_args = vec!["-n", program];
                sudo_args.extend_from_slice(args);
                Command::new("sudo").args(&sudo_args).output().await
            }
            Privilege::User => Command::new(program).args(args).output().await,
        }
    };

    let output = timeout(COMMAND_TIMEOUT, run)
        .await
        .map_err(|_| NetError::CommandFailed {
            command: display.clone(),
            stderr: format!("timed out after {COMMAND_TIMEOUT:?}"),
        })?
        .map_err(|e| NetError::CommandFailed {
            command: display.clone(),
            stderr: e.to_string(),
        })?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(NetError::CommandFailed {
            command: display,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

/// Run a command, discarding any failure.
///
/// Used throughout teardown paths, where the goal is an absent resource and
/// the kernel already agreeing is success, not an error to report.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    let display = format_command_display(program, args, privilege);
    match exec(program, args, privilege).await {
        Ok(_) => {}
        Err(e) => trace!(command = %display, error = %e, "command failed (ignored)"),
    }
}
