//! Advisory lock for the IP registry, backed by a PID-marker file.
//!
//! This is deliberately not a kernel `flock`: the design calls for a marker
//! file whose body is the holder's PID, so a contender can tell a crashed
//! holder apart from a live one by probing the PID with signal 0 and
//! reclaim the marker itself rather than wait on a kernel object that dies
//! with the process. This is the pattern any implementation of this lock
//! must use, because independent processes (different runner invocations,
//! the `vm0-netdoctor` operator CLI) contend for it with no shared parent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::NetError;

/// Holds the advisory lock until dropped, at which point the marker file is
/// removed unconditionally — the "cleanup in an unconditional cleanup on
/// every exit path" requirement.
#[must_use]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock marker");
            }
        }
    }
}

/// Acquire the advisory lock at `path`, waiting up to `timeout` and polling
/// every `poll_interval` while it is held by a live process.
///
/// A marker found to belong to a dead process is deleted and acquisition is
/// retried immediately (it does not consume a poll interval's worth of the
/// timeout budget, but does count against the overall deadline).
pub async fn acquire(path: &Path, timeout: Duration, poll_interval: Duration) -> Result<LockGuard, NetError> {
    let deadline = Instant::now() + timeout;

    loop {
        match try_create_marker(path) {
            Ok(()) => {
                trace!(path = %path.display(), "acquired ip pool lock");
                return Ok(LockGuard { path: path.to_path_buf() });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(NetError::LockTimeout(timeout));
                }

                match holder_is_alive(path) {
                    Some(true) => {
                        sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())))
                            .await;
                    }
                    Some(false) => {
                        debug!(path = %path.display(), "reclaiming lock marker left by dead process");
                        let _ = std::fs::remove_file(path);
                    }
                    None => {
                        // Marker vanished or was unreadable between the create
                        // failure and our read; just retry immediately.
                    }
                }
            }
            Err(e) => return Err(NetError::Io(e)),
        }

        if Instant::now() >= deadline {
            return Err(NetError::LockTimeout(timeout));
        }
    }
}

/// Create the marker file exclusively and write this process's PID into it.
fn try_create_marker(path: &Path) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{}", std::process::id())
}

/// `Some(true)` if the marker names a live process, `Some(false)` if it
/// names a dead one, `None` if the marker could not be read (e.g. it
/// disappeared concurrently).
fn holder_is_alive(path: &Path) -> Option<bool> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Some(true),
        Err(nix::errno::Errno::ESRCH) => Some(false),
        // EPERM means the process exists but we can't signal it (different
        // user) — treat it as alive; we must not steal a live lock.
        Err(_) => Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_and_releases_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-pool.lock");

        let guard = acquire(&path, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn acquire_reclaims_marker_from_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-pool.lock");

        // PID 1 belongs to init in almost any container/host; pick a PID
        // that is very unlikely to be running to simulate a stale marker.
        std::fs::write(&path, "999999").unwrap();

        let guard = acquire(&path, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(guard);
    }

    #[tokio::test]
    async fn acquire_times_out_on_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-pool.lock");

        // Our own PID is alive, so this marker can never be reclaimed.
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        let err = acquire(&path, Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::LockTimeout(_)));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn acquire_creates_run_dir_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ip-pool.lock");

        let guard = acquire(&path, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(path.exists());
        drop(guard);
    }
}
