//! The closed set of error kinds produced by every component in this crate.
//!
//! Absence is never an error (see teardown paths throughout); this enum only
//! ever surfaces conditions that actually block a caller's request.

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// All 253 addresses in `172.16.0.2-254` are currently allocated.
    #[error("ip pool exhausted: no free address in 172.16.0.2-254")]
    PoolExhausted,

    /// The advisory pool lock could not be acquired within `LOCK_TIMEOUT`.
    #[error("timed out after {0:?} waiting for ip pool lock")]
    LockTimeout(std::time::Duration),

    /// The registry file on disk could not be parsed as JSON.
    ///
    /// Callers treat this as "start from empty" rather than propagating it;
    /// the variant exists so the recovery is logged instead of silent.
    #[error("ip registry at {path} is corrupt: {detail}")]
    RegistryCorrupt { path: String, detail: String },

    /// A required external command is missing from `PATH`.
    #[error("required command not found: {0}")]
    CommandMissing(String),

    /// An external command (`ip`, `iptables`, `sysctl`, `ss`, ...) exited non-zero.
    #[error("command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The default route lookup did not yield an outgoing interface.
    #[error("could not determine default interface from route output: {0}")]
    NoDefaultInterface(String),

    /// `vm_id` is empty, which would produce a degenerate TAP name.
    #[error("vm_id must not be empty")]
    EmptyVmId,

    /// One or more preflight checks failed (missing command, no sudo, ...).
    #[error("preflight check failed:\n{0}")]
    PreflightFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
