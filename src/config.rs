//! Runtime configuration for the networking substrate.
//!
//! A single [`HostNetworkConfig`] is constructed once at runner startup and
//! threaded through every component in this crate. Defaults match the
//! literal values called out in the design (30s grace period, 10s lock
//! timeout, 100ms poll interval) but are fields, not constants, so tests can
//! shrink them and point the registry/lock at a `tempfile::tempdir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default runtime directory, mirroring `sandbox-fc`'s `/run/vm0`.
pub const DEFAULT_RUN_DIR: &str = "/run/vm0";

/// Name of the shared bridge. Exactly one exists per host.
pub const BRIDGE_NAME: &str = "vm0br0";

/// Bridge gateway address (the `.1` of the VM subnet).
pub const BRIDGE_GATEWAY_IP: &str = "172.16.0.1";

/// Bridge gateway address with prefix length, as handed to `ip addr add`.
pub const BRIDGE_GATEWAY_CIDR: &str = "172.16.0.1/24";

/// The VM subnet in CIDR form.
pub const VM_SUBNET_CIDR: &str = "172.16.0.0/24";

/// Dotted-quad netmask for the VM subnet, as used in guest boot args.
pub const VM_SUBNET_NETMASK: &str = "255.255.255.0";

/// First three octets shared by every address in the VM subnet.
pub const VM_SUBNET_PREFIX: &str = "172.16.0";

/// First host-assignable octet (`.1` is the bridge gateway).
pub const POOL_FIRST_OCTET: u8 = 2;

/// Last host-assignable octet.
pub const POOL_LAST_OCTET: u8 = 254;

/// Public sentinel address used to resolve the host's default route.
pub const DEFAULT_ROUTE_SENTINEL: &str = "8.8.8.8";

/// Host-side configuration shared by every component in this crate.
#[derive(Debug, Clone)]
pub struct HostNetworkConfig {
    /// Runtime directory holding the registry and lock files.
    pub run_dir: PathBuf,
    /// This runner's tag, embedded in every iptables comment this process
    /// owns (`vm0:runner:<name>`). Distinguishes rules between runners on a
    /// (today forbidden, but still guarded-against) multi-runner host.
    pub runner_tag: String,
    /// Local port the transparent proxy listens on.
    pub proxy_port: u16,
    /// How long a fresh registry entry is protected from reconciliation
    /// even if its TAP is not yet visible on the bridge.
    pub grace_period: Duration,
    /// Bound on how long `allocate`/`release` wait for the advisory lock.
    pub lock_timeout: Duration,
    /// Polling interval while waiting for a contended lock.
    pub lock_poll_interval: Duration,
}

impl HostNetworkConfig {
    /// Build a config rooted at `run_dir` with the given runner name.
    ///
    /// `runner_name` is wrapped into the `vm0:runner:<name>` tag format the
    /// proxy interception component uses to identify rules it owns.
    pub fn new(run_dir: impl Into<PathBuf>, runner_name: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            runner_tag: format!("vm0:runner:{}", runner_name.into()),
            proxy_port: 8080,
            grace_period: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_proxy_port(mut self, proxy_port: u16) -> Self {
        self.proxy_port = proxy_port;
        self
    }

    /// Path to the JSON-serialized IP registry.
    pub fn registry_path(&self) -> PathBuf {
        self.run_dir.join("ip-registry.json")
    }

    /// Path to the advisory lock marker file.
    pub fn lock_path(&self) -> PathBuf {
        self.run_dir.join("ip-pool.lock")
    }
}

/// Runtime directory convenience, parallel to `sandbox_fc::paths::RUNTIME_DIR`.
pub fn default_run_dir() -> &'static Path {
    Path::new(DEFAULT_RUN_DIR)
}
