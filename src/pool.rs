//! IP Pool (P): race-safe allocation of `172.16.0.2-254` across parallel
//! VM creations on one host, persisted to a JSON registry and guarded by
//! the PID-marker advisory lock in [`crate::lock`].

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::config::{HostNetworkConfig, POOL_FIRST_OCTET, POOL_LAST_OCTET, VM_SUBNET_PREFIX};
use crate::error::NetError;
use crate::lock;

/// One allocated address's metadata, as stored under its IP key in the
/// registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocation {
    pub vm_id: String,
    pub tap_device: String,
    pub allocated_at: DateTime<Utc>,
}

/// The persisted registry: `Ipv4 -> IpAllocation`, unique by both key and
/// `vm_id`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IpRegistry {
    pub allocations: HashMap<String, IpAllocation>,
}

/// Race-safe IPv4 pool over `172.16.0.2-254`.
pub struct IpPool<'a> {
    config: &'a HostNetworkConfig,
}

impl<'a> IpPool<'a> {
    pub fn new(config: &'a HostNetworkConfig) -> Self {
        Self { config }
    }

    /// Allocate the first free address in ascending order for `vm_id`.
    ///
    /// Deliberately does **not** reconcile against live kernel state before
    /// scanning — see the module doc on [`crate::doctor`] for why that
    /// would double-allocate under concurrent `allocate`/`create` races.
    pub async fn allocate(&self, vm_id: &str) -> Result<String, NetError> {
        if vm_id.is_empty() {
            return Err(NetError::EmptyVmId);
        }

        let guard = lock::acquire(
            &self.config.lock_path(),
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
        .await?;

        let mut registry = self.read_registry()?;

        let ip = (POOL_FIRST_OCTET..=POOL_LAST_OCTET)
            .map(|octet| format!("{VM_SUBNET_PREFIX}.{octet}"))
            .find(|candidate| !registry.allocations.contains_key(candidate))
            .ok_or(NetError::PoolExhausted)?;

        let tap_device = tap_device_name(vm_id);
        registry.allocations.insert(
            ip.clone(),
            IpAllocation {
                vm_id: vm_id.to_string(),
                tap_device,
                allocated_at: Utc::now(),
            },
        );

        self.write_registry(&registry)?;
        drop(guard);

        info!(vm_id, ip = %ip, "allocated ip");
        Ok(ip)
    }

    /// Remove `ip` from the registry if present. Never fails for a missing
    /// key — absence is the goal, and it may already hold.
    pub async fn release(&self, ip: &str) -> Result<(), NetError> {
        let guard = lock::acquire(
            &self.config.lock_path(),
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
        .await?;

        let mut registry = self.read_registry()?;
        if registry.allocations.remove(ip).is_some() {
            self.write_registry(&registry)?;
            info!(ip, "released ip");
        } else {
            trace!(ip, "release of unallocated ip, ignoring");
        }

        drop(guard);
        Ok(())
    }

    /// Read-only: the IP currently allocated to `vm_id`, if any.
    pub async fn lookup_by_vm_id(&self, vm_id: &str) -> Result<Option<String>, NetError> {
        let registry = self.read_registry_unlocked()?;
        Ok(registry
            .allocations
            .iter()
            .find(|(_, a)| a.vm_id == vm_id)
            .map(|(ip, _)| ip.clone()))
    }

    /// Read-only snapshot of the full registry, for the Doctor.
    pub async fn snapshot(&self) -> Result<Vec<(String, IpAllocation)>, NetError> {
        let registry = self.read_registry_unlocked()?;
        let mut entries: Vec<_> = registry.allocations.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Drop every registry entry whose TAP is not in `live_taps` **and**
    /// whose `allocated_at` is at least `grace_period` old, under a single
    /// lock acquisition so the read-filter-write is atomic with respect to
    /// concurrent `allocate`/`release` callers. Returns the dropped `(ip,
    /// vm_id)` pairs for the caller to log.
    ///
    /// This is [`crate::doctor`]'s `cleanupOrphanedAllocations`, kept here
    /// because it is the pool's persistence format and lock that it
    /// manipulates; the Doctor only supplies the kernel-observed fact (which
    /// TAPs actually exist).
    pub async fn reconcile(
        &self,
        live_taps: &HashSet<String>,
        grace_period: Duration,
    ) -> Result<Vec<(String, String)>, NetError> {
        let guard = lock::acquire(
            &self.config.lock_path(),
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
        .await?;

        let mut registry = self.read_registry()?;
        if registry.allocations.is_empty() {
            drop(guard);
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut dropped = Vec::new();
        registry.allocations.retain(|ip, allocation| {
            let tap_present = live_taps.contains(&allocation.tap_device);
            let within_grace = now.signed_duration_since(allocation.allocated_at)
                < chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::zero());

            let keep = tap_present || within_grace;
            if !keep {
                dropped.push((ip.clone(), allocation.vm_id.clone()));
            }
            keep
        });

        if !dropped.is_empty() {
            self.write_registry(&registry)?;
        }
        drop(guard);
        Ok(dropped)
    }

    /// Read the registry, treating a missing or corrupt file as empty.
    ///
    /// A corrupt file is logged and discarded rather than propagated: the
    /// Doctor re-derives live allocations from TAP devices on the next
    /// startup, so losing stale registry content only loses state that was
    /// already wrong.
    fn read_registry(&self) -> Result<IpRegistry, NetError> {
        self.read_registry_unlocked()
    }

    fn read_registry_unlocked(&self) -> Result<IpRegistry, NetError> {
        let path = self.config.registry_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(registry) => Ok(registry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ip registry corrupt, starting from empty");
                    Ok(IpRegistry::default())
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(IpRegistry::default()),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Persist the registry. The caller holds the exclusive lock, so a
    /// direct overwrite is sufficient (write-temp-then-rename is allowed
    /// but not required by the lock's exclusivity guarantee).
    fn write_registry(&self, registry: &IpRegistry) -> Result<(), NetError> {
        let path = self.config.registry_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(registry)?;
        std::fs::write(&path, serialized)?;
        Ok(())
    }
}

/// `tap<first 8 chars of vm_id>`, kept under the kernel's 15-byte `IFNAMSIZ`
/// limit. Used both by the pool (to stamp `tap_device` into the registry)
/// and by [`crate::tap`] (to derive the name it actually creates).
pub fn tap_device_name(vm_id: &str) -> String {
    let prefix: String = vm_id.chars().take(8).collect();
    format!("tap{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> HostNetworkConfig {
        let mut config = HostNetworkConfig::new(dir.path(), "test");
        config.lock_timeout = Duration::from_millis(500);
        config.lock_poll_interval = Duration::from_millis(10);
        config
    }

    #[test]
    fn tap_device_name_truncates_to_eight_chars() {
        assert_eq!(tap_device_name("11112222aaaabbbb"), "tap11112222");
    }

    #[test]
    fn tap_device_name_handles_short_vm_id() {
        assert_eq!(tap_device_name("abc"), "tapabc");
    }

    #[tokio::test]
    async fn allocate_returns_first_free_address() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        let ip = pool.allocate("11112222aaaabbbb").await.unwrap();
        assert_eq!(ip, "172.16.0.2");

        let ip2 = pool.allocate("22223333bbbbcccc").await.unwrap();
        assert_eq!(ip2, "172.16.0.3");
    }

    #[tokio::test]
    async fn allocate_persists_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        pool.allocate("11112222aaaabbbb").await.unwrap();

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "172.16.0.2");
        assert_eq!(snapshot[0].1.vm_id, "11112222aaaabbbb");
        assert_eq!(snapshot[0].1.tap_device, "tap11112222");
    }

    #[tokio::test]
    async fn release_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        let ip = pool.allocate("11112222aaaabbbb").await.unwrap();
        pool.release(&ip).await.unwrap();

        assert_eq!(pool.snapshot().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        let ip = pool.allocate("11112222aaaabbbb").await.unwrap();
        pool.release(&ip).await.unwrap();
        // Second release of an already-released (and never-reallocated) ip
        // must not error.
        pool.release(&ip).await.unwrap();
    }

    #[tokio::test]
    async fn allocate_fails_empty_vm_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        let err = pool.allocate("").await.unwrap_err();
        assert!(matches!(err, NetError::EmptyVmId));
    }

    #[tokio::test]
    async fn allocate_exhausts_after_253_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        for i in 0..253 {
            let vm_id = format!("vm{i:014}");
            pool.allocate(&vm_id).await.unwrap();
        }

        let err = pool.allocate("onemoreVM00000").await.unwrap_err();
        assert!(matches!(err, NetError::PoolExhausted));
        // No entry was added for the failed allocation.
        assert_eq!(pool.snapshot().await.unwrap().len(), 253);
    }

    #[tokio::test]
    async fn all_allocated_ips_are_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        for i in 0..50 {
            let vm_id = format!("vm{i:014}");
            let ip = pool.allocate(&vm_id).await.unwrap();
            let octet: u8 = ip.rsplit('.').next().unwrap().parse().unwrap();
            assert!((2..=254).contains(&octet));
        }
    }

    #[tokio::test]
    async fn lookup_by_vm_id_finds_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        let ip = pool.allocate("11112222aaaabbbb").await.unwrap();
        let found = pool.lookup_by_vm_id("11112222aaaabbbb").await.unwrap();
        assert_eq!(found, Some(ip));
    }

    #[tokio::test]
    async fn lookup_by_vm_id_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        assert_eq!(pool.lookup_by_vm_id("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_registry_recovers_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(&config.run_dir).unwrap();
        std::fs::write(config.registry_path(), "{ not json").unwrap();

        let pool = IpPool::new(&config);
        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 0);

        // And allocation still works, picking the first address.
        let ip = pool.allocate("11112222aaaabbbb").await.unwrap();
        assert_eq!(ip, "172.16.0.2");
    }

    #[tokio::test]
    async fn reconcile_drops_old_entry_with_no_tap() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        pool.allocate("deadbeefdeadbeef").await.unwrap();
        // Backdate the allocation past the grace period by rewriting the
        // registry directly.
        let mut registry = pool.read_registry_unlocked().unwrap();
        for alloc in registry.allocations.values_mut() {
            alloc.allocated_at = Utc::now() - chrono::Duration::seconds(600);
        }
        pool.write_registry(&registry).unwrap();

        let dropped = pool.reconcile(&HashSet::new(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(pool.snapshot().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn reconcile_keeps_entry_within_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        pool.allocate("freshvm00000000").await.unwrap();

        let dropped = pool.reconcile(&HashSet::new(), Duration::from_secs(30)).await.unwrap();
        assert!(dropped.is_empty());
        assert_eq!(pool.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_keeps_entry_whose_tap_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = IpPool::new(&config);

        pool.allocate("deadbeefdeadbeef").await.unwrap();
        let mut registry = pool.read_registry_unlocked().unwrap();
        for alloc in registry.allocations.values_mut() {
            alloc.allocated_at = Utc::now() - chrono::Duration::seconds(600);
        }
        pool.write_registry(&registry).unwrap();

        let live_taps: HashSet<String> = ["tapdeadbeef".to_string()].into_iter().collect();
        let dropped = pool.reconcile(&live_taps, Duration::from_secs(30)).await.unwrap();
        assert!(dropped.is_empty());
        assert_eq!(pool.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parallel_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let config = std::sync::Arc::new(test_config(&dir));

        let mut handles = Vec::new();
        for i in 0..2 {
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let pool = IpPool::new(&config);
                let vm_id = format!("vm{i:014}");
                pool.allocate(&vm_id).await.unwrap()
            }));
        }

        let mut ips = Vec::new();
        for h in handles {
            ips.push(h.await.unwrap());
        }
        ips.sort();
        assert_eq!(ips, vec!["172.16.0.2".to_string(), "172.16.0.3".to_string()]);
    }
}
