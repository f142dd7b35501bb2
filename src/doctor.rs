//! Doctor / Reconciler (D): brings persistent state and kernel state back
//! into agreement at runner startup, and answers the operator-facing
//! `vm0-netdoctor status` query.

use std::collections::HashSet;
use std::fmt;

use tracing::info;

use crate::bridge::{self, BridgeStatus};
use crate::command::{self, Privilege};
use crate::config::{BRIDGE_NAME, HostNetworkConfig};
use crate::error::NetError;
use crate::pool::{IpAllocation, IpPool};
use crate::proxy;

/// Human-and-machine-readable snapshot produced by [`status`], the content
/// behind the operator-facing "doctor" diagnostic.
#[derive(Debug)]
pub struct DoctorReport {
    pub bridge: BridgeStatus,
    pub taps: Vec<String>,
    pub allocations: Vec<(String, IpAllocation)>,
    pub nat_rules: Vec<proxy::IptablesRule>,
    pub orphaned_rules: Vec<proxy::IptablesRule>,
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bridge {BRIDGE_NAME}:")?;
        writeln!(
            f,
            "  exists={} up={} ip={}",
            self.bridge.exists,
            self.bridge.up,
            self.bridge.ip.as_deref().unwrap_or("-")
        )?;
        writeln!(f, "taps: {} enslaved", self.taps.len())?;
        for tap in &self.taps {
            writeln!(f, "  {tap}")?;
        }
        writeln!(f, "ip allocations: {}", self.allocations.len())?;
        for (ip, alloc) in &self.allocations {
            writeln!(f, "  {ip} -> vm_id={} tap={}", alloc.vm_id, alloc.tap_device)?;
        }
        writeln!(f, "nat PREROUTING rules: {}", self.nat_rules.len())?;
        writeln!(f, "orphaned proxy rules: {}", self.orphaned_rules.len())?;
        for rule in &self.orphaned_rules {
            writeln!(
                f,
                "  source={} dport={} -> port={} comment={}",
                rule.source,
                rule.dest_port,
                rule.redirect_port,
                rule.comment.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}

/// Enumerate interfaces enslaved to `vm0br0` whose name matches a TAP name
/// (`tap` + lowercase hex), i.e. the kernel's ground truth for "this VM's
/// TAP is actually up and attached".
pub async fn live_taps() -> Result<HashSet<String>, NetError> {
    let output = command::exec(
        "ip",
        &["link", "show", "master", BRIDGE_NAME],
        Privilege::User,
    )
    .await?;

    Ok(output
        .lines()
        .filter_map(|line| {
            // `ip link show` prints "N: <name>@..." or "N: <name>: ..." per
            // interface; pull the bare name out.
            let rest = line.split_once(": ")?.1;
            let name = rest.split(['@', ':']).next()?.trim();
            Some(name.to_string())
        })
        .filter(|name| is_tap_name(name))
        .collect())
}

fn is_tap_name(name: &str) -> bool {
    name.strip_prefix("tap")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Reconcile the IP registry against live TAP devices, dropping any entry
/// whose TAP is both absent and older than the grace period. Returns the
/// number of entries reclaimed.
pub async fn cleanup_orphaned_allocations(
    pool: &IpPool<'_>,
    config: &HostNetworkConfig,
) -> Result<usize, NetError> {
    let taps = live_taps().await?;
    let dropped = pool.reconcile(&taps, config.grace_period).await?;
    for (ip, vm_id) in &dropped {
        info!(ip, vm_id, "reclaimed orphaned ip allocation");
    }
    Ok(dropped.len())
}

/// Delete every ARP neighbour entry on `vm0br0`, ignoring entries that are
/// already gone. Returns the number flushed, for observability.
pub async fn flush_bridge_arp_cache() -> Result<usize, NetError> {
    let output = command::exec("ip", &["neigh", "show", "dev", BRIDGE_NAME], Privilege::User)
        .await
        .unwrap_or_default();

    let ips: Vec<&str> = output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    let mut flushed = 0;
    for ip in ips {
        command::exec_ignore_errors(
            "ip",
            &["neigh", "del", ip, "dev", BRIDGE_NAME],
            Privilege::Sudo,
        )
        .await;
        flushed += 1;
    }

    info!(flushed, "flushed bridge arp cache");
    Ok(flushed)
}

/// Sweep proxy rules tagged with this runner's tag, see
/// [`crate::proxy::cleanup_orphaned_proxy_rules`].
pub async fn cleanup_orphaned_proxy_rules(runner_tag: &str) -> usize {
    proxy::cleanup_orphaned_proxy_rules(runner_tag).await
}

/// Counts from a [`reconcile`] pass, for the caller to log or print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub swept_proxy_rules: usize,
    pub reclaimed_allocations: usize,
    pub flushed_arp_entries: usize,
}

/// The single entry point a runner calls once at startup: sweep this
/// runner's orphaned proxy rules, reclaim orphaned IP allocations, then
/// flush the bridge ARP cache — in that order, matching §2's control-flow
/// sketch (`runner boot -> D.reconcile() (flush stale ARP, drop orphaned
/// REDIRECTs, reclaim IPs)`). Proxy rules go first so a stale REDIRECT
/// never outlives the allocation/ARP state it depended on.
pub async fn reconcile(
    pool: &IpPool<'_>,
    config: &HostNetworkConfig,
) -> Result<ReconcileReport, NetError> {
    let swept_proxy_rules = cleanup_orphaned_proxy_rules(&config.runner_tag).await;
    let reclaimed_allocations = cleanup_orphaned_allocations(pool, config).await?;
    let flushed_arp_entries = flush_bridge_arp_cache().await?;

    Ok(ReconcileReport {
        swept_proxy_rules,
        reclaimed_allocations,
        flushed_arp_entries,
    })
}

/// Run every read-only check and assemble the operator-facing report.
pub async fn status(config: &HostNetworkConfig) -> Result<DoctorReport, NetError> {
    let pool = IpPool::new(config);

    let bridge = bridge::bridge_status().await.unwrap_or(BridgeStatus {
        exists: false,
        ip: None,
        up: false,
    });
    let taps: Vec<String> = live_taps().await.unwrap_or_default().into_iter().collect();
    let allocations = pool.snapshot().await?;

    let nat_rules = proxy::list_nat_rules().await.unwrap_or_default();
    let listening = proxy::listening_tcp_ports().await.unwrap_or_default();
    let orphaned_rules = proxy::find_orphans(&nat_rules, &listening);

    Ok(DoctorReport {
        bridge,
        taps,
        allocations,
        nat_rules,
        orphaned_rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tap_name_matches_hex_suffix() {
        assert!(is_tap_name("tap11112222"));
        assert!(is_tap_name("tapdeadbeef"));
    }

    #[test]
    fn is_tap_name_rejects_non_tap_names() {
        assert!(!is_tap_name("eth0"));
        assert!(!is_tap_name("vm0br0"));
        assert!(!is_tap_name("tap"));
    }

    #[test]
    fn is_tap_name_rejects_non_hex_suffix() {
        assert!(!is_tap_name("tapxyz12345"));
    }
}
