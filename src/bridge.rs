//! Bridge Manager (B): idempotent setup of the single host bridge
//! `vm0br0`, its NAT MASQUERADE rule, IP forwarding, and the `FORWARD`
//! chain rules that let traffic actually egress to the internet.

use tracing::{info, warn};

use crate::command::{self, Privilege};
use crate::config::{
    BRIDGE_GATEWAY_CIDR, BRIDGE_GATEWAY_IP, BRIDGE_NAME, DEFAULT_ROUTE_SENTINEL, VM_SUBNET_CIDR,
};
use crate::error::NetError;

/// Read-only introspection of the bridge's current state, for the Doctor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub exists: bool,
    pub ip: Option<String>,
    pub up: bool,
}

/// Ensure `vm0br0` exists, is addressed and UP, and that forwarding/NAT are
/// configured. Safe to call on every runner startup: creation is skipped
/// if the bridge already exists, but the FORWARD rules are still
/// (re-)applied since a reboot or an unrelated `iptables -F` may have
/// dropped them.
pub async fn setup_bridge() -> Result<(), NetError> {
    if bridge_exists().await? {
        info!(bridge = BRIDGE_NAME, "bridge already present");
    } else {
        info!(bridge = BRIDGE_NAME, "creating bridge");
        command::exec(
            "ip",
            &["link", "add", "name", BRIDGE_NAME, "type", "bridge"],
            Privilege::Sudo,
        )
        .await?;
        command::exec(
            "ip",
            &["addr", "add", BRIDGE_GATEWAY_CIDR, "dev", BRIDGE_NAME],
            Privilege::Sudo,
        )
        .await?;
        command::exec("ip", &["link", "set", BRIDGE_NAME, "up"], Privilege::Sudo).await?;
        command::exec(
            "sysctl",
            &["-w", "net.ipv4.ip_forward=1"],
            Privilege::Sudo,
        )
        .await?;
    }

    ensure_masquerade().await?;

    let default_iface = default_interface().await?;
    ensure_forward_rules(&default_iface).await?;

    Ok(())
}

/// Best-effort removal of the bridge link, its MASQUERADE rule, and its
/// FORWARD rules. Not exercised by normal runner lifecycle — the bridge
/// outlives any one runner by design (§9) — but present for the
/// operator-facing `vm0-netdoctor` binary and for test cleanup. Every
/// sub-step is best-effort, mirroring [`crate::tap::TapManager::delete_tap`]:
/// the goal is an absent bridge, and a kernel that already agrees is
/// success, not an error.
pub async fn teardown_bridge() -> Result<(), NetError> {
    if let Ok(default_iface) = default_interface().await {
        remove_forward_rules(&default_iface).await;
    }

    remove_masquerade().await;

    if bridge_exists().await? {
        command::exec_ignore_errors("ip", &["link", "set", BRIDGE_NAME, "down"], Privilege::Sudo)
            .await;
        command::exec_ignore_errors(
            "ip",
            &["link", "del", BRIDGE_NAME, "type", "bridge"],
            Privilege::Sudo,
        )
        .await;
        info!(bridge = BRIDGE_NAME, "bridge removed");
    }

    Ok(())
}

/// `true`/`false`/addr/up introspection used by [`crate::doctor::status`].
pub async fn bridge_status() -> Result<BridgeStatus, NetError> {
    if !bridge_exists().await? {
        return Ok(BridgeStatus {
            exists: false,
            ip: None,
            up: false,
        });
    }

    let output = command::exec("ip", &["addr", "show", BRIDGE_NAME], Privilege::User).await?;
    let up = output.contains("state UP") || output.contains(",UP,") || output.contains("<UP");
    let ip = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("inet "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(|s| s.to_string());

    Ok(BridgeStatus {
        exists: true,
        ip,
        up,
    })
}

async fn bridge_exists() -> Result<bool, NetError> {
    command::check("ip", &["link", "show", BRIDGE_NAME], Privilege::User).await
}

/// Ensure exactly one `POSTROUTING -s 172.16.0.0/24 -j MASQUERADE` rule
/// exists in the `nat` table. Check-before-append avoids duplicates across
/// repeated `setupBridge` calls.
async fn ensure_masquerade() -> Result<(), NetError> {
    let exists = command::check(
        "iptables",
        &[
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            VM_SUBNET_CIDR,
            "-j",
            "MASQUERADE",
        ],
        Privilege::Sudo,
    )
    .await?;

    if exists {
        return Ok(());
    }

    command::exec(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            VM_SUBNET_CIDR,
            "-j",
            "MASQUERADE",
        ],
        Privilege::Sudo,
    )
    .await?;
    info!("masquerade rule added");
    Ok(())
}

/// Insert (not append) the two FORWARD rules that let traffic move between
/// the bridge and the detected default external interface, so they precede
/// any default DROP policy further down the chain.
async fn ensure_forward_rules(default_iface: &str) -> Result<(), NetError> {
    let egress = [
        "-i",
        BRIDGE_NAME,
        "-o",
        default_iface,
        "-j",
        "ACCEPT",
    ];
    ensure_forward_rule(&egress).await?;

    let ingress = [
        "-i",
        default_iface,
        "-o",
        BRIDGE_NAME,
        "-m",
        "state",
        "--state",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ];
    ensure_forward_rule(&ingress).await?;

    Ok(())
}

async fn ensure_forward_rule(args: &[&str]) -> Result<(), NetError> {
    let mut check_args = vec!["-C", "FORWARD"];
    check_args.extend_from_slice(args);
    if command::check("iptables", &check_args, Privilege::Sudo).await? {
        return Ok(());
    }

    let mut insert_args = vec!["-I", "FORWARD", "1"];
    insert_args.extend_from_slice(args);
    command::exec("iptables", &insert_args, Privilege::Sudo).await?;
    info!(rule = ?args, "forward rule inserted");
    Ok(())
}

/// Best-effort removal of the MASQUERADE rule [`ensure_masquerade`] adds.
/// A missing rule is not an error — the goal is its absence.
async fn remove_masquerade() {
    command::exec_ignore_errors(
        "iptables",
        &[
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            VM_SUBNET_CIDR,
            "-j",
            "MASQUERADE",
        ],
        Privilege::Sudo,
    )
    .await;
}

/// Best-effort removal of the two FORWARD rules [`ensure_forward_rules`]
/// inserts, by issuing the corresponding `-D` for each.
async fn remove_forward_rules(default_iface: &str) {
    let egress = ["-i", BRIDGE_NAME, "-o", default_iface, "-j", "ACCEPT"];
    remove_forward_rule(&egress).await;

    let ingress = [
        "-i",
        default_iface,
        "-o",
        BRIDGE_NAME,
        "-m",
        "state",
        "--state",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ];
    remove_forward_rule(&ingress).await;
}

async fn remove_forward_rule(args: &[&str]) {
    let mut delete_args = vec!["-D", "FORWARD"];
    delete_args.extend_from_slice(args);
    command::exec_ignore_errors("iptables", &delete_args, Privilege::Sudo).await;
}

/// Resolve the host's default external interface by asking the kernel how
/// it would route to a fixed public sentinel and reading the `dev` word out
/// of the reply.
pub async fn default_interface() -> Result<String, NetError> {
    let output = command::exec(
        "ip",
        &["route", "get", DEFAULT_ROUTE_SENTINEL],
        Privilege::User,
    )
    .await?;

    output
        .split_whitespace()
        .skip_while(|&w| w != "dev")
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| {
            warn!(output = %output, "no default interface in route output");
            NetError::NoDefaultInterface(output.clone())
        })
}

/// `true` if `vm0br0` is absent or fully configured, never half-built.
/// Pairs with invariant 6 in the design: the bridge is either absent or
/// fully present with address, UP, forwarding, MASQUERADE, and both
/// FORWARD rules.
pub fn is_gateway_ip(candidate: &str) -> bool {
    candidate == BRIDGE_GATEWAY_IP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_gateway_ip_matches_dot_one() {
        assert!(is_gateway_ip("172.16.0.1"));
        assert!(!is_gateway_ip("172.16.0.2"));
    }

    #[tokio::test]
    async fn default_interface_parses_dev_word() {
        // Exercised indirectly through the real `ip route get` in CI hosts
        // with a default route; here we just check the parsing helper used
        // by both bridge.rs and doctor.rs agrees on format.
        let sample = "8.8.8.8 via 10.0.0.1 dev eth0 src 10.0.0.5 uid 1000";
        let iface = sample
            .split_whitespace()
            .skip_while(|&w| w != "dev")
            .nth(1);
        assert_eq!(iface, Some("eth0"));
    }
}
