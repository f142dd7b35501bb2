//! Proxy Interception (X): CIDR-wide `PREROUTING` REDIRECT rules that steer
//! guest TCP/80 and TCP/443 to the local transparent proxy, plus the
//! comment-tag discipline that lets a runner tell its own rules apart from
//! everyone else's on restart.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::command::{self, Privilege};
use crate::config::{HostNetworkConfig, VM_SUBNET_CIDR};
use crate::error::NetError;

/// Ports intercepted on the VM subnet and steered to the local proxy.
const INTERCEPTED_PORTS: [u16; 2] = [80, 443];

/// A PREROUTING nat rule as parsed from `iptables-save`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    pub source: String,
    pub dest_port: u16,
    pub redirect_port: u16,
    pub comment: Option<String>,
}

/// Ensure the two REDIRECT rules for `config.proxy_port`/`config.runner_tag`
/// exist. Check-then-insert: two concurrent callers may both observe
/// "missing" and both insert, producing a harmless duplicate that the
/// Doctor collapses later — not worth stronger exclusion for a setup call
/// made at most once per runner startup.
pub async fn setup_cidr_proxy(config: &HostNetworkConfig) -> Result<(), NetError> {
    for port in INTERCEPTED_PORTS {
        let args = redirect_rule_args(config, port);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let check_args = with_leading(&["-t", "nat", "-C", "PREROUTING"], &arg_refs);
        if command::check("iptables", &check_args, Privilege::Sudo).await? {
            debug!(port, "redirect rule already present");
            continue;
        }

        let insert_args = with_leading(&["-t", "nat", "-A", "PREROUTING"], &arg_refs);
        command::exec("iptables", &insert_args, Privilege::Sudo).await?;
        info!(port, proxy_port = config.proxy_port, "redirect rule added");
    }
    Ok(())
}

/// Remove the two REDIRECT rules for `config.proxy_port`/`config.runner_tag`
/// if present. Missing rules are not an error.
pub async fn cleanup_cidr_proxy(config: &HostNetworkConfig) {
    for port in INTERCEPTED_PORTS {
        let owned = cidr_proxy_delete_args(config, port);
        let delete_args: Vec<&str> = owned.iter().map(String::as_str).collect();
        command::exec_ignore_errors("iptables", &delete_args, Privilege::Sudo).await;
    }
    info!(runner_tag = %config.runner_tag, "cidr proxy rules removed");
}

/// The `iptables -t nat -D PREROUTING ...` argv for deleting the REDIRECT
/// rule [`setup_cidr_proxy`] inserts for `port`, as owned strings so it can
/// be assembled without borrowing from a temporary.
fn cidr_proxy_delete_args(config: &HostNetworkConfig, port: u16) -> Vec<String> {
    let mut args = vec!["-t".to_string(), "nat".to_string(), "-D".to_string(), "PREROUTING".to_string()];
    args.extend(redirect_rule_args(config, port));
    args
}

/// Sweep away every PREROUTING rule tagged with `runner_tag`, regardless of
/// the port it redirects. Called at runner startup to reclaim whatever a
/// crashed previous incarnation of this same runner left behind.
pub async fn cleanup_orphaned_proxy_rules(runner_tag: &str) -> usize {
    delete_rules_matching("PREROUTING", |line| line.contains(runner_tag)).await
}

/// Defensive cleanup invoked by [`crate::tap::TapManager::create_tap`]:
/// drop any PREROUTING nat rule scoped to `ip`, in case a previous VM that
/// held this recycled address left rules behind.
pub async fn clear_rules_for_source(ip: &str) -> usize {
    let needle = format!("-s {ip}");
    let needle_cidr = format!("-s {ip}/32");
    delete_rules_matching("PREROUTING", move |line| {
        line.contains(&needle) || line.contains(&needle_cidr)
    })
    .await
}

/// List every PREROUTING rule in the `nat` table as structured
/// [`IptablesRule`]s, for the Doctor's orphan scan.
pub async fn list_nat_rules() -> Result<Vec<IptablesRule>, NetError> {
    let output = command::exec("iptables-save", &["-t", "nat"], Privilege::Sudo).await?;
    Ok(output
        .lines()
        .filter(|line| line.starts_with("-A PREROUTING"))
        .filter_map(parse_rule)
        .collect())
}

/// A rule is orphaned if its redirect target isn't a port anything is
/// listening on locally. These rules are CIDR-wide (`source` is always
/// `172.16.0.0/24`, never a per-VM address — see `setup_cidr_proxy`), so
/// port-liveness is the only criterion that applies; there is no per-VM
/// source to compare against.
pub fn find_orphans(rules: &[IptablesRule], listening_ports: &HashSet<u16>) -> Vec<IptablesRule> {
    rules
        .iter()
        .filter(|r| !listening_ports.contains(&r.redirect_port))
        .cloned()
        .collect()
}

/// `ss -ltn` output parsed into the set of locally-listening TCP ports.
pub async fn listening_tcp_ports() -> Result<HashSet<u16>, NetError> {
    let output = command::exec("ss", &["-ltn"], Privilege::User).await?;
    Ok(output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let local_addr = line.split_whitespace().nth(3)?;
            local_addr.rsplit(':').next()?.parse().ok()
        })
        .collect())
}

fn redirect_rule_args(config: &HostNetworkConfig, port: u16) -> Vec<String> {
    vec![
        "-s".to_string(),
        VM_SUBNET_CIDR.to_string(),
        "-p".to_string(),
        "tcp".to_string(),
        "--dport".to_string(),
        port.to_string(),
        "-j".to_string(),
        "REDIRECT".to_string(),
        "--to-port".to_string(),
        config.proxy_port.to_string(),
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        config.runner_tag.clone(),
    ]
}

fn with_leading<'a>(leading: &[&'a str], rest: &[&'a str]) -> Vec<&'a str> {
    let mut v = Vec::with_capacity(leading.len() + rest.len());
    v.extend_from_slice(leading);
    v.extend_from_slice(rest);
    v
}

/// Delete every `-A <chain>` line in the `nat` table matching `predicate`,
/// replacing `-A` with `-D` to produce the deletion command. Missing rules
/// (a race with another deleter, or a rule already gone) are ignored.
async fn delete_rules_matching(chain: &str, predicate: impl Fn(&str) -> bool) -> usize {
    let prefix = format!("-A {chain}");
    let output = match command::exec("iptables-save", &["-t", "nat"], Privilege::Sudo).await {
        Ok(output) => output,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for line in output.lines().filter(|l| l.starts_with(&prefix) && predicate(l)) {
        let delete_line = line.replacen("-A ", "-D ", 1);
        let args: Vec<&str> = delete_line.split_whitespace().collect();
        let mut full_args = vec!["-t", "nat"];
        full_args.extend_from_slice(&args);
        command::exec_ignore_errors("iptables", &full_args, Privilege::Sudo).await;
        removed += 1;
    }
    removed
}

/// Parse a single `-A PREROUTING ...` line from `iptables-save -t nat` into
/// an [`IptablesRule`]. Returns `None` for PREROUTING rules that aren't
/// REDIRECT rules (e.g. unrelated rules in the same chain).
fn parse_rule(line: &str) -> Option<IptablesRule> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let source = find_flag_value(&tokens, "-s")?.trim_end_matches("/32").to_string();
    let dest_port: u16 = find_flag_value(&tokens, "--dport")?.parse().ok()?;
    let jump = find_flag_value(&tokens, "-j")?;
    if jump != "REDIRECT" {
        return None;
    }
    let redirect_port: u16 = find_flag_value(&tokens, "--to-port")?.parse().ok()?;
    let comment = find_flag_value(&tokens, "--comment").map(|s| s.trim_matches('"').to_string());

    Some(IptablesRule {
        source,
        dest_port,
        redirect_port,
        comment,
    })
}

fn find_flag_value<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}
