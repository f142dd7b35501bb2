//! `vm0-netdoctor`: the operator-facing surface over the `Doctor`/
//! `Reconciler` component — status, reconcile, and preflight subcommands.

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

use vm0_net::config::HostNetworkConfig;
use vm0_net::error::NetError;
use vm0_net::{bridge, doctor, pool::IpPool, preflight, proxy};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vm0-netdoctor", version)]
struct Cli {
    /// Runtime directory holding the IP registry and lock file.
    #[arg(long, default_value = vm0_net::config::DEFAULT_RUN_DIR)]
    run_dir: std::path::PathBuf,

    /// This runner's name, used to build its `vm0:runner:<name>` rule tag.
    #[arg(long, default_value = "default")]
    runner_name: String,

    /// Local port the transparent proxy listens on.
    #[arg(long, default_value_t = 8080)]
    proxy_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a human-readable report of bridge, TAP, IP, and NAT state.
    Status,
    /// Reconcile persistent state with the kernel: sweep this runner's
    /// orphaned proxy rules, reclaim orphaned IP allocations, then flush
    /// the bridge ARP cache, in that order.
    Reconcile,
    /// Verify required commands, sudo access, and the runtime directory.
    Preflight,
    /// Idempotently (re)create the bridge and its NAT/forwarding rules.
    SetupBridge,
    /// Best-effort removal of the bridge, its MASQUERADE rule, and its
    /// FORWARD rules. Not part of normal runner lifecycle; for test
    /// cleanup and manual operator teardown.
    TeardownBridge,
    /// Ensure this runner's CIDR-wide proxy interception rules exist.
    SetupProxy,
    /// Remove this runner's CIDR-wide proxy interception rules.
    TeardownProxy,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();
    let config = HostNetworkConfig::new(cli.run_dir, cli.runner_name).with_proxy_port(cli.proxy_port);

    let result = match cli.command {
        Command::Status => run_status(&config).await,
        Command::Reconcile => run_reconcile(&config).await,
        Command::Preflight => run_preflight(&config).await,
        Command::SetupBridge => bridge::setup_bridge().await,
        Command::TeardownBridge => bridge::teardown_bridge().await,
        Command::SetupProxy => proxy::setup_cidr_proxy(&config).await,
        Command::TeardownProxy => {
            proxy::cleanup_cidr_proxy(&config).await;
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_status(config: &HostNetworkConfig) -> Result<(), NetError> {
    let report = doctor::status(config).await?;
    print!("{report}");
    Ok(())
}

async fn run_reconcile(config: &HostNetworkConfig) -> Result<(), NetError> {
    let pool = IpPool::new(config);
    let report = doctor::reconcile(&pool, config).await?;

    println!("swept {} orphaned proxy rule(s)", report.swept_proxy_rules);
    println!(
        "reclaimed {} orphaned ip allocation(s)",
        report.reclaimed_allocations
    );
    println!(
        "flushed {} bridge arp entr(y/ies)",
        report.flushed_arp_entries
    );
    Ok(())
}

async fn run_preflight(config: &HostNetworkConfig) -> Result<(), NetError> {
    preflight::check(config).await?;
    println!("preflight ok");
    Ok(())
}
