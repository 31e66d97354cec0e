//! scanfleetd — the scanfleet daemon.
//!
//! Assembles the orchestration stack:
//! - Engine pool (registry + idle-selection policy)
//! - Scan queue monitor (polls the scan manager)
//! - Engine manager (the control loop)
//!
//! Cloud provider and scan-manager adapters are deployment-specific and
//! plug in behind the `scanfleet-cloud` / `scanfleet-core` traits. The
//! built-in `simulate` mode wires in-process fakes so the whole machine
//! can be watched locally:
//!
//! ```text
//! scanfleetd simulate --config scanfleet.example.toml --scans 6
//! ```

mod config;
mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use scanfleet_cloud::RetryPolicy;
use scanfleet_core::ScanManagerClient;
use scanfleet_manager::EngineManager;
use scanfleet_monitor::ScanQueueMonitor;
use scanfleet_pool::{EnginePool, policy_for};

#[derive(Parser)]
#[command(name = "scanfleetd", about = "Dynamic scan-engine fleet autoscaler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config file and print the tier table.
    CheckConfig {
        /// Path to the TOML config file.
        #[arg(long, default_value = "scanfleet.toml")]
        config: PathBuf,
    },

    /// Run the orchestrator against in-process fakes.
    Simulate {
        /// Path to the TOML config file.
        #[arg(long, default_value = "scanfleet.toml")]
        config: PathBuf,

        /// Number of scans the simulated scan manager emits.
        #[arg(long, default_value = "6")]
        scans: u64,

        /// Seconds between simulated scan arrivals.
        #[arg(long, default_value = "30")]
        arrival_secs: u64,

        /// Seconds each simulated scan stays pending (its "run time").
        #[arg(long, default_value = "120")]
        run_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scanfleetd=debug,scanfleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config } => check_config(&config),
        Command::Simulate {
            config,
            scans,
            arrival_secs,
            run_secs,
        } => run_simulation(&config, scans, arrival_secs, run_secs).await,
    }
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = config::load_config(path)?;
    let tiers = config.tier_set()?;

    println!("config ok: {}", path.display());
    println!(
        "billing interval {}s, launch timeout {}s, {} policy",
        config.billing_interval_secs,
        config.launch_timeout_secs,
        if config.terminate_on_expire {
            "terminate"
        } else {
            "stop"
        },
    );
    println!("{:<10} {:>10} {:>10} {:>9} {:>10}  instance type", "tier", "min loc", "max loc", "min idle", "max count");
    for tier in tiers.iter() {
        println!(
            "{:<10} {:>10} {:>10} {:>9} {:>10}  {}",
            tier.name, tier.min_loc, tier.max_loc, tier.min_idle, tier.max_count, tier.instance_type
        );
    }
    Ok(())
}

async fn run_simulation(
    path: &std::path::Path,
    scans: u64,
    arrival_secs: u64,
    run_secs: u64,
) -> anyhow::Result<()> {
    let config = Arc::new(config::load_config(path)?);
    let tiers = Arc::new(config.tier_set()?);
    info!(tiers = tiers.len(), scans, "starting simulation");

    let provisioner = Arc::new(sim::SimProvisioner::default());
    let client = Arc::new(sim::SimScanManager::new(&tiers, scans, arrival_secs, run_secs));
    client.login().await?;

    let pool = Arc::new(EnginePool::new(
        tiers.clone(),
        policy_for(config.idle_policy),
    ));

    let (monitor, incoming, completed) = ScanQueueMonitor::new(
        client.clone(),
        pool.clone(),
        tiers.clone(),
        RetryPolicy::from_config(&config.retry),
        config.incoming_queue_capacity,
        config.completed_queue_capacity,
    );
    let mut manager = EngineManager::new(
        pool.clone(),
        provisioner,
        client,
        tiers,
        config.clone(),
        incoming,
        completed,
    );

    let adopted = manager.reconcile(epoch_secs()).await?;
    info!(adopted, "inventory reconciled");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background loops ───────────────────────────────────────

    let monitor_handle = tokio::spawn(monitor.run(
        Duration::from_secs(config.monitor_poll_secs),
        shutdown_rx.clone(),
    ));
    let manager_handle = tokio::spawn(manager.run(
        Duration::from_secs(config.manager_cycle_secs),
        shutdown_rx.clone(),
    ));
    let status_handle = tokio::spawn(report_status(pool, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = monitor_handle.await;
    let _ = manager_handle.await;
    let _ = status_handle.await;

    info!("scanfleetd stopped");
    Ok(())
}

/// Periodic fleet status line, the ops-facing view of the pool.
async fn report_status(pool: Arc<EnginePool>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                let stats = pool.stats().await;
                for tier in &stats.tiers {
                    info!(
                        tier = %tier.tier,
                        idle = tier.idle,
                        scanning = tier.scanning,
                        expiring = tier.expiring,
                        unprovisioned = tier.unprovisioned,
                        "fleet status"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
