use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use brick_snap::context::{DEFAULT_RUN_DIR, NodeIdentity, RetryPolicy, SnapConfig, SnapContext};
use brick_snap::host::PROC_MOUNTS;
use brick_snap::metrics;
use brick_snap::service::{BrickReport, DEFAULT_MAX_CONCURRENT_OPS, SnapState, SnapshotService};

#[derive(Parser, Debug)]
#[command(name = "brick-snap")]
#[command(about = "Brick snapshot management for LVM thin, Btrfs and ZFS bricks")]
struct Args {
    /// Snapshot state file (JSON)
    #[arg(long, env = "SNAP_STATE", default_value = "/var/lib/glusterd/snaps/brick-snap.json")]
    state: PathBuf,

    /// Runtime directory for private mounts and brick pid files
    #[arg(long, env = "SNAP_RUN_DIR", default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    /// Mount table to resolve brick devices from
    #[arg(long, default_value = PROC_MOUNTS)]
    mount_table: PathBuf,

    /// Unmount attempts while removing a snapshot
    #[arg(long, default_value = "3")]
    umount_retries: u32,

    /// Seconds to wait between unmount attempts
    #[arg(long, default_value = "3")]
    umount_retry_delay_secs: u64,

    /// UUID of this node; missed operations for other nodes are skipped
    #[arg(long, env = "NODE_UUID")]
    node_uuid: Option<Uuid>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Maximum concurrent brick operations
    #[arg(long, env = "MAX_CONCURRENT_OPS", default_value_t = DEFAULT_MAX_CONCURRENT_OPS)]
    max_concurrent_ops: usize,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report which backend claims each brick path
    Probe {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Take snapshots of the local bricks of a snapshot volume
    Create { volume: String },
    /// Mount the local bricks of a snapshot volume
    Mount { volume: String },
    /// Report capacity figures for the local bricks of a snapshot volume
    Details { volume: String },
    /// Stop, unmount and destroy the local bricks of a snapshot volume
    Remove { volume: String },
    /// Replay missed operations addressed to this node
    Missed,
}

#[derive(Serialize)]
struct DetailsOutput {
    details: brick_snap::brick::ResponseMap,
    bricks: Vec<BrickReport>,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check_reports(reports: &[BrickReport]) -> Result<(), Box<dyn std::error::Error>> {
    let failed = reports.iter().filter(|r| r.is_failure()).count();
    if failed > 0 {
        return Err(format!("{} of {} brick operation(s) failed", failed, reports.len()).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level; stdout carries reports
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let config = SnapConfig {
        run_dir: args.run_dir.clone(),
        mount_table: args.mount_table.clone(),
        umount_retry: RetryPolicy::new(
            args.umount_retries.max(1),
            Duration::from_secs(args.umount_retry_delay_secs),
        ),
    };
    let node = NodeIdentity::local(args.node_uuid);

    info!("Node: {}", node);
    info!("State file: {}", args.state.display());
    info!("Run directory: {}", config.run_dir.display());
    info!("Max concurrent operations: {}", args.max_concurrent_ops);

    let ctx = SnapContext::host(node, config);
    let service = SnapshotService::with_concurrency_limit(ctx, args.max_concurrent_ops);

    // Probing works on paths only and leaves the state file alone
    let mut state = match &args.command {
        Command::Probe { .. } => SnapState::default(),
        _ => SnapState::load(&args.state).await?,
    };

    let reports = match &args.command {
        Command::Probe { paths } => {
            let reports = service.probe_paths(paths.clone()).await;
            return print_json(&reports);
        }
        Command::Create { volume } => {
            let vol = state.volume_mut(volume)?;
            let reports = service.create_volume(vol).await;
            print_json(&reports)?;
            reports
        }
        Command::Mount { volume } => {
            let vol = state.volume_mut(volume)?;
            let reports = service.mount_volume(vol).await;
            print_json(&reports)?;
            reports
        }
        Command::Details { volume } => {
            let vol = state.volume_mut(volume)?;
            let (details, bricks) = service.details_volume(vol).await;
            let output = DetailsOutput { details, bricks };
            print_json(&output)?;
            output.bricks
        }
        Command::Remove { volume } => {
            let vol = state.volume_mut(volume)?;
            let reports = service.remove_volume(vol).await;
            if state.settle_removal(volume, &reports) {
                info!(volume = %volume, "Snapshot volume removed from state");
            }
            print_json(&reports)?;
            reports
        }
        Command::Missed => {
            let reports = service.replay_missed(&mut state).await;
            print_json(&reports)?;
            reports
        }
    };

    state.save(&args.state).await?;
    check_reports(&reports)
}
