//! Casparian Flow launcher.
//!
//! Thin binary wrapping the broker and worker crates: run either
//! standalone (for a distributed deployment) or together in one process
//! for local development.

use anyhow::Result;
use casparian_logging::LogConfig;
use casparian_sentinel::{Sentinel, SentinelArgs, SentinelConfig};
use casparian_security::signing::LocalIdentity;
use casparian_worker::{bridge, Worker, WorkerArgs, WorkerConfig};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "casparian", about = "Launcher for the Casparian Flow broker and worker")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start both the Sentinel broker and a Worker in one process
    Run {
        /// ZMQ bind/connect address shared by the broker and the worker
        #[arg(long, default_value_t = casparian_protocol::defaults::DEFAULT_SENTINEL_BIND_ADDR.to_string())]
        addr: String,

        /// Database connection string
        #[arg(long, default_value_t = casparian_protocol::defaults::DEFAULT_DB_URL.to_string())]
        database: String,

        /// Sink output directory
        #[arg(long, default_value = "output")]
        output: std::path::PathBuf,

        /// Shared secret used to verify artifact signatures
        #[arg(long, env = "CASPARIAN_SIGNING_SECRET")]
        signing_secret: String,
    },

    /// Start only the Sentinel (broker / control plane)
    Sentinel {
        #[command(flatten)]
        args: SentinelArgs,
    },

    /// Start only the Worker (data plane)
    Worker {
        #[command(flatten)]
        args: WorkerArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    casparian_logging::init_logging(LogConfig {
        app_name: "casparian",
        verbose: cli.verbose,
        tui_mode: false,
    })?;

    match cli.command {
        Commands::Run { addr, database, output, signing_secret } => run_unified(addr, database, output, signing_secret),
        Commands::Sentinel { args } => run_sentinel_standalone(args),
        Commands::Worker { args } => run_worker_standalone(args),
    }
}

fn install_shutdown_signal(flag: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, initiating shutdown...", sig);
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            flag.store(true, Ordering::SeqCst);
        })?;
    }

    Ok(())
}

/// Run the Sentinel and a Worker in one process, wired to the same address.
fn run_unified(addr: String, database: String, output: std::path::PathBuf, signing_secret: String) -> Result<()> {
    std::fs::create_dir_all(&output)?;
    info!("Starting Casparian (Sentinel + Worker)");
    info!("  Address: {}", addr);
    info!("  Database: {}", database);
    info!("  Output: {}", output.display());

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    install_shutdown_signal(shutdown_flag.clone())?;

    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let sentinel_addr = addr.clone();
    let sentinel_db = database.clone();
    let identity = Arc::new(LocalIdentity::new(signing_secret.into_bytes(), "sentinel"));
    let sentinel_thread = std::thread::spawn(move || -> Result<()> {
        let config = SentinelConfig::new(sentinel_addr, sentinel_db, identity);
        let mut sentinel = Sentinel::bind(config)?;
        let _ = ready_tx.send(());
        sentinel.run_with_shutdown(stop_rx)
    });

    let shim_path = bridge::materialize_bridge_shim()?;
    let worker_id = format!("rust-{}", &uuid::Uuid::new_v4().to_string()[..8]);
    let worker_config = WorkerConfig {
        sentinel_addr: addr,
        parquet_root: output,
        worker_id,
        shim_path,
    };

    ready_rx.recv().map_err(|_| anyhow::anyhow!("Sentinel failed to start"))?;

    let (mut worker, worker_handle) = Worker::connect(worker_config).map_err(|e| anyhow::anyhow!(e))?;
    let worker_thread = std::thread::spawn(move || worker.run().map_err(|e| anyhow::anyhow!(e)));

    while !shutdown_flag.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if sentinel_thread.is_finished() {
            error!("Sentinel thread terminated unexpectedly");
            break;
        }
        if worker_thread.is_finished() {
            error!("Worker thread terminated unexpectedly");
            break;
        }
    }

    info!("Initiating graceful shutdown (timeout: {}s)...", SHUTDOWN_TIMEOUT_SECS);
    info!("Stopping Worker (waiting for active jobs to complete)...");
    worker_handle.shutdown();
    match worker_thread.join() {
        Ok(Ok(())) => info!("Worker stopped gracefully"),
        Ok(Err(e)) => warn!("Worker shutdown error: {}", e),
        Err(_) => warn!("Worker thread panicked"),
    }

    info!("Stopping Sentinel...");
    let _ = stop_tx.send(());
    match sentinel_thread.join() {
        Ok(Ok(())) => info!("Sentinel stopped gracefully"),
        Ok(Err(e)) => warn!("Sentinel shutdown error: {}", e),
        Err(_) => warn!("Sentinel thread panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Run the Sentinel standalone (for a distributed deployment).
fn run_sentinel_standalone(args: SentinelArgs) -> Result<()> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    install_shutdown_signal(shutdown_flag.clone())?;

    let identity = Arc::new(LocalIdentity::new(args.signing_secret.into_bytes(), "sentinel"));
    let mut config = SentinelConfig::new(args.bind, args.database, identity);
    config.max_workers = args.max_workers;
    let mut sentinel = Sentinel::bind(config)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    std::thread::spawn(move || {
        while !shutdown_flag.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        let _ = stop_tx.send(());
    });

    sentinel.run_with_shutdown(stop_rx)
}

/// Run a Worker standalone (for a distributed deployment).
fn run_worker_standalone(args: WorkerArgs) -> Result<()> {
    let shim_path = bridge::materialize_bridge_shim().map_err(|e| anyhow::anyhow!(e))?;
    let worker_id = args.worker_id.unwrap_or_else(|| format!("rust-{}", &uuid::Uuid::new_v4().to_string()[..8]));

    let config = WorkerConfig {
        sentinel_addr: args.connect,
        parquet_root: args.output,
        worker_id,
        shim_path,
    };

    let (mut worker, worker_handle) = Worker::connect(config).map_err(|e| anyhow::anyhow!(e))?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    install_shutdown_signal(shutdown_flag.clone())?;
    std::thread::spawn(move || {
        while !shutdown_flag.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        worker_handle.shutdown();
    });

    worker.run().map_err(|e| anyhow::anyhow!(e))
}
