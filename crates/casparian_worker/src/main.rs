//! Casparian Flow Worker (Rust)
//!
//! Usage:
//!     casparian-worker --connect tcp://127.0.0.1:5555 --output ./output

use casparian_logging::LogConfig;
use casparian_worker::{bridge, Worker, WorkerArgs, WorkerConfig};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    casparian_logging::init_logging(LogConfig {
        app_name: "casparian_worker",
        verbose: false,
        tui_mode: false,
    })?;

    let args = WorkerArgs::parse();

    // Materialize bridge_shim.py at startup (fail fast if it can't be written).
    let shim_path = bridge::materialize_bridge_shim()?;
    tracing::info!("Materialized bridge shim: {}", shim_path.display());

    let worker_id = args.worker_id.unwrap_or_else(|| {
        format!("rust-{}", uuid::Uuid::new_v4().to_string().split('-').next().unwrap())
    });

    let config = WorkerConfig {
        sentinel_addr: args.connect.clone(),
        parquet_root: args.output.clone(),
        worker_id: worker_id.clone(),
        shim_path,
    };

    tracing::info!("Starting Casparian Rust Worker");
    tracing::info!("  Sentinel: {}", args.connect);
    tracing::info!("  Output: {}", args.output.display());
    tracing::info!("  Worker ID: {}", worker_id);

    let (mut worker, _handle) = Worker::connect(config)?;
    worker.run()?;

    Ok(())
}
