//! Rust worker: connects to the Sentinel's ROUTER socket as a DEALER,
//! executes dispatched plugins through the host/guest bridge, and writes
//! results through `casparian_sinks`.

pub mod bridge;
pub mod cancel;
pub mod venv_manager;
pub mod worker;

pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle};

#[derive(clap::Parser, Debug)]
#[command(name = "casparian-worker", about = "Rust Worker for Casparian Flow")]
pub struct WorkerArgs {
    /// Sentinel address
    #[arg(
        long,
        default_value_t = casparian_protocol::defaults::DEFAULT_SENTINEL_BIND_ADDR.to_string()
    )]
    pub connect: String,

    /// Sink output directory
    #[arg(long, default_value = "output")]
    pub output: std::path::PathBuf,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    pub worker_id: Option<String>,
}
