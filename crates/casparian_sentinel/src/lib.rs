//! Casparian Flow Sentinel: the broker that dispatches processing jobs to
//! workers over ZMQ, projects routing from deployed manifests, and runs
//! the artifact deployment pipeline.

pub mod deploy;
pub mod metrics;
pub mod queue;
pub mod routing;
pub mod sentinel;

pub use deploy::{deploy_artifact, DeployError, EnvironmentProvisioner, LazyProvisioner};
pub use metrics::METRICS;
pub use queue::{claim_for_idle_workers, Dispatch, DispatchCandidate};
pub use routing::{retag_location, ManifestRouting};
pub use sentinel::{ConnectedWorker, Sentinel, SentinelConfig};

#[derive(clap::Parser, Debug)]
#[command(name = "casparian-sentinel", about = "Broker for Casparian Flow")]
pub struct SentinelArgs {
    /// ZMQ bind address for workers
    #[arg(long, default_value_t = casparian_protocol::defaults::DEFAULT_SENTINEL_BIND_ADDR.to_string())]
    pub bind: String,

    /// Database connection string
    #[arg(long, default_value_t = casparian_protocol::defaults::DEFAULT_DB_URL.to_string())]
    pub database: String,

    /// Maximum number of workers (default 4, hard cap 8)
    #[arg(long, default_value_t = 4)]
    pub max_workers: usize,

    /// Shared secret used to verify artifact signatures (symmetric HMAC identity)
    #[arg(long, env = "CASPARIAN_SIGNING_SECRET")]
    pub signing_secret: String,
}
