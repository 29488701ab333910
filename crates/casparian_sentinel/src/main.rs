//! Casparian Flow Sentinel
//!
//! Broker for job dispatch and artifact deployment.
//!
//! Usage:
//!     casparian-sentinel --bind tcp://127.0.0.1:5555 --database sqlite:///path/to/db.sqlite

use casparian_logging::LogConfig;
use casparian_sentinel::{Sentinel, SentinelArgs, SentinelConfig};
use casparian_security::signing::LocalIdentity;
use clap::Parser;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    casparian_logging::init_logging(LogConfig {
        app_name: "casparian_sentinel",
        verbose: false,
        tui_mode: false,
    })?;

    let args = SentinelArgs::parse();

    tracing::info!("Starting Casparian Sentinel");
    tracing::info!("  Bind: {}", args.bind);
    tracing::info!("  Database: {}", args.database);
    tracing::info!("  Max workers: {}", args.max_workers);

    let identity = Arc::new(LocalIdentity::new(args.signing_secret.into_bytes(), "sentinel"));
    let mut config = SentinelConfig::new(args.bind, args.database, identity);
    config.max_workers = args.max_workers;

    let mut sentinel = Sentinel::bind(config)?;
    sentinel.run()?;

    Ok(())
}
