//! Shared fixtures for Casparian Flow's test suites.
//!
//! Everything here builds on an in-memory SQLite store rather than a
//! Dockerized service: the dispatch core's persistence, manifest
//! deployment, and routing are all local to one process, so tests don't
//! need containers to exercise them end to end.

pub mod db;
pub mod manifests;
pub mod zmq_harness;

pub use db::test_db;
pub use manifests::{sample_environment, sample_manifest, SampleManifest};
pub use zmq_harness::LoopbackRouter;
