//! The broker: a single-threaded ROUTER event loop over one ZMQ socket,
//! owning the worker registry, the dispatch decision, and deployment.
//!
//! Everything the loop touches - worker state, queue claims, manifest
//! promotion - is owned by this one thread; long operations that would
//! otherwise block it (environment materialization, a sandbox probe) are
//! expected to run off-loop and report back, but nothing in the current
//! scope is slow enough to need that yet.

use crate::deploy::{self, EnvironmentProvisioner, LazyProvisioner};
use crate::metrics::METRICS;
use crate::queue::{self, DispatchCandidate};
use crate::routing;
use anyhow::{Context, Result};
use casparian_db::types::ProcessingJob;
use casparian_db::CasparianDb;
use casparian_protocol::types::{self, DeployCommand, DispatchCommand, ErrorPayload, HeartbeatPayload, IdentifyPayload, JobReceipt, SinkConfig};
use casparian_protocol::{JobId, JobStatus, Message, OpCode, WorkerStatus};
use casparian_security::signing::IdentityProvider;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use zmq::{Context as ZmqContext, Socket};

/// Workers silent for longer than this are declared DEAD.
const WORKER_TIMEOUT_SECS: f64 = 60.0;
/// How often the stale-worker sweep runs.
const CLEANUP_INTERVAL_SECS: f64 = 30.0;

const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;
const DISPATCH_BACKOFF_JITTER_MS: u64 = 50;

const DEFAULT_MAX_WORKERS: usize = 4;
const HARD_MAX_WORKERS: usize = 8;

/// Default byte bound for the environment cache before LRU eviction kicks in.
const DEFAULT_ENV_BYTE_BOUND: i64 = 2 * 1024 * 1024 * 1024;

fn current_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX_EPOCH")
        .as_secs_f64()
}

/// The broker's view of one connected worker.
/// `UNKNOWN -> IDENTIFIED -> IDLE <-> BUSY`, any state `-> DEAD` on
/// disconnect or heartbeat timeout.
pub struct ConnectedWorker {
    pub status: WorkerStatus,
    pub last_seen: f64,
    pub last_dispatched_at: Option<f64>,
    pub capabilities: Vec<String>,
    pub current_job_id: Option<JobId>,
    pub worker_id: String,
}

impl ConnectedWorker {
    fn new(worker_id: String, capabilities: Vec<String>) -> Self {
        Self {
            status: WorkerStatus::Identified,
            last_seen: current_time(),
            last_dispatched_at: None,
            capabilities,
            current_job_id: None,
            worker_id,
        }
    }
}

pub struct SentinelConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub max_workers: usize,
    pub identity: Arc<dyn IdentityProvider + Send + Sync>,
    pub env_byte_bound: i64,
}

impl SentinelConfig {
    pub fn new(bind_addr: impl Into<String>, database_url: impl Into<String>, identity: Arc<dyn IdentityProvider + Send + Sync>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            database_url: database_url.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            identity,
            env_byte_bound: DEFAULT_ENV_BYTE_BOUND,
        }
    }
}

pub struct Sentinel {
    _context: ZmqContext,
    socket: Socket,
    workers: HashMap<Vec<u8>, ConnectedWorker>,
    db: CasparianDb,
    identity: Arc<dyn IdentityProvider + Send + Sync>,
    provisioner: Box<dyn EnvironmentProvisioner + Send + Sync>,
    env_byte_bound: i64,
    /// Bridges the synchronous ROUTER loop to `casparian_db`'s async API
    /// without pulling the rest of the loop onto a multi-threaded executor.
    rt: tokio::runtime::Runtime,
    running: bool,
    last_cleanup: f64,
    max_workers: usize,
    dispatch_backoff_ms: u64,
    dispatch_cooldown_until: Option<Instant>,
}

impl Sentinel {
    pub fn bind(config: SentinelConfig) -> Result<Self> {
        let max_workers = if config.max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            config.max_workers.min(HARD_MAX_WORKERS)
        };

        let context = ZmqContext::new();
        let socket = context.socket(zmq::ROUTER).context("Failed to create ROUTER socket")?;
        socket.set_rcvtimeo(100).context("Failed to set receive timeout")?;
        socket.bind(&config.bind_addr).with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
        info!("Sentinel bound to {}", config.bind_addr);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("Failed to build async runtime")?;
        let db = rt
            .block_on(CasparianDb::connect(&config.database_url))
            .context("Failed to connect to database")?;

        Ok(Self {
            _context: context,
            socket,
            workers: HashMap::new(),
            db,
            identity: config.identity,
            provisioner: Box::new(LazyProvisioner),
            env_byte_bound: config.env_byte_bound,
            rt,
            running: true,
            last_cleanup: current_time(),
            max_workers,
            dispatch_backoff_ms: 0,
            dispatch_cooldown_until: None,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        self.run_with_shutdown_inner(None)
    }

    pub fn run_with_shutdown(&mut self, stop_rx: mpsc::Receiver<()>) -> Result<()> {
        self.run_with_shutdown_inner(Some(stop_rx))
    }

    fn run_with_shutdown_inner(&mut self, stop_rx: Option<mpsc::Receiver<()>>) -> Result<()> {
        while self.running {
            if let Some(rx) = &stop_rx {
                if rx.try_recv().is_ok() {
                    info!("Shutdown signal received");
                    break;
                }
            }

            if let Some((identity, msg)) = self.recv_message()? {
                METRICS.inc_messages_received();
                if let Err(e) = self.handle_message(identity, msg) {
                    error!("Error handling message: {}", e);
                    METRICS.inc_protocol_errors();
                }
            }

            self.cleanup_stale_workers();
            self.dispatch_loop()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    fn recv_message(&mut self) -> Result<Option<(Vec<u8>, Message)>> {
        let multipart = match self.socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(anyhow::anyhow!("ZMQ error: {}", e)),
        };

        let (identity, header, payload) = match multipart.len() {
            3 => (multipart[0].clone(), multipart[1].clone(), multipart[2].clone()),
            4 if multipart[1].is_empty() => (multipart[0].clone(), multipart[2].clone(), multipart[3].clone()),
            count => {
                warn!("Expected 3 or 4 frames [identity, (empty,) header, payload], got {}", count);
                return Ok(None);
            }
        };

        let msg = Message::unpack(&[header, payload])?;
        Ok(Some((identity, msg)))
    }

    fn handle_message(&mut self, identity: Vec<u8>, msg: Message) -> Result<()> {
        match msg.header.opcode {
            OpCode::Identify => {
                let payload: IdentifyPayload = serde_json::from_slice(&msg.payload)?;
                self.register_worker(identity, payload)?;
            }
            OpCode::Heartbeat => {
                let payload: HeartbeatPayload = serde_json::from_slice(&msg.payload)?;
                self.handle_heartbeat(identity, payload)?;
            }
            OpCode::Conclude => {
                let receipt: JobReceipt = serde_json::from_slice(&msg.payload)?;
                self.handle_conclude(identity, msg.header.job_id, receipt)?;
            }
            OpCode::Err => {
                let err: ErrorPayload = serde_json::from_slice(&msg.payload)?;
                self.handle_error(identity, msg.header.job_id, err)?;
            }
            OpCode::EnvReady => {
                if let Some(worker) = self.workers.get_mut(&identity) {
                    worker.last_seen = current_time();
                }
            }
            OpCode::Deploy => {
                let cmd: DeployCommand = serde_json::from_slice(&msg.payload)?;
                match self.handle_deploy(cmd) {
                    Ok(response) => self.send_deploy_response(&identity, &response)?,
                    Err(e) => {
                        error!("Deploy failed: {}", e);
                        self.send_error(&identity, &e.to_string())?;
                    }
                }
            }
            other => {
                warn!("Unhandled opcode: {:?}", other);
            }
        }
        Ok(())
    }

    fn register_worker(&mut self, identity: Vec<u8>, payload: IdentifyPayload) -> Result<()> {
        if self.workers.len() >= self.max_workers {
            let message = format!("Worker registration rejected: max_workers {} reached", self.max_workers);
            warn!("{}", message);
            self.send_error(&identity, &message)?;
            return Ok(());
        }

        let worker_id = payload.worker_id.unwrap_or_else(|| {
            let hash = casparian_security::signing::sha256(&identity);
            format!("worker-{}", &hash[..8])
        });

        let worker = ConnectedWorker::new(worker_id.clone(), payload.capabilities);
        self.workers.insert(identity, worker);
        METRICS.inc_workers_registered();
        info!("Worker registered: {}", worker_id);
        Ok(())
    }

    fn handle_heartbeat(&mut self, identity: Vec<u8>, payload: HeartbeatPayload) -> Result<()> {
        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.last_seen = current_time();
            if worker.status != WorkerStatus::Busy {
                worker.status = if payload.status.is_available() {
                    WorkerStatus::Idle
                } else {
                    WorkerStatus::Busy
                };
            }
            let (header, body) = msg_for(OpCode::Heartbeat, JobId::new(0), &payload)?;
            self.socket.send_multipart([identity.as_slice(), &header, &body], 0)?;
            METRICS.inc_messages_sent();
        } else {
            debug!(
                "Heartbeat from unknown identity ({} bytes); worker may have been reaped",
                identity.len()
            );
        }
        Ok(())
    }

    fn handle_conclude(&mut self, identity: Vec<u8>, job_id: JobId, receipt: JobReceipt) -> Result<()> {
        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.status = WorkerStatus::Idle;
            worker.current_job_id = None;
            worker.last_seen = current_time();
        }

        let job_id_i64: i64 = job_id
            .try_into()
            .map_err(|e| anyhow::anyhow!("job id {} not representable in storage: {}", job_id, e))?;

        let conclude_start = Instant::now();
        match receipt.status {
            JobStatus::Success => {
                let summary = format!("{} artifact(s)", receipt.artifacts.len());
                self.rt.block_on(self.db.complete_job(job_id_i64, Some(&summary)))?;
                METRICS.inc_jobs_completed();
                info!("Job {} completed", job_id_i64);
            }
            JobStatus::Failed => {
                let message = receipt.error_message.clone().unwrap_or_else(|| "unknown error".to_string());
                self.rt.block_on(self.db.fail_job(job_id_i64, &message, receipt.retryable))?;
                METRICS.inc_jobs_failed();
                if receipt.retryable {
                    METRICS.inc_jobs_retried();
                }
                warn!(
                    "Job {} failed ({}): {}",
                    job_id_i64,
                    if receipt.retryable { "retryable" } else { "permanent" },
                    message
                );
            }
            JobStatus::Aborted => {
                let message = receipt.error_message.unwrap_or_else(|| "aborted".to_string());
                self.rt.block_on(self.db.fail_job(job_id_i64, &message, false))?;
                METRICS.inc_jobs_failed();
                warn!("Job {} aborted: {}", job_id_i64, message);
            }
        }
        METRICS.record_conclude_time(conclude_start);
        Ok(())
    }

    fn handle_error(&mut self, identity: Vec<u8>, job_id: JobId, err: ErrorPayload) -> Result<()> {
        warn!("Worker reported error on job {}: {}", job_id, err.message);
        METRICS.inc_protocol_errors();
        if !job_id.is_unscoped() {
            if let Ok(job_id_i64) = i64::try_from(job_id) {
                self.rt.block_on(self.db.fail_job(job_id_i64, &err.message, true))?;
            }
        }
        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.status = WorkerStatus::Idle;
            worker.current_job_id = None;
        }
        Ok(())
    }

    /// Remove workers silent for longer than `WORKER_TIMEOUT_SECS`, failing
    /// any job they held as retryable (spec: BUSY -> DEAD on disconnect
    /// fails the current job retryable).
    fn cleanup_stale_workers(&mut self) {
        let now = current_time();
        if now - self.last_cleanup < CLEANUP_INTERVAL_SECS {
            return;
        }
        self.last_cleanup = now;

        let cutoff = now - WORKER_TIMEOUT_SECS;
        let dead: Vec<(Vec<u8>, Option<JobId>)> = self
            .workers
            .iter()
            .filter(|(_, w)| w.last_seen < cutoff)
            .map(|(id, w)| (id.clone(), w.current_job_id))
            .collect();

        for (identity, current_job_id) in dead {
            if let Some(job_id) = current_job_id {
                if let Ok(job_id_i64) = i64::try_from(job_id) {
                    if let Err(e) = self.rt.block_on(self.db.fail_job(job_id_i64, "worker went silent", true)) {
                        error!("Failed to fail orphaned job {}: {}", job_id_i64, e);
                        METRICS.inc_db_errors();
                    }
                }
            }
            self.workers.remove(&identity);
            METRICS.inc_workers_cleaned_up();
            warn!("Worker evicted for missed heartbeats");
        }
    }

    /// Claim one job for an idle, capable worker and dispatch it, per loop
    /// tick. Backs off with jitter when nothing was claimed so an empty
    /// queue doesn't spin the loop against the database.
    fn dispatch_loop(&mut self) -> Result<()> {
        if let Some(cooldown_until) = self.dispatch_cooldown_until {
            if Instant::now() < cooldown_until {
                return Ok(());
            }
        }

        let idle: Vec<Vec<u8>> = self
            .workers
            .iter()
            .filter(|(_, w)| w.status == WorkerStatus::Idle)
            .map(|(id, _)| id.clone())
            .collect();

        if idle.is_empty() {
            return Ok(());
        }

        let candidates: Vec<DispatchCandidate> = idle
            .iter()
            .map(|identity| {
                let worker = &self.workers[identity];
                DispatchCandidate {
                    identity,
                    capabilities: &worker.capabilities,
                    last_dispatched_at: worker.last_dispatched_at,
                }
            })
            .collect();

        let dispatch = self.rt.block_on(queue::claim_for_idle_workers(&self.db, candidates))?;

        match dispatch {
            Some(d) => {
                self.assign_job(d.identity, d.job)?;
                self.dispatch_backoff_ms = 0;
                self.dispatch_cooldown_until = None;
            }
            None => self.schedule_dispatch_backoff(),
        }
        Ok(())
    }

    fn schedule_dispatch_backoff(&mut self) {
        let next = if self.dispatch_backoff_ms == 0 {
            DISPATCH_BACKOFF_BASE_MS
        } else {
            (self.dispatch_backoff_ms * 2).min(DISPATCH_BACKOFF_MAX_MS)
        };
        self.dispatch_backoff_ms = next;

        let jitter_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 % DISPATCH_BACKOFF_JITTER_MS)
            .unwrap_or(0);
        self.dispatch_cooldown_until = Some(Instant::now() + Duration::from_millis(next + jitter_ms));
    }

    fn assign_job(&mut self, identity: Vec<u8>, job: ProcessingJob) -> Result<()> {
        let dispatch_start = Instant::now();
        let job_id = JobId::try_from(job.id).map_err(|e| anyhow::anyhow!("invalid job id {}: {}", job.id, e))?;

        let version = self
            .rt
            .block_on(self.db.get_file_version(job.file_version_id))?
            .context("dispatch: file version not found for job")?;
        let location = self
            .rt
            .block_on(self.db.get_file_location(version.location_id))?
            .context("dispatch: file location not found for job")?;

        let manifest = self
            .rt
            .block_on(self.db.active_manifest_for_plugin(&job.plugin_name))?
            .with_context(|| format!("dispatch: no ACTIVE manifest for plugin '{}'", job.plugin_name))?;

        let topic_configs = self.rt.block_on(self.db.topic_configs_for_plugin(&job.plugin_name))?;
        let sinks: Vec<SinkConfig> = topic_configs
            .into_iter()
            .map(|tc| SinkConfig {
                topic: tc.topic_name,
                uri: tc.uri,
                mode: tc.mode.parse().unwrap_or_default(),
                quarantine_config: None,
                schema: None,
            })
            .collect();

        let cmd = DispatchCommand {
            plugin_name: job.plugin_name.clone(),
            parser_version: Some(manifest.version.clone()),
            file_path: location.rel_path,
            file_version_id: job.file_version_id,
            sinks,
            env_hash: manifest.env_hash.clone(),
            source_code: Some(manifest.source_code.clone()),
            artifact_hash: manifest.artifact_hash.clone(),
        };

        let (header, body) = msg_for(OpCode::Dispatch, job_id, &cmd)?;
        self.socket.send_multipart([identity.as_slice(), &header, &body], 0)?;

        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.status = WorkerStatus::Busy;
            worker.current_job_id = Some(job_id);
            worker.last_dispatched_at = Some(current_time());
        }

        METRICS.inc_jobs_dispatched();
        METRICS.inc_messages_sent();
        METRICS.record_dispatch_time(dispatch_start);
        info!("Dispatched job {} ({})", job.id, job.plugin_name);
        Ok(())
    }

    fn handle_deploy(&mut self, cmd: DeployCommand) -> Result<types::DeployResponse> {
        info!("Deploying {} v{} from {}", cmd.plugin_name, cmd.version, cmd.publisher_name);
        let identity = Arc::clone(&self.identity);
        let provisioner = &*self.provisioner;
        let response = self.rt.block_on(deploy::deploy_artifact(
            &self.db,
            identity.as_ref(),
            provisioner,
            self.env_byte_bound,
            &cmd,
        ))?;
        if !response.success {
            METRICS.inc_manifests_rejected();
        }
        Ok(response)
    }

    /// Re-tag a single location after the scanner observes new contents,
    /// enqueuing jobs for newly-subscribed plugins. Called by whatever
    /// drives the scan loop; exposed here so the projector and the dispatch
    /// loop share one `CasparianDb` handle rather than opening a second
    /// connection pool.
    pub fn retag_location(
        &mut self,
        location_id: i64,
        file_name: &str,
        content_hash: &str,
        size_bytes: i64,
        modified_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Option<i64>> {
        Ok(self
            .rt
            .block_on(routing::retag_location(&self.db, location_id, file_name, content_hash, size_bytes, modified_time))?)
    }

    fn send_error(&mut self, identity: &[u8], message: &str) -> Result<()> {
        let payload = ErrorPayload { message: message.to_string(), traceback: None };
        let (header, body) = msg_for(OpCode::Err, JobId::new(0), &payload)?;
        self.socket.send_multipart([identity, &header, &body], 0)?;
        Ok(())
    }

    fn send_deploy_response(&mut self, identity: &[u8], response: &types::DeployResponse) -> Result<()> {
        let (header, body) = msg_for(OpCode::Ack, JobId::new(0), response)?;
        self.socket.send_multipart([identity, &header, &body], 0)?;
        Ok(())
    }
}

fn msg_for(opcode: OpCode, job_id: JobId, payload: &impl serde::Serialize) -> Result<(Vec<u8>, Vec<u8>)> {
    let bytes = serde_json::to_vec(payload)?;
    let msg = Message::new(opcode, job_id, bytes)?;
    Ok(msg.pack()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_security::signing::LocalIdentity;

    fn test_config(bind_addr: &str, db_url: &str) -> SentinelConfig {
        SentinelConfig::new(bind_addr, db_url, Arc::new(LocalIdentity::new(b"test-secret".to_vec(), "test")))
    }

    #[test]
    fn bind_connects_to_an_in_memory_database() {
        let sentinel = Sentinel::bind(test_config("tcp://127.0.0.1:*", "sqlite::memory:"));
        assert!(sentinel.is_ok());
    }

    #[test]
    fn max_workers_is_capped_at_hard_limit() {
        let mut config = test_config("tcp://127.0.0.1:*", "sqlite::memory:");
        config.max_workers = 100;
        let sentinel = Sentinel::bind(config).unwrap();
        assert_eq!(sentinel.max_workers, HARD_MAX_WORKERS);
    }

    #[test]
    fn stop_flips_running_flag() {
        let mut sentinel = Sentinel::bind(test_config("tcp://127.0.0.1:*", "sqlite::memory:")).unwrap();
        assert!(sentinel.running);
        sentinel.stop();
        assert!(!sentinel.running);
    }
}
