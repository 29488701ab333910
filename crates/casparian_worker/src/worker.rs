//! Worker event loop: connects to the Sentinel over a DEALER socket, handles
//! DISPATCH/PREPARE_ENV/ABORT/RELOAD, and reports back over HEARTBEAT/CONCLUDE.
//!
//! The loop itself never blocks on a job: `execute_job` runs on a dedicated
//! thread so ABORT and HEARTBEAT keep flowing while a plugin executes.

use anyhow::{Context, Result};
use casparian_protocol::types::{
    ArtifactRef, DispatchCommand, EnvReadyPayload, ErrorPayload, HeartbeatPayload,
    HeartbeatStatus, IdentifyPayload, JobReceipt, JobStatus, PrepareEnvCommand,
};
use casparian_protocol::{JobId, Message, OpCode};
use casparian_sinks::open_sink;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use zmq::{Context as ZmqContext, Socket};

use crate::bridge::{self, BridgeConfig};
use crate::cancel::CancellationToken;
use crate::venv_manager::VenvManager;

const RECV_TIMEOUT_MS: i32 = 100;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Protocol(#[from] casparian_protocol::error::ProtocolError),
    #[error(transparent)]
    Zmq(#[from] zmq::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub sentinel_addr: String,
    pub parquet_root: PathBuf,
    pub worker_id: String,
    pub shim_path: PathBuf,
}

/// A job running on its own thread. The main loop polls `handle` for
/// completion and can flip `cancel_token` at any time in response to ABORT.
struct RunningJob {
    job_id: JobId,
    env_hash: Option<String>,
    cancel_token: CancellationToken,
    handle: JoinHandle<JobReceipt>,
}

/// Handle returned by [`Worker::connect`]; lets a caller signal shutdown from
/// another thread without reaching into socket internals.
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

pub struct Worker {
    config: WorkerConfig,
    _context: ZmqContext,
    socket: Socket,
    venv_manager: Arc<Mutex<VenvManager>>,
    running_job: Option<RunningJob>,
    last_heartbeat: Instant,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl Worker {
    /// Connect the DEALER socket and send the initial IDENTIFY.
    pub fn connect(config: WorkerConfig) -> WorkerResult<(Self, WorkerHandle)> {
        let context = ZmqContext::new();
        let socket = context
            .socket(zmq::DEALER)
            .context("Failed to create DEALER socket")?;
        socket
            .set_identity(config.worker_id.as_bytes())
            .context("Failed to set socket identity")?;
        socket
            .connect(&config.sentinel_addr)
            .with_context(|| format!("Failed to connect to Sentinel at {}", config.sentinel_addr))?;
        socket
            .set_rcvtimeo(RECV_TIMEOUT_MS)
            .context("Failed to set socket receive timeout")?;

        info!(
            "Worker '{}' connected to Sentinel at {}",
            config.worker_id, config.sentinel_addr
        );

        let venv_manager = VenvManager::new().context("Failed to initialize venv manager")?;

        let mut worker = Self {
            config,
            _context: context,
            socket,
            venv_manager: Arc::new(Mutex::new(venv_manager)),
            running_job: None,
            last_heartbeat: Instant::now(),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        worker.send_identify()?;

        let handle = WorkerHandle {
            shutdown: worker.shutdown.clone(),
        };
        Ok((worker, handle))
    }

    fn send_identify(&self) -> WorkerResult<()> {
        let payload = IdentifyPayload {
            capabilities: vec!["*".to_string()],
            worker_id: Some(self.config.worker_id.clone()),
        };
        self.send_message(OpCode::Identify, JobId::new(0), &payload)
    }

    /// Run the worker loop until `shutdown()` is called on the associated
    /// [`WorkerHandle`] or the socket is closed out from under us.
    pub fn run(&mut self) -> WorkerResult<()> {
        info!("Worker '{}' entering event loop", self.config.worker_id);

        while !self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            self.poll_running_job();

            match self.recv_message() {
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle_message(msg) {
                        error!("Worker '{}': error handling message: {}", self.config.worker_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Worker '{}': recv error: {}", self.config.worker_id, e);
                }
            }

            self.maybe_send_heartbeat();
        }

        info!("Worker '{}' shutting down", self.config.worker_id);
        Ok(())
    }

    /// Check whether the in-flight job thread has finished and, if so, send
    /// its CONCLUDE.
    fn poll_running_job(&mut self) {
        let finished = match &self.running_job {
            Some(job) => job.handle.is_finished(),
            None => false,
        };
        if !finished {
            return;
        }

        let job = self.running_job.take().expect("checked finished above");
        let job_id = job.job_id;
        let receipt = match job.handle.join() {
            Ok(receipt) => receipt,
            Err(panic) => {
                error!("Worker '{}': job {} thread panicked: {:?}", self.config.worker_id, job_id, panic);
                JobReceipt {
                    status: JobStatus::Failed,
                    metrics: HashMap::new(),
                    artifacts: vec![],
                    error_message: Some("worker thread panicked".to_string()),
                    retryable: true,
                }
            }
        };

        if let Err(e) = self.send_message(OpCode::Conclude, job_id, &receipt) {
            error!("Worker '{}': failed to send CONCLUDE for job {}: {}", self.config.worker_id, job_id, e);
        }
    }

    fn maybe_send_heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < HEARTBEAT_INTERVAL {
            return;
        }

        let (status, current_job_id) = match &self.running_job {
            Some(job) => (HeartbeatStatus::Busy, Some(job.job_id)),
            None => (HeartbeatStatus::Idle, None),
        };

        let payload = HeartbeatPayload { status, current_job_id };
        if let Err(e) = self.send_message(OpCode::Heartbeat, JobId::new(0), &payload) {
            warn!("Worker '{}': failed to send heartbeat: {}", self.config.worker_id, e);
        }
        self.last_heartbeat = Instant::now();
    }

    fn handle_message(&mut self, msg: Message) -> Result<()> {
        let job_id = msg.header.job_id;
        match msg.header.opcode {
            OpCode::Dispatch => {
                let cmd: DispatchCommand = serde_json::from_slice(&msg.payload)
                    .context("Failed to deserialize DispatchCommand")?;
                self.start_job(job_id, cmd)
            }
            OpCode::PrepareEnv => {
                let cmd: PrepareEnvCommand = serde_json::from_slice(&msg.payload)
                    .context("Failed to deserialize PrepareEnvCommand")?;
                self.prepare_env(cmd)
            }
            OpCode::Abort => {
                self.handle_abort(job_id);
                Ok(())
            }
            OpCode::Reload => {
                info!("Worker '{}': received RELOAD (no-op, plugins are dispatched per-job)", self.config.worker_id);
                Ok(())
            }
            OpCode::Err => {
                let payload: ErrorPayload = serde_json::from_slice(&msg.payload)
                    .unwrap_or(ErrorPayload { message: "(unparsable ERR payload)".to_string(), traceback: None });
                warn!("Worker '{}': received ERR from Sentinel: {}", self.config.worker_id, payload.message);
                Ok(())
            }
            other => {
                warn!("Worker '{}': unhandled opcode {:?}", self.config.worker_id, other);
                Ok(())
            }
        }
    }

    /// ABORT only affects the currently running job; a stale ABORT for a job
    /// that already concluded is a no-op.
    fn handle_abort(&mut self, job_id: JobId) {
        match &self.running_job {
            Some(job) if job.job_id == job_id => {
                info!("Worker '{}': aborting job {}", self.config.worker_id, job_id);
                job.cancel_token.cancel();
            }
            Some(job) => {
                warn!(
                    "Worker '{}': received ABORT for job {} but job {} is running",
                    self.config.worker_id, job_id, job.job_id
                );
            }
            None => {
                warn!("Worker '{}': received ABORT for job {} with no job running", self.config.worker_id, job_id);
            }
        }
    }

    fn start_job(&mut self, job_id: JobId, cmd: DispatchCommand) -> Result<()> {
        if let Some(job) = &self.running_job {
            anyhow::bail!(
                "Worker '{}' received DISPATCH for job {} while job {} is still running",
                self.config.worker_id,
                job_id,
                job.job_id
            );
        }

        let interpreter_path = match &cmd.env_hash {
            Some(env_hash) => {
                let mut venv_manager = self
                    .venv_manager
                    .lock()
                    .map_err(|_| anyhow::anyhow!("venv manager lock poisoned"))?;
                if !venv_manager.exists(env_hash) {
                    anyhow::bail!(
                        "Environment {} is not materialized; Sentinel should PREPARE_ENV before DISPATCH",
                        env_hash
                    );
                }
                venv_manager.interpreter_path(env_hash)
            }
            None => which::which("python3").context("No env_hash given and python3 not found on PATH")?,
        };

        let source_code = cmd
            .source_code
            .clone()
            .context("DispatchCommand is missing source_code")?;

        let cancel_token = CancellationToken::new();
        let worker_id = self.config.worker_id.clone();
        let shim_path = self.config.shim_path.clone();
        let output_root = self.config.parquet_root.clone();
        let job_cancel_token = cancel_token.clone();

        let handle = std::thread::Builder::new()
            .name(format!("casparian-job-{}", job_id))
            .spawn(move || {
                execute_job(
                    job_id,
                    cmd,
                    interpreter_path,
                    source_code,
                    shim_path,
                    output_root,
                    job_cancel_token,
                    &worker_id,
                )
            })
            .context("Failed to spawn job execution thread")?;

        self.running_job = Some(RunningJob {
            job_id,
            env_hash: cmd.env_hash.clone(),
            cancel_token,
            handle,
        });
        Ok(())
    }

    fn prepare_env(&mut self, cmd: PrepareEnvCommand) -> Result<()> {
        let protected_hash = self
            .running_job
            .as_ref()
            .and_then(|job| job.env_hash.as_deref());
        let protected: &[&str] = match &protected_hash {
            Some(h) => std::slice::from_ref(h),
            None => &[],
        };
        let result = {
            let mut venv_manager = self
                .venv_manager
                .lock()
                .map_err(|_| anyhow::anyhow!("venv manager lock poisoned"))?;

            let cached = venv_manager.exists(&cmd.env_hash);
            venv_manager
                .get_or_create(
                    &cmd.env_hash,
                    &cmd.lockfile_content,
                    cmd.python_version.as_deref(),
                    protected,
                )
                .map(|path| (path, cached))
        };

        match result {
            Ok((interpreter_path, cached)) => {
                let payload = EnvReadyPayload {
                    env_hash: cmd.env_hash,
                    interpreter_path: interpreter_path.display().to_string(),
                    cached,
                };
                self.send_message(OpCode::EnvReady, JobId::new(0), &payload)
                    .map_err(anyhow::Error::from)
            }
            Err(e) => {
                let payload = ErrorPayload {
                    message: format!("Failed to prepare environment {}: {}", cmd.env_hash, e),
                    traceback: None,
                };
                self.send_message(OpCode::Err, JobId::new(0), &payload)
                    .map_err(anyhow::Error::from)
            }
        }
    }

    /// Receive one frame pair (header, payload) from the DEALER socket.
    /// Returns `Ok(None)` on timeout (EAGAIN), which is the normal idle path.
    fn recv_message(&self) -> WorkerResult<Option<Message>> {
        let frames = match self.socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(WorkerError::Zmq(e)),
        };

        if frames.len() < 2 {
            warn!(
                "Worker '{}': received malformed multipart message with {} frames",
                self.config.worker_id,
                frames.len()
            );
            return Ok(None);
        }

        let msg = Message::unpack(&frames)?;
        Ok(Some(msg))
    }

    fn send_message<T: serde::Serialize>(&self, opcode: OpCode, job_id: JobId, payload: &T) -> WorkerResult<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| WorkerError::Message(format!("Failed to serialize {:?} payload: {}", opcode, e)))?;
        let msg = Message::new(opcode, job_id, body)?;
        let (header, payload) = msg.pack()?;
        self.socket
            .send_multipart([header, payload], 0)
            .map_err(WorkerError::Zmq)
    }
}

/// Runs on a dedicated thread: execute the bridge, write outputs, and build
/// the CONCLUDE receipt. Never panics across the boundary that matters (the
/// caller treats a thread panic as a FAILED receipt anyway).
#[allow(clippy::too_many_arguments)]
fn execute_job(
    job_id: JobId,
    cmd: DispatchCommand,
    interpreter_path: PathBuf,
    source_code: String,
    shim_path: PathBuf,
    output_root: PathBuf,
    cancel_token: CancellationToken,
    worker_id: &str,
) -> JobReceipt {
    info!("Worker '{}': starting job {} ({})", worker_id, job_id, cmd.plugin_name);

    let bridge_config = BridgeConfig {
        interpreter_path,
        source_code,
        file_path: cmd.file_path.clone(),
        job_id,
        file_id: cmd.file_version_id,
        shim_path,
        inherit_stdio: false,
        cancel_token: cancel_token.clone(),
    };

    let bridge_result = match bridge::execute_bridge(bridge_config) {
        Ok(result) => result,
        Err(e) => {
            let aborted = cancel_token.is_cancelled();
            return JobReceipt {
                status: if aborted { JobStatus::Aborted } else { JobStatus::Failed },
                metrics: HashMap::new(),
                artifacts: vec![],
                error_message: Some(e.to_string()),
                retryable: !aborted,
            };
        }
    };

    let mut artifacts = Vec::new();
    let mut total_rows: i64 = 0;

    for (idx, sink_config) in cmd.sinks.iter().enumerate() {
        let Some(batches) = bridge_result.output_batches.get(idx) else {
            continue;
        };
        if batches.is_empty() {
            continue;
        }

        match write_sink_output(&output_root, sink_config, job_id, batches) {
            Ok((uri, rows)) => {
                total_rows += rows as i64;
                artifacts.push(ArtifactRef {
                    topic: sink_config.topic.clone(),
                    uri,
                });
            }
            Err(e) => {
                return JobReceipt {
                    status: JobStatus::Failed,
                    metrics: HashMap::new(),
                    artifacts,
                    error_message: Some(format!("Failed to write sink '{}': {}", sink_config.topic, e)),
                    retryable: false,
                };
            }
        }
    }

    let mut metrics = HashMap::new();
    metrics.insert("rows".to_string(), total_rows);
    metrics.insert("bytes".to_string(), bridge_result.logs.len() as i64);

    info!(
        "Worker '{}': job {} complete, {} rows across {} outputs",
        worker_id, job_id, total_rows, artifacts.len()
    );

    JobReceipt {
        status: JobStatus::Success,
        metrics,
        artifacts,
        error_message: None,
        retryable: false,
    }
}

fn write_sink_output(
    output_root: &std::path::Path,
    sink_config: &casparian_protocol::types::SinkConfig,
    job_id: JobId,
    batches: &[casparian_sinks::OutputBatch],
) -> Result<(String, u64)> {
    let uri = if sink_config.uri.contains("://") {
        sink_config.uri.clone()
    } else {
        format!("parquet://{}", output_root.join(&sink_config.uri).display())
    };

    let mut sink = open_sink(&uri, sink_config.mode, &sink_config.topic, &job_id.to_string())
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let schema = batches[0].schema();
    sink.open(&schema).map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut rows = 0u64;
    for batch in batches {
        match sink.write(batch.record_batch()) {
            Ok(n) => rows += n,
            Err(e) => {
                let _ = sink.abort();
                return Err(anyhow::anyhow!("{}", e));
            }
        }
    }

    sink.commit().map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok((uri, rows))
}
