//! Integration tests for the Rust worker's wire protocol handling.
//!
//! Protocol round-trip tests need no socket at all; the ZMQ exchange test
//! mocks the Sentinel's ROUTER socket with the synchronous `zmq` crate on a
//! background thread, matching how the worker itself talks to it.

use casparian_protocol::*;

/// Test that protocol messages round-trip correctly
#[test]
fn test_protocol_message_roundtrip() {
    let cmd = types::DispatchCommand {
        plugin_name: "test_plugin".to_string(),
        parser_version: None,
        file_path: "/data/input.csv".to_string(),
        file_version_id: 1,
        sinks: vec![types::SinkConfig {
            topic: "output".to_string(),
            uri: "parquet://output.parquet".to_string(),
            mode: types::SinkMode::Append,
            quarantine_config: None,
            schema: None,
        }],
        env_hash: Some("abc123def456".to_string()),
        source_code: Some("# test plugin".to_string()),
        artifact_hash: "deadbeef".to_string(),
    };

    let payload = serde_json::to_vec(&cmd).unwrap();
    let msg = Message::new(OpCode::Dispatch, JobId::new(12345), payload).unwrap();

    // Pack and unpack
    let (header, body) = msg.pack().unwrap();
    let frames = vec![header.to_vec(), body];
    let unpacked = Message::unpack(&frames).unwrap();

    assert_eq!(unpacked.header.opcode, OpCode::Dispatch);
    assert_eq!(unpacked.header.job_id, JobId::new(12345));

    // Verify payload
    let unpacked_cmd: types::DispatchCommand = serde_json::from_slice(&unpacked.payload).unwrap();
    assert_eq!(unpacked_cmd.plugin_name, "test_plugin");
    assert_eq!(unpacked_cmd.env_hash.as_deref(), Some("abc123def456"));
}

/// Test IDENTIFY message format
#[test]
fn test_identify_message_format() {
    let identify = types::IdentifyPayload {
        capabilities: vec!["*".to_string()],
        worker_id: Some("rust-worker-test".to_string()),
    };

    let payload = serde_json::to_vec(&identify).unwrap();
    let msg = Message::new(OpCode::Identify, JobId::new(0), payload).unwrap();

    let (header, body) = msg.pack().unwrap();

    // Header should be 16 bytes
    assert_eq!(header.len(), 16);

    // First byte is version (0x04)
    assert_eq!(header[0], 0x04);

    // Second byte is opcode (IDENTIFY = 1)
    assert_eq!(header[1], 0x01);

    // Verify we can parse body
    let parsed: types::IdentifyPayload = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.worker_id, Some("rust-worker-test".to_string()));
}

/// Test CONCLUDE message format
#[test]
fn test_conclude_message_format() {
    let mut metrics = std::collections::HashMap::new();
    metrics.insert("rows".to_string(), 1500i64);

    let receipt = types::JobReceipt {
        status: types::JobStatus::Success,
        metrics,
        artifacts: vec![],
        error_message: None,
        retryable: false,
    };

    let payload = serde_json::to_vec(&receipt).unwrap();
    let msg = Message::new(OpCode::Conclude, JobId::new(99999), payload).unwrap();

    let (header, body) = msg.pack().unwrap();

    // Verify header
    assert_eq!(header[0], 0x04); // version
    assert_eq!(header[1], 0x05); // CONCLUDE = 5

    // Verify job_id is encoded correctly (big endian)
    let frames = vec![header.to_vec(), body];
    let unpacked = Message::unpack(&frames).unwrap();
    assert_eq!(unpacked.header.job_id, JobId::new(99999));
}

/// Test ENV_READY message format
#[test]
fn test_env_ready_message_format() {
    let payload = types::EnvReadyPayload {
        env_hash: "deadbeef12345678".to_string(),
        interpreter_path: "/home/user/.casparian_flow/venvs/deadbeef/bin/python".to_string(),
        cached: true,
    };

    let json = serde_json::to_vec(&payload).unwrap();
    let msg = Message::new(OpCode::EnvReady, JobId::new(0), json).unwrap();

    let (header, _) = msg.pack().unwrap();

    // OpCode.ENV_READY = 9
    assert_eq!(header[1], 0x09);
}

/// Test PREPARE_ENV message parsing
#[test]
fn test_prepare_env_parsing() {
    let cmd = types::PrepareEnvCommand {
        env_hash: "abc123".to_string(),
        lockfile_content: "# uv.lock content".to_string(),
        python_version: Some("3.11".to_string()),
    };

    let json = serde_json::to_string(&cmd).unwrap();
    let parsed: types::PrepareEnvCommand = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.env_hash, "abc123");
    assert_eq!(parsed.python_version, Some("3.11".to_string()));
}

/// Test error message format
#[test]
fn test_error_message_format() {
    let err = types::ErrorPayload {
        message: "Something went wrong".to_string(),
        traceback: Some("File foo.py, line 42".to_string()),
    };

    let json = serde_json::to_vec(&err).unwrap();
    let msg = Message::new(OpCode::Err, JobId::new(123), json).unwrap();

    let (header, body) = msg.pack().unwrap();

    // OpCode.ERR = 6
    assert_eq!(header[1], 0x06);

    let parsed: types::ErrorPayload = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.message, "Something went wrong");
}

// ============================================================================
// ZMQ-based integration test (no Python required)
// ============================================================================

/// Test that we can receive and parse messages from a mock sentinel, using
/// the same synchronous ROUTER/DEALER pairing the worker uses in production.
#[test]
fn test_zmq_message_exchange() {
    let ctx = zmq::Context::new();

    let router = ctx.socket(zmq::ROUTER).unwrap();
    router.bind("tcp://127.0.0.1:*").unwrap();
    let bound_addr = router.get_last_endpoint().unwrap().unwrap();
    router.set_rcvtimeo(2000).unwrap();

    let dealer = ctx.socket(zmq::DEALER).unwrap();
    dealer.set_identity(b"test-worker").unwrap();
    dealer.connect(&bound_addr).unwrap();

    // Send IDENTIFY from dealer
    let identify = types::IdentifyPayload {
        capabilities: vec!["*".to_string()],
        worker_id: Some("test-worker".to_string()),
    };
    let payload = serde_json::to_vec(&identify).unwrap();
    let msg = Message::new(OpCode::Identify, JobId::new(0), payload).unwrap();
    let (header, body) = msg.pack().unwrap();

    dealer.send_multipart([header, body], 0).unwrap();

    // Receive on router (identity frame, then header, then payload)
    let frames = router.recv_multipart(0).expect("Should receive message");
    assert_eq!(frames.len(), 3, "Expected identity + header + payload frames");

    let unpacked = Message::unpack(&frames[1..]).unwrap();
    assert_eq!(unpacked.header.opcode, OpCode::Identify);
    let parsed: types::IdentifyPayload = serde_json::from_slice(&unpacked.payload).unwrap();
    assert_eq!(parsed.worker_id, Some("test-worker".to_string()));
}
