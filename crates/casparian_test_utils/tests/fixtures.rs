//! Exercises the fixture helpers against each other: a sample manifest
//! should leave behind exactly the rows a dispatch loop needs.

use casparian_test_utils::{sample_manifest, test_db};

#[tokio::test]
async fn sample_manifest_is_active_and_routed() {
    let db = test_db().await;
    let sample = sample_manifest(&db, "csv_parser").await;

    let manifest = db.get_manifest(sample.manifest_id).await.unwrap().unwrap();
    assert_eq!(manifest.status.0, casparian_protocol::PluginStatus::Active);
    assert_eq!(manifest.env_hash.as_deref(), Some(sample.env_hash.as_str()));

    let active = db
        .active_manifest_for_plugin("csv_parser")
        .await
        .unwrap()
        .expect("promoted manifest should be the active one");
    assert_eq!(active.id, sample.manifest_id);

    let topics = db.topic_configs_for_plugin("csv_parser").await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic_name, "output");
}

#[tokio::test]
async fn loopback_router_carries_an_identify_round_trip() {
    use casparian_protocol::types::IdentifyPayload;
    use casparian_protocol::{JobId, OpCode};
    use casparian_test_utils::LoopbackRouter;

    let (_ctx, router, addr) = LoopbackRouter::bind_router();
    let dealer = LoopbackRouter::connect(&addr);

    dealer.send(
        OpCode::Identify,
        JobId::new(0),
        &IdentifyPayload { capabilities: vec!["*".to_string()], worker_id: Some("test-worker".to_string()) },
    );

    let (identity, msg) = casparian_test_utils::zmq_harness::recv_from_router(&router);
    assert_eq!(msg.header.opcode, OpCode::Identify);
    let payload: IdentifyPayload = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload.worker_id.as_deref(), Some("test-worker"));

    casparian_test_utils::zmq_harness::send_from_router(&router, &identity, OpCode::Ack, JobId::new(0), &());
    let ack = dealer.recv();
    assert_eq!(ack.header.opcode, OpCode::Ack);
}
