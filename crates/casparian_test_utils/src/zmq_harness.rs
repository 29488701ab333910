//! A DEALER-side stand-in for a worker, used to exercise a Sentinel's
//! ROUTER socket without spinning up a real `casparian_worker` process.

use casparian_protocol::{JobId, Message, OpCode};

/// Pick an ephemeral port unlikely to collide with other tests running
/// concurrently in the same process.
fn random_test_port() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let pid = std::process::id() as u64;
    ((seed ^ pid) % 10000 + 50000) as u16
}

/// A DEALER socket connected to a Sentinel's ROUTER, with send/recv helpers
/// mirroring the wire format `casparian_worker::Worker` speaks.
pub struct LoopbackRouter {
    _ctx: zmq::Context,
    socket: zmq::Socket,
}

impl LoopbackRouter {
    /// Bind a ROUTER socket on an ephemeral `tcp://127.0.0.1:<port>` address
    /// and return it paired with the address a Sentinel should be given.
    pub fn bind_router() -> (zmq::Context, zmq::Socket, String) {
        let ctx = zmq::Context::new();
        for _ in 0..25 {
            let router = ctx.socket(zmq::ROUTER).expect("failed to create ROUTER socket");
            let port = random_test_port();
            let addr = format!("tcp://127.0.0.1:{port}");
            if router.bind(&addr).is_ok() {
                router.set_rcvtimeo(5000).unwrap();
                return (ctx, router, addr);
            }
        }
        panic!("failed to bind loopback ROUTER after multiple attempts");
    }

    /// Connect a DEALER socket to `addr`, as a worker would.
    pub fn connect(addr: &str) -> Self {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::DEALER).expect("failed to create DEALER socket");
        socket.set_rcvtimeo(5000).unwrap();
        socket.connect(addr).expect("failed to connect DEALER socket");
        Self { _ctx: ctx, socket }
    }

    pub fn send(&self, opcode: OpCode, job_id: JobId, payload: &impl serde::Serialize) {
        let body = serde_json::to_vec(payload).unwrap();
        let msg = Message::new(opcode, job_id, body).unwrap();
        let (header, body) = msg.pack().unwrap();
        self.socket.send_multipart([header, body], 0).unwrap();
    }

    pub fn recv(&self) -> Message {
        let frames = self
            .socket
            .recv_multipart(0)
            .expect("timed out waiting for a reply");
        Message::unpack(&frames).expect("failed to unpack message")
    }
}

/// Recv one frame set off a bound ROUTER socket, returning the sender's
/// identity frame alongside the unpacked message.
pub fn recv_from_router(router: &zmq::Socket) -> (Vec<u8>, Message) {
    let frames = router
        .recv_multipart(0)
        .expect("timed out waiting for a worker message");
    let identity = frames[0].clone();
    let msg = Message::unpack(&frames[1..]).expect("failed to unpack message");
    (identity, msg)
}

/// Send one frame set to a specific worker identity on a bound ROUTER socket.
pub fn send_from_router(
    router: &zmq::Socket,
    identity: &[u8],
    opcode: OpCode,
    job_id: JobId,
    payload: &impl serde::Serialize,
) {
    let body = serde_json::to_vec(payload).unwrap();
    let msg = Message::new(opcode, job_id, body).unwrap();
    let (header, body) = msg.pack().unwrap();
    router
        .send_multipart([identity.to_vec(), header, body], 0)
        .unwrap();
}
