use std::collections::BTreeMap;
use std::thread;

use simbridge_transport::{
    ControlChannel, FramedTransport, MemoryChannel, MemoryRegion, PayloadRegion, TransportError,
};
use simbridge_types::{AgentResponse, Book, InstructionBatch, Level, StateSnapshot};

fn snapshot(step: i64) -> StateSnapshot {
    let mut books = BTreeMap::new();
    books.insert(
        0,
        Book {
            id: 0,
            bids: vec![Level { price: 100.0 - step as f64, quantity: 1.0 }],
            asks: vec![Level { price: 101.0, quantity: 2.0 }],
            events: vec![],
        },
    );
    StateSnapshot {
        timestamp: step * 1_000_000_000,
        log_dir: Some("/tmp/run".into()),
        books,
        ..Default::default()
    }
}

/// The bridge and engine share memory-backed channels; the engine side is the
/// same transport type with the directions swapped.
fn wire() -> (
    FramedTransport<MemoryChannel, MemoryRegion>,
    FramedTransport<MemoryChannel, MemoryRegion>,
) {
    let (req_q, req_r) = (MemoryChannel::new(), MemoryRegion::new());
    let (res_q, res_r) = (MemoryChannel::new(), MemoryRegion::new());
    let bridge = FramedTransport::new(req_q.clone(), req_r.clone(), res_q.clone(), res_r.clone());
    let engine = FramedTransport::new(res_q, res_r, req_q, req_r);
    (bridge, engine)
}

#[test]
fn test_steps_flow_in_lockstep() {
    let (mut bridge, mut engine) = wire();

    let engine_thread = thread::spawn(move || {
        let mut replies = Vec::new();
        for step in 0..50 {
            engine.send(&snapshot(step)).unwrap();
            let reply = engine.receive::<InstructionBatch>().unwrap();
            replies.push(reply.message);
        }
        replies
    });

    for step in 0..50 {
        let (state, _started) = bridge.receive_snapshot().unwrap();
        assert_eq!(state.timestamp, step * 1_000_000_000);
        let batch = InstructionBatch {
            responses: vec![AgentResponse {
                agent_id: step as u32,
                instructions: vec![],
            }],
        };
        bridge.respond(&batch).unwrap();
    }

    let replies = engine_thread.join().unwrap();
    assert_eq!(replies.len(), 50);
    for (step, reply) in replies.iter().enumerate() {
        assert_eq!(reply.responses[0].agent_id, step as u32);
    }
}

#[test]
fn test_decode_failure_leaves_transport_usable() {
    let (mut bridge, mut engine) = wire();

    let mut raw_channel = MemoryChannel::new();
    let mut raw_region = MemoryRegion::new();
    let mut bridge_with_raw = FramedTransport::new(
        raw_channel.clone(),
        raw_region.clone(),
        MemoryChannel::new(),
        MemoryRegion::new(),
    );
    raw_region.write(&[0xff, 0xfe, 0xfd]).unwrap();
    raw_channel.send_header(3).unwrap();
    assert!(matches!(
        bridge_with_raw.receive_snapshot(),
        Err(TransportError::Decode(_))
    ));

    engine.send(&snapshot(1)).unwrap();
    let (state, _) = bridge.receive_snapshot().unwrap();
    assert_eq!(state.timestamp, 1_000_000_000);
    bridge.respond(&InstructionBatch::empty()).unwrap();
    assert!(engine.receive::<InstructionBatch>().unwrap().message.is_empty());
}
