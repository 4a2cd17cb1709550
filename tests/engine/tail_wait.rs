//! Reads parked on offsets that are not durable yet.

use crate::common::*;
use std::thread;
use std::time::Duration;

#[test]
fn read_before_data_completes_after_the_flush() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("tail").unwrap();

    let pending = engine.get("tail", 0, 2).unwrap();
    assert!(pending.try_take().is_none());
    let flushes_before = engine.metrics().flushes;

    engine.put("tail", &[b"one".to_vec()]).unwrap();
    // One record is not enough
    assert!(pending.wait_timeout(Duration::from_millis(50)).is_none());

    engine.put("tail", &[b"two".to_vec()]).unwrap();
    let reply = resolve(pending);
    assert_eq!(payloads(&reply), vec![b"one".to_vec(), b"two".to_vec()]);
    assert!(engine.metrics().flushes >= flushes_before + 2);
    assert_eq!(engine.metrics().waiters_serviced, 1);
}

#[test]
fn future_offsets_resolve_once_reached() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("tail").unwrap();

    // Records of 5 bytes are 24 bytes apart
    let record = |i: u8| vec![b'r', b'e', b'c', b'-', i];
    let later = engine.get("tail", 24 * 3, 1).unwrap();
    let sooner = engine.get("tail", 24, 1).unwrap();
    let first = engine.get("tail", 0, 1).unwrap();

    engine.put("tail", &[record(0)]).unwrap();
    assert_eq!(payloads(&resolve(first)), vec![record(0)]);
    assert!(sooner.try_take().is_none());

    engine.put("tail", &[record(1), record(2), record(3)]).unwrap();
    let sooner = resolve(sooner);
    let later = resolve(later);
    assert_eq!(payloads(&sooner), vec![record(1)]);
    assert_eq!(payloads(&later), vec![record(3)]);
    assert_eq!(later.next_offset, 24 * 4);
}

#[test]
fn cancel_only_matches_the_exact_request() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("tail").unwrap();

    let a = engine.get("tail", 0, 3).unwrap();
    let b = engine.get("tail", 0, 3).unwrap();
    assert_ne!(a.ticket(), b.ticket());

    assert!(matches!(
        engine.cancel("tail", 0, 2, a.ticket()),
        Err(EngineError::WaiterNotFound { .. })
    ));
    let ticket = a.ticket();
    engine.cancel("tail", 0, 3, ticket).unwrap();
    assert!(matches!(a.wait(), Err(EngineError::Cancelled)));

    // Cancelling twice is a miss
    assert!(matches!(
        engine.cancel("tail", 0, 3, ticket),
        Err(EngineError::WaiterNotFound { .. })
    ));

    engine
        .put("tail", &[b"x".to_vec(), b"y".to_vec(), b"z".to_vec()])
        .unwrap();
    assert_eq!(resolve(b).records.len(), 3);
}

#[test]
fn cancel_after_service_is_a_benign_miss() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("tail").unwrap();

    let pending = engine.get("tail", 0, 1).unwrap();
    engine.put("tail", &[b"served".to_vec()]).unwrap();
    let reply = pending
        .wait_timeout(WAIT)
        .expect("read did not resolve")
        .unwrap();
    assert_eq!(payloads(&reply), vec![b"served".to_vec()]);

    assert!(matches!(
        engine.cancel("tail", 0, 1, pending.ticket()),
        Err(EngineError::WaiterNotFound { .. })
    ));
}

#[test]
fn concurrent_readers_all_wake() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("fanout").unwrap();
    let readers: Vec<PendingRead> = (0..8).map(|_| engine.get("fanout", 0, 5).unwrap()).collect();

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..5u8 {
                engine.put("fanout", &[vec![i; 30]]).unwrap();
            }
        });
    });

    for pending in readers {
        let reply = resolve(pending);
        assert_eq!(reply.records.len(), 5);
        assert_eq!(reply.records[4].payload, vec![4u8; 30]);
    }
}

#[test]
fn close_fails_parked_reads() {
    let mut t = TestEngine::new();
    t.engine().open_stream("tail").unwrap();
    let pending = t.engine().get("tail", 0, 1).unwrap();

    t.close();
    assert!(matches!(
        pending.wait_timeout(WAIT),
        Some(Err(EngineError::Closed))
    ));
}
