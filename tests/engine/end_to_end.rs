//! Put/get round trips through the full write and read path.

use crate::common::*;
use std::time::Duration;

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn put_three_get_three_then_tail_for_a_fourth() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("events").unwrap();

    let first = vec![content(20, 1), content(38, 2), content(5, 3)];
    assert_eq!(engine.put("events", &first).unwrap(), 3);

    let reply = resolve(engine.get("events", 0, 3).unwrap());
    assert_eq!(payloads(&reply), first);
    assert_eq!(reply.stream, "events");
    assert_eq!(reply.next_offset, encoded(20) + encoded(38) + encoded(5));

    let pending = engine.get("events", 0, 4).unwrap();
    assert!(pending.wait_timeout(Duration::from_millis(50)).is_none());
    assert_eq!(engine.stream_info("events").unwrap().parked_reads, 1);

    let fourth = content(11, 4);
    assert_eq!(engine.put("events", &[fourth.clone()]).unwrap(), 1);

    let reply = resolve(pending);
    let mut expected = first.clone();
    expected.push(fourth);
    assert_eq!(payloads(&reply), expected);
    assert_eq!(
        reply.next_offset,
        encoded(20) + encoded(38) + encoded(5) + encoded(11)
    );
    assert_eq!(engine.stream_info("events").unwrap().parked_reads, 0);
}

#[test]
fn record_ids_are_byte_offsets() {
    let t = TestEngine::new();
    let engine = t.engine();
    let sizes = [0usize, 1, 63, 64, 65, 200];
    let records: Vec<Vec<u8>> = sizes.iter().map(|&n| content(n, n as u8)).collect();
    engine.put("ids", &records).unwrap();

    let reply = resolve(engine.get("ids", 0, sizes.len()).unwrap());
    let mut offset = 0;
    for (record, &n) in reply.records.iter().zip(sizes.iter()) {
        assert_eq!(record.id, offset);
        assert_eq!(record.payload.len(), n);
        offset += encoded(n);
    }
    assert_eq!(reply.next_offset, offset);
    assert_eq!(engine.stream_info("ids").unwrap().durable_size, offset);
}

#[test]
fn reads_resume_from_any_record_boundary() {
    let t = TestEngine::new();
    let engine = t.engine();
    let records: Vec<Vec<u8>> = (0..40).map(|i| content(10 + i, i as u8)).collect();
    for chunk in records.chunks(7) {
        engine.put("log", chunk).unwrap();
    }

    let mut offset = 0;
    let mut seen = Vec::new();
    while seen.len() < records.len() {
        let reply = resolve(engine.get("log", offset, 3.min(records.len() - seen.len())).unwrap());
        offset = reply.next_offset;
        seen.extend(payloads(&reply));
    }
    assert_eq!(seen, records);
}

#[test]
fn streams_are_independent() {
    let t = TestEngine::new();
    let engine = t.engine();
    for i in 0..20u8 {
        engine.put("left", &[vec![b'L', i]]).unwrap();
        engine.put("right", &[vec![b'R', i], vec![b'r', i]]).unwrap();
    }

    let left = resolve(engine.get("left", 0, 20).unwrap());
    let right = resolve(engine.get("right", 0, 40).unwrap());
    assert!(left.records.iter().all(|r| r.payload[0] == b'L'));
    assert!(right.records.iter().all(|r| r.payload[0].to_ascii_uppercase() == b'R'));
    assert_eq!(engine.streams(), vec!["left".to_string(), "right".to_string()]);
}

#[test]
fn data_spanning_many_shards() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::for_testing(dir.path())
        .with_shard_bit(10)
        .with_geometry(small_geometry());
    let t = TestEngine::with_config(dir, config);
    let engine = t.engine();

    let records: Vec<Vec<u8>> = (0..300).map(|i| content(50, i as u8)).collect();
    for chunk in records.chunks(25) {
        engine.put("wide", chunk).unwrap();
    }
    assert!(engine.durable_pointer() > 16 * 1024);

    let reply = resolve(engine.get("wide", 0, 300).unwrap());
    assert_eq!(payloads(&reply), records);
}

#[test]
fn corrupt_record_is_skipped_by_resync() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let mut t = TestEngine::with_config(dir, config);
    let marker = b"CORRUPT-ME-0123456789".to_vec();
    t.engine()
        .put("damaged", &[b"first".to_vec(), marker.clone(), b"third".to_vec()])
        .unwrap();
    t.close();

    assert!(t.corrupt_everywhere(&marker, 0xFF) >= 1);
    t.reopen();

    let engine = t.engine();
    let reply = resolve(engine.get("damaged", 0, 2).unwrap());
    assert_eq!(payloads(&reply), vec![b"first".to_vec(), b"third".to_vec()]);
    let metrics = engine.metrics();
    assert_eq!(metrics.resyncs, 1);
    assert_eq!(metrics.resync_skipped_bytes, encoded(marker.len()));
}

#[test]
fn oversized_and_empty_puts() {
    let t = TestEngine::new();
    let engine = t.engine();
    let empty: [&[u8]; 0] = [];
    assert_eq!(engine.put("edge", &empty).unwrap(), 0);

    let huge = vec![0u8; topiclog::MAX_RECORD_PAYLOAD + 1];
    assert!(matches!(
        engine.put("edge", &[huge]),
        Err(EngineError::Codec(_))
    ));
    assert_eq!(engine.stream_info("edge").unwrap().next_offset, 0);
}
