//! Many producers and readers against one engine.

use crate::common::*;
use std::collections::HashMap;
use std::thread;

#[test]
fn concurrent_producers_get_contiguous_ids() {
    let t = TestEngine::new();
    let engine = t.engine();
    const THREADS: u8 = 4;
    const PER_THREAD: u8 = 50;

    thread::scope(|s| {
        for thread_id in 0..THREADS {
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    engine.put("shared", &[vec![thread_id, seq, 0, 0, 0]]).unwrap();
                }
            });
        }
    });

    let total = THREADS as usize * PER_THREAD as usize;
    let reply = resolve(engine.get("shared", 0, total).unwrap());
    assert_eq!(reply.records.len(), total);

    let mut last_seq: HashMap<u8, u8> = HashMap::new();
    for (i, record) in reply.records.iter().enumerate() {
        assert_eq!(record.id, i as u64 * encoded(5));
        let (thread_id, seq) = (record.payload[0], record.payload[1]);
        if let Some(prev) = last_seq.insert(thread_id, seq) {
            assert_eq!(seq, prev + 1, "thread {} out of order", thread_id);
        }
    }

    let metrics = engine.metrics();
    assert_eq!(metrics.appends, total as u64);
    assert!(metrics.flushes <= metrics.appends);
}

#[test]
fn readers_tail_while_producers_write() {
    let t = TestEngine::new();
    let engine = t.engine();
    engine.open_stream("feed").unwrap();
    const RECORDS: usize = 120;

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut offset = 0;
            let mut seen = Vec::new();
            while seen.len() < RECORDS {
                let reply = resolve(engine.get("feed", offset, 10).unwrap());
                offset = reply.next_offset;
                seen.extend(reply.records.into_iter().map(|r| r.payload));
            }
            seen
        });

        for chunk in 0..(RECORDS / 4) {
            let batch: Vec<Vec<u8>> = (0..4).map(|i| vec![(chunk * 4 + i) as u8; 33]).collect();
            engine.put("feed", &batch).unwrap();
        }

        let seen = reader.join().unwrap();
        for (i, payload) in seen.iter().enumerate() {
            assert_eq!(payload, &vec![i as u8; 33]);
        }
    });
}

#[test]
fn streams_flush_together_in_shared_batches() {
    let t = TestEngine::new();
    let engine = t.engine();
    let names: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();

    thread::scope(|s| {
        for name in &names {
            s.spawn(move || {
                for i in 0..20u8 {
                    engine.put(name, &[vec![i; 70]]).unwrap();
                }
            });
        }
    });

    for name in &names {
        let reply = resolve(engine.get(name, 0, 20).unwrap());
        let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 70]).collect();
        assert_eq!(payloads(&reply), expected);
    }
    assert_eq!(engine.streams().len(), 6);
}
