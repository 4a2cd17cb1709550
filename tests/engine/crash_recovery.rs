//! Damage the directory between close and reopen and check what recovery
//! keeps.

use crate::common::*;
use topiclog_storage::{BatchTrailer, TRAILER_SIZE};

#[test]
fn missing_trailer_rolls_back_to_previous_batch() {
    let mut t = TestEngine::new();
    let committed: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 100]).collect();
    t.engine().put("orders", &committed).unwrap();
    let p1 = t.engine().durable_pointer();
    let size1 = t.engine().stream_info("orders").unwrap().durable_size;

    t.engine().put("orders", &[vec![0xAB; 300]]).unwrap();
    let p2 = t.engine().durable_pointer();
    t.close();

    // Cut right after the data and tail areas, losing inodes and trailer
    let trailer = t.trailer_at(p2);
    assert_eq!(trailer.batch_start, p1);
    assert!(trailer.inode_area_start > p1);
    t.truncate_physical(trailer.inode_area_start);

    t.reopen();
    let engine = t.engine();
    let report = engine.recovery_report().clone();
    assert!(!report.created);
    assert_eq!(report.checkpoint, p2);
    assert_eq!(report.durable_pointer, p1);
    assert_eq!(report.rolled_back_bytes, p2 - p1);
    assert_eq!(report.streams_rewound, vec!["orders".to_string()]);
    assert_eq!(engine.durable_pointer(), p1);

    let info = engine.stream_info("orders").unwrap();
    assert_eq!(info.durable_size, size1);
    assert_eq!(info.next_offset, size1);

    let reply = resolve(engine.get("orders", 0, 6).unwrap());
    assert_eq!(payloads(&reply), committed);

    // The lost batch's space is reused
    engine.put("orders", &[b"after crash".to_vec()]).unwrap();
    let reply = resolve(engine.get("orders", size1, 1).unwrap());
    assert_eq!(reply.records[0].id, size1);
    assert_eq!(reply.records[0].payload, b"after crash");
    let end = engine.durable_pointer();
    assert!(end > p1);
    assert_eq!(t.trailer_at(end).batch_start, p1);
}

#[test]
fn losing_the_only_batch_empties_the_stream() {
    let mut t = TestEngine::new();
    t.engine().put("orders", &[vec![7u8; 150]]).unwrap();
    let p1 = t.engine().durable_pointer();
    t.close();

    t.truncate_physical(p1 - 1);
    t.reopen();

    let engine = t.engine();
    assert_eq!(engine.recovery_report().durable_pointer, 0);
    assert_eq!(engine.streams(), vec!["orders".to_string()]);
    let info = engine.stream_info("orders").unwrap();
    assert_eq!(info.durable_size, 0);
    assert_eq!(info.next_offset, 0);

    engine.put("orders", &[b"fresh".to_vec()]).unwrap();
    let reply = resolve(engine.get("orders", 0, 1).unwrap());
    assert_eq!(reply.records[0].payload, b"fresh");
}

#[test]
fn clean_reopen_reports_nothing_lost() {
    let mut t = TestEngine::new();
    t.engine().put("orders", &[b"kept".to_vec()]).unwrap();
    let pointer = t.engine().durable_pointer();
    t.reopen();

    let report = t.engine().recovery_report();
    assert!(report.is_clean());
    assert_eq!(report.durable_pointer, pointer);
    assert!(report.streams_rewound.is_empty());
}

#[test]
fn durable_pointer_always_ends_at_a_trailer() {
    let t = TestEngine::new();
    let engine = t.engine();
    let mut previous = engine.durable_pointer();

    for i in 0..20usize {
        let stream = if i % 3 == 0 { "a" } else { "b" };
        engine.put(stream, &[vec![i as u8; 10 + i * 13]]).unwrap();

        let pointer = engine.durable_pointer();
        assert!(pointer > previous);
        let trailer = t.trailer_at(pointer);
        assert_eq!(trailer.batch_start, previous);
        previous = pointer;
    }
}

#[test]
fn torn_stream_is_rewound_while_others_keep_their_data() {
    let mut t = TestEngine::new();
    t.engine().put("stable", &[vec![1u8; 90]]).unwrap();
    let p1 = t.engine().durable_pointer();
    t.engine().put("torn", &[vec![2u8; 90]]).unwrap();
    let p2 = t.engine().durable_pointer();
    t.close();

    t.truncate_physical(p2 - 1);
    t.reopen();

    let engine = t.engine();
    assert_eq!(engine.durable_pointer(), p1);
    assert_eq!(engine.recovery_report().streams_rewound, vec!["torn".to_string()]);
    assert_eq!(engine.stream_info("torn").unwrap().durable_size, 0);
    let reply = resolve(engine.get("stable", 0, 1).unwrap());
    assert_eq!(reply.records[0].payload, vec![1u8; 90]);
}

#[test]
fn trailer_bytes_inside_a_torn_batch_are_not_a_commit_point() {
    let mut t = TestEngine::new();
    let committed: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 100]).collect();
    t.engine().put("orders", &committed).unwrap();
    let p1 = t.engine().durable_pointer();
    let size1 = t.engine().stream_info("orders").unwrap().durable_size;

    // A payload carrying trailers sealed for this very database: a forged
    // one and a copy of the real trailer of the committed batch
    let uuid = t.database_uuid();
    let forged = BatchTrailer {
        batch_start: 0,
        inode_area_start: 0,
        inode_count: 0,
    };
    let mut payload = vec![0x61u8; 40];
    payload.extend_from_slice(&forged.to_bytes(&uuid));
    payload.extend_from_slice(&t.read_physical(p1 - TRAILER_SIZE as u64, TRAILER_SIZE));
    payload.extend_from_slice(&[0x62u8; 40]);
    t.engine().put("orders", &[payload]).unwrap();
    let p2 = t.engine().durable_pointer();
    t.close();

    t.truncate_physical(t.trailer_at(p2).inode_area_start);
    t.reopen();

    let engine = t.engine();
    assert_eq!(engine.recovery_report().durable_pointer, p1);
    assert_eq!(engine.stream_info("orders").unwrap().durable_size, size1);
    let reply = resolve(engine.get("orders", 0, 6).unwrap());
    assert_eq!(payloads(&reply), committed);
}
