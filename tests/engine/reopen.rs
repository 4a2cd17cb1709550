//! Close/reopen cycles.

use crate::common::*;
use std::fs;

#[test]
fn flushed_data_survives_reopen_and_appends_continue() {
    let mut t = TestEngine::new();
    let before: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 40 + i as usize]).collect();
    t.engine().put("orders", &before).unwrap();
    let size = t.engine().stream_info("orders").unwrap().durable_size;
    t.reopen();

    let engine = t.engine();
    assert_eq!(engine.stream_info("orders").unwrap().next_offset, size);
    let reply = resolve(engine.get("orders", 0, 10).unwrap());
    assert_eq!(payloads(&reply), before);

    engine.put("orders", &[b"next".to_vec()]).unwrap();
    let reply = resolve(engine.get("orders", size, 1).unwrap());
    assert_eq!(reply.records[0].id, size);
    assert_eq!(reply.next_offset, size + encoded(4));
}

#[test]
fn partial_blocks_accumulate_across_reopens() {
    let mut t = TestEngine::new();
    let mut expected = Vec::new();

    // 10-byte payloads never fill a 64-byte block in one put
    for round in 0..12u8 {
        let record = vec![round; 10];
        t.engine().put("small", &[record.clone()]).unwrap();
        expected.push(record);
        if round % 3 == 2 {
            t.reopen();
        }
    }

    let reply = resolve(t.engine().get("small", 0, expected.len()).unwrap());
    assert_eq!(payloads(&reply), expected);
}

#[test]
fn registered_streams_survive_without_data() {
    let mut t = TestEngine::new();
    t.engine().open_stream("empty").unwrap();
    t.engine().put("full", &[b"x".to_vec()]).unwrap();
    t.reopen();

    assert_eq!(
        t.engine().streams(),
        vec!["empty".to_string(), "full".to_string()]
    );
    let info = t.engine().stream_info("empty").unwrap();
    assert_eq!(info.slot, 0);
    assert_eq!(info.durable_size, 0);
}

#[test]
fn reopen_with_other_geometry_is_refused() {
    let mut t = TestEngine::new();
    t.engine().put("orders", &[b"x".to_vec()]).unwrap();
    t.close();

    let other = t.config.clone().with_geometry(Geometry::new(128, 4).unwrap());
    assert!(matches!(
        Engine::open(other),
        Err(EngineError::Durability(_))
    ));

    // The lock was released by the failed open
    t.reopen();
}

#[test]
fn directory_is_locked_while_open() {
    let t = TestEngine::new();
    assert!(matches!(
        Engine::open(t.config.clone()),
        Err(EngineError::AlreadyOpen { .. })
    ));
    assert!(t.path().join(topiclog::LOCK_FILE_NAME).exists());
}

#[test]
fn open_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let config_path = dir.path().join("topiclog.toml");
    fs::write(
        &config_path,
        format!(
            "base_path = {:?}\nshard_bit = 12\nflush_interval_ms = 1\nmax_batch_size = 65536\n",
            data.display().to_string()
        ),
    )
    .unwrap();

    let config = EngineConfig::from_file(&config_path).unwrap();
    assert_eq!(config.shard_bit, 12);
    let engine = Engine::open(config).unwrap();
    engine.put("orders", &[b"from toml".to_vec()]).unwrap();
    assert!(data.join("HEADER").exists());
    engine.close().unwrap();
}
