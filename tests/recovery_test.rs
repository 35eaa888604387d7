mod common;

use bytes::Bytes;
use redis_record::container::{LogContainer, WriterOptions};
use redis_record::event::{Event, Payload, Schema, StreamEntry};
use redis_record::replay::{ReplayMode, ReplayOptions, Replayer};
use redis_record::store::MemoryStore;
use redis_record::Error;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn order(id: u32) -> Payload {
    Payload::StreamEntry(StreamEntry {
        stream: "orders".to_string(),
        id: format!("1700000000{:03}-0", id),
        fields: vec![(Bytes::from_static(b"id"), Bytes::from(id.to_string()))],
    })
}

/// Writes `count` events and abandons the writer without a trailer, as a
/// crashed process would.
async fn write_unclosed(container: &LogContainer, name: &str, count: u32) {
    let mut writer = container.open_for_write(name, "test").await.unwrap();
    writer.declare_channel("orders", Schema::StreamEntry).await.unwrap();
    for i in 0..count {
        writer
            .append(&Event::new("orders", u64::from(i) * 1_000_000, &order(i)))
            .await
            .unwrap();
    }
    writer.flush().await.unwrap();
    drop(writer);
}

#[tokio::test]
async fn test_torn_tail_keeps_every_complete_event() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let container = LogContainer::new(dir.path(), WriterOptions::default());
    write_unclosed(&container, "crashed", 7).await;

    // Half-written frame after the last complete one.
    let path = container.path_for("crashed").unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x45, 0x00, 0x00, 0x00, 0x10, 0xde, 0xad]).unwrap();
    drop(file);

    let err = container.open_for_read("crashed").await.unwrap_err();
    assert!(matches!(err, Error::Corrupt { valid_events: 7, .. }), "{:?}", err);

    let mut reader = container.open_recovering("crashed").await.unwrap();
    assert!(reader.is_truncated());
    assert!(reader.truncation().is_some());
    let events = reader.read_all().await.unwrap();
    assert_eq!(events.len(), 7);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.decode().unwrap(), order(i as u32));
    }

    let info = container.info("crashed").await.unwrap();
    assert!(info.truncated);
    assert_eq!(info.event_count, 7);
}

#[tokio::test]
async fn test_truncated_recording_replays_valid_prefix() {
    let dir = TempDir::new().unwrap();
    let container = Arc::new(LogContainer::new(dir.path(), WriterOptions::default()));
    write_unclosed(&container, "partial", 3).await;

    let target = MemoryStore::new();
    let options = ReplayOptions {
        mode: ReplayMode::Fast,
        ..ReplayOptions::default()
    };
    let report = Replayer::new(container)
        .run("partial", Arc::new(target.clone()), options)
        .await
        .unwrap();
    assert!(report.truncated);
    assert_eq!(report.emitted, 3);
    assert_eq!(target.entries("orders").len(), 3);
}

#[tokio::test]
async fn test_concurrent_open_for_write_admits_one_writer() {
    let dir = TempDir::new().unwrap();
    let a = LogContainer::new(dir.path(), WriterOptions::default());
    let b = a.clone();

    let (first, second) = tokio::join!(
        a.open_for_write("contended", "a"),
        b.open_for_write("contended", "b"),
    );
    let (writer, err) = match (first, second) {
        (Ok(writer), Err(err)) | (Err(err), Ok(writer)) => (writer, err),
        (first, second) => panic!(
            "expected exactly one writer, got {:?} and {:?}",
            first.is_ok(),
            second.is_ok()
        ),
    };
    assert!(matches!(err, Error::AlreadyOpen { .. }));
    assert!(a.is_writing("contended"));

    writer.close().await.unwrap();
    assert!(!a.is_writing("contended"));

    // Closed; a new writer is admitted and the old recording is kept aside.
    let writer = b.open_for_write("contended", "b").await.unwrap();
    writer.close().await.unwrap();
    let names: Vec<String> = a.list().await.unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"contended".to_string()));
}
