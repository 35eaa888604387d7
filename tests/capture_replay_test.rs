mod common;

use redis_record::capture::{self, CaptureOptions, Capturer};
use redis_record::container::{LogContainer, WriterOptions};
use redis_record::event::{CommandInvocation, Payload, Schema};
use redis_record::replay::{ReplayMode, ReplayOptions, ReplayState, Replayer};
use redis_record::store::{Connector, MemoryStore, StoreConnection};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GAP: Duration = Duration::from_millis(300);
const TOLERANCE: Duration = Duration::from_millis(120);

fn assert_gap(actual: Duration, expected: Duration) {
    let low = expected.saturating_sub(TOLERANCE);
    let high = expected + TOLERANCE;
    assert!(
        actual >= low && actual <= high,
        "gap {:?} outside {:?}..{:?}",
        actual,
        low,
        high
    );
}

/// Captures two orders 300ms apart.
async fn record_orders(dir: &TempDir, source: &MemoryStore) -> Arc<LogContainer> {
    let container = Arc::new(LogContainer::new(dir.path(), WriterOptions::default()));
    let config = common::recording_config(dir.path(), &["orders"]);
    let mut capturer = Capturer::new(
        container.clone(),
        CaptureOptions {
            source_label: "memory".to_string(),
            ..CaptureOptions::default()
        },
    );

    let start = chrono::Utc::now();
    let sources = capture::build_sources(Arc::new(source.clone()), &config, start).unwrap();
    capturer.start_at("session", start, sources).await.unwrap();

    source.xadd("orders", "*", &[("id", "1")]).unwrap();
    common::wait_for_events(&capturer, 1).await;
    tokio::time::sleep(GAP).await;
    source.xadd("orders", "*", &[("id", "2")]).unwrap();
    common::wait_for_events(&capturer, 2).await;

    let summary = capturer.stop().await.unwrap();
    assert_eq!(summary.events, 2);
    assert_eq!(summary.channels, 1);
    assert!(summary.failure.is_none());
    container
}

#[tokio::test]
async fn test_capture_then_replay_keeps_timing() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let source = MemoryStore::new();
    let container = record_orders(&dir, &source).await;

    let mut reader = container.open_for_read("session").await.unwrap();
    assert_eq!(reader.channels().len(), 1);
    assert_eq!(reader.channels()[0].name, "orders");
    assert_eq!(reader.channels()[0].schema, Schema::StreamEntry);
    let events = reader.read_all().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_gap(
        Duration::from_nanos(events[1].timestamp_ns - events[0].timestamp_ns),
        GAP,
    );

    let target = MemoryStore::new();
    let report = Replayer::new(container)
        .run("session", Arc::new(target.clone()), ReplayOptions::default())
        .await
        .unwrap();
    assert_eq!(report.state, ReplayState::Stopped);
    assert_eq!(report.total, 2);
    assert_eq!(report.emitted, 2);
    assert!(report.failures.is_empty());
    assert!(!report.truncated);

    let replayed = target.entries("orders");
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].fields[0].1.as_ref(), b"1");
    assert_eq!(replayed[1].fields[0].1.as_ref(), b"2");

    let xadds: Vec<_> = target
        .commands()
        .into_iter()
        .filter(|c| c.command.family() == "xadd")
        .collect();
    assert_eq!(xadds.len(), 2);
    assert_gap(xadds[1].at.duration_since(xadds[0].at), GAP);
}

#[tokio::test]
async fn test_replay_speed_and_fast_mode() {
    let dir = TempDir::new().unwrap();
    let container = record_orders(&dir, &MemoryStore::new()).await;
    let replayer = Replayer::new(container);

    let doubled = MemoryStore::new();
    let options = ReplayOptions {
        speed_factor: 2.0,
        ..ReplayOptions::default()
    };
    replayer
        .run("session", Arc::new(doubled.clone()), options)
        .await
        .unwrap();
    let commands = doubled.commands();
    assert_gap(commands[2].at.duration_since(commands[1].at), GAP / 2);

    let fast = MemoryStore::new();
    let options = ReplayOptions {
        mode: ReplayMode::Fast,
        ..ReplayOptions::default()
    };
    let report = replayer
        .run("session", Arc::new(fast.clone()), options)
        .await
        .unwrap();
    assert_eq!(report.emitted, 2);
    let commands = fast.commands();
    assert!(commands[2].at.duration_since(commands[1].at) < Duration::from_millis(50));
}

#[tokio::test]
async fn test_firehose_commands_are_replayed_verbatim() {
    let dir = TempDir::new().unwrap();
    let source = MemoryStore::new();
    let container = Arc::new(LogContainer::new(dir.path(), WriterOptions::default()));
    let mut config = common::recording_config(dir.path(), &[]);
    config.firehose = true;

    let mut capturer = Capturer::new(container.clone(), CaptureOptions::default());
    let start = chrono::Utc::now();
    let sources = capture::build_sources(Arc::new(source.clone()), &config, start).unwrap();
    capturer.start_at("commands", start, sources).await.unwrap();
    // Let the firehose subscribe before traffic starts.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut conn = source.connect().await.unwrap();
    let set = CommandInvocation::new("SET").arg("greeting").arg("hello");
    conn.invoke(&set).await.unwrap();
    conn.invoke(&CommandInvocation::new("GET").arg("greeting"))
        .await
        .unwrap();
    conn.invoke(&CommandInvocation::new("DEL").arg("greeting"))
        .await
        .unwrap();
    common::wait_for_events(&capturer, 2).await;
    capturer.stop().await.unwrap();

    let info = container.info("commands").await.unwrap();
    let mut channels: Vec<_> = info.channels.iter().map(|c| c.name.as_str()).collect();
    channels.sort();
    assert_eq!(channels, vec!["@cmd:del", "@cmd:set"]);

    let target = MemoryStore::new();
    let options = ReplayOptions {
        mode: ReplayMode::Fast,
        ..ReplayOptions::default()
    };
    Replayer::new(container)
        .run("commands", Arc::new(target.clone()), options)
        .await
        .unwrap();
    let replayed: Vec<_> = target
        .commands()
        .into_iter()
        .skip(1)
        .map(|c| c.command.to_string())
        .collect();
    assert_eq!(replayed, vec!["SET greeting hello", "DEL greeting"]);

    let mut reader = LogContainer::new(dir.path(), WriterOptions::default())
        .open_for_read("commands")
        .await
        .unwrap();
    let first = reader.next_event().await.unwrap().unwrap();
    assert_eq!(first.decode().unwrap(), Payload::Command(set));
}

#[tokio::test]
async fn test_tailed_stream_appends_are_recorded_once() {
    let dir = TempDir::new().unwrap();
    let source = MemoryStore::new();
    let container = Arc::new(LogContainer::new(dir.path(), WriterOptions::default()));
    let mut config = common::recording_config(dir.path(), &["*"]);
    config.firehose = true;

    let mut capturer = Capturer::new(container.clone(), CaptureOptions::default());
    let start = chrono::Utc::now();
    let sources = capture::build_sources(Arc::new(source.clone()), &config, start).unwrap();
    capturer.start_at("mixed", start, sources).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut conn = source.connect().await.unwrap();
    conn.invoke(
        &CommandInvocation::new("XADD")
            .arg("orders")
            .arg("*")
            .arg("id")
            .arg("1"),
    )
    .await
    .unwrap();
    conn.invoke(&CommandInvocation::new("SET").arg("k").arg("v"))
        .await
        .unwrap();
    common::wait_for_events(&capturer, 2).await;
    // Time for a second copy of the append to show up, if one were coming.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let summary = capturer.stop().await.unwrap();
    assert_eq!(summary.events, 2);

    let info = container.info("mixed").await.unwrap();
    let mut channels: Vec<_> = info.channels.iter().map(|c| c.name.as_str()).collect();
    channels.sort();
    assert_eq!(channels, vec!["@cmd:set", "orders"]);

    let target = MemoryStore::new();
    let options = ReplayOptions {
        mode: ReplayMode::Fast,
        ..ReplayOptions::default()
    };
    let report = Replayer::new(container)
        .run("mixed", Arc::new(target.clone()), options)
        .await
        .unwrap();
    assert_eq!(report.emitted, 2);
    assert_eq!(target.entries("orders").len(), 1);
}
