#![allow(dead_code)]

use redis_record::capture::{CaptureState, Capturer};
use redis_record::config::RecordingConfig;
use std::env;
use std::path::Path;
use std::time::Duration;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("redis_record=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Recording settings with short block times so tests stay quick.
pub fn recording_config(out_dir: &Path, streams: &[&str]) -> RecordingConfig {
    RecordingConfig {
        out_dir: out_dir.to_path_buf(),
        streams: streams.iter().map(|s| s.to_string()).collect(),
        stream_refresh_ms: 50,
        data_block_ms: 20,
        wait_block_ms: 50,
        no_streams_sleep_ms: 20,
        reconnect_initial_ms: 5,
        reconnect_max_ms: 20,
        ..RecordingConfig::default()
    }
}

/// Redis address for the ignored live tests.
pub fn redis_host() -> String {
    env::var("TEST_REDIS_HOST").unwrap_or_else(|_| "localhost".to_string())
}

/// Polls until the capturer has appended `events` events.
pub async fn wait_for_events(capturer: &Capturer, events: u64) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while capturer.status().stats.events < events {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "expected {} events, saw {}",
        events,
        capturer.status().stats.events
    );
}

/// Polls until `check` holds for the capturer's state.
pub async fn wait_for_state(capturer: &Capturer, check: impl Fn(&CaptureState) -> bool) {
    let mut states = capturer.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| check(s))).await;
    assert!(waited.is_ok(), "state never reached, now {:?}", capturer.state());
}
