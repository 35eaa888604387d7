use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::container::{LogContainer, RecordingWriter};
use crate::event::{Event, Occurrence};
use crate::source::{spawn_source, ChannelSource, SourceMessage};
use crate::store::StreamId;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Capacity of the queue between sources and the writer loop.
    pub source_buffer: usize,
    /// Written to the recording metadata as its origin.
    pub source_label: String,
    /// Upper limit on a bounded stop before the sources are cut off.
    pub drain_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            source_buffer: 1024,
            source_label: "unknown".to_string(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Recording { name: String },
    Stopping { name: String },
    Failed { name: String, reason: String },
}

impl CaptureState {
    pub fn is_recording(&self) -> bool {
        matches!(self, CaptureState::Recording { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub events: u64,
    pub channels: usize,
    /// Occurrences too large to store.
    pub dropped: u64,
    /// Failure reason per source that ended with an error.
    pub source_failures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    #[serde(flatten)]
    pub state: CaptureState,
    pub stats: CaptureStats,
}

/// Result of one finished capture.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub name: String,
    pub events: u64,
    pub channels: usize,
    /// Timestamp of the last event.
    pub duration: Duration,
    pub failure: Option<String>,
}

struct ActiveCapture {
    name: String,
    /// Ends every source.
    cancel: CancellationToken,
    /// Ends the sources that cannot drain up to a stop bound.
    interrupt: CancellationToken,
    bound: watch::Sender<Option<StreamId>>,
    task: JoinHandle<CaptureSummary>,
}

/// Records occurrences from a set of sources into one recording at a time.
pub struct Capturer {
    container: Arc<LogContainer>,
    options: CaptureOptions,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<Mutex<CaptureStats>>,
    active: Option<ActiveCapture>,
}

impl Capturer {
    pub fn new(container: Arc<LogContainer>, options: CaptureOptions) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            container,
            options,
            state: Arc::new(state),
            stats: Arc::new(Mutex::new(CaptureStats::default())),
            active: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            state: self.state(),
            stats: lock_stats(&self.stats).clone(),
        }
    }

    /// Name of the recording in progress, if any.
    pub fn current(&self) -> Option<&str> {
        if self.state.borrow().is_recording() {
            self.active.as_ref().map(|a| a.name.as_str())
        } else {
            None
        }
    }

    pub async fn start(&mut self, name: &str, sources: Vec<Box<dyn ChannelSource>>) -> Result<()> {
        self.start_at(name, Utc::now(), sources).await
    }

    /// Starts recording `name`, anchored at `start_time`.
    pub async fn start_at(
        &mut self,
        name: &str,
        start_time: DateTime<Utc>,
        sources: Vec<Box<dyn ChannelSource>>,
    ) -> Result<()> {
        if let Some(active) = &self.active {
            let busy = matches!(
                *self.state.borrow(),
                CaptureState::Recording { .. } | CaptureState::Stopping { .. }
            );
            if busy {
                return Err(Error::InvalidState {
                    message: format!("already recording '{}'", active.name),
                });
            }
        }
        // A previous capture that ended on its own.
        if let Some(finished) = self.active.take() {
            let _ = finished.task.await;
        }
        if sources.is_empty() {
            return Err(Error::InvalidState {
                message: "a capture needs at least one source".to_string(),
            });
        }

        let writer = self
            .container
            .open_for_write_at(name, &self.options.source_label, start_time)
            .await?;

        *lock_stats(&self.stats) = CaptureStats::default();
        let cancel = CancellationToken::new();
        let interrupt = cancel.child_token();
        let (bound, _) = watch::channel(None);
        let (tx, rx) = mpsc::channel(self.options.source_buffer.max(1));
        let source_count = sources.len();
        for mut source in sources {
            let token = if source.bind_stop(bound.subscribe()) {
                cancel.child_token()
            } else {
                interrupt.child_token()
            };
            spawn_source(source, tx.clone(), token);
        }
        drop(tx);

        self.state.send_replace(CaptureState::Recording {
            name: name.to_string(),
        });
        info!(recording = %name, sources = source_count, "capture started");

        let run = CaptureLoop {
            writer,
            rx,
            live_sources: source_count,
            cancel: cancel.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
        };
        self.active = Some(ActiveCapture {
            name: name.to_string(),
            cancel,
            interrupt,
            bound,
            task: tokio::spawn(run.run()),
        });
        Ok(())
    }

    /// Stops the sources, drains what they already queued, and closes the
    /// recording.
    pub async fn stop(&mut self) -> Result<CaptureSummary> {
        let active = self.begin_stop()?;
        active.cancel.cancel();
        let joined = active.task.await;
        self.finish(&active.name, joined)
    }

    /// Stops at a control entry: stream sources deliver everything up to
    /// `bound` before ending, the others end at once. Sources still running
    /// after the drain timeout are cut off.
    pub async fn stop_at(&mut self, bound: StreamId) -> Result<CaptureSummary> {
        let active = self.begin_stop()?;
        active.bound.send_replace(Some(bound));
        active.interrupt.cancel();

        let mut task = active.task;
        let joined = match tokio::time::timeout(self.options.drain_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    recording = %active.name,
                    %bound,
                    timeout_ms = self.options.drain_timeout.as_millis() as u64,
                    "drain timed out, cutting sources off"
                );
                active.cancel.cancel();
                task.await
            }
        };
        active.cancel.cancel();
        self.finish(&active.name, joined)
    }

    fn begin_stop(&mut self) -> Result<ActiveCapture> {
        let Some(active) = self.active.take() else {
            return Err(Error::InvalidState {
                message: "no capture in progress".to_string(),
            });
        };
        if self.state.borrow().is_recording() {
            self.state.send_replace(CaptureState::Stopping {
                name: active.name.clone(),
            });
        }
        Ok(active)
    }

    fn finish(
        &self,
        name: &str,
        joined: std::result::Result<CaptureSummary, JoinError>,
    ) -> Result<CaptureSummary> {
        let summary = joined.map_err(|e| Error::InvalidState {
            message: format!("capture task for '{}' panicked: {}", name, e),
        })?;
        self.state.send_replace(CaptureState::Idle);
        Ok(summary)
    }
}

fn lock_stats(stats: &Mutex<CaptureStats>) -> std::sync::MutexGuard<'_, CaptureStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CaptureLoop {
    writer: RecordingWriter,
    rx: mpsc::Receiver<SourceMessage>,
    live_sources: usize,
    cancel: CancellationToken,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<Mutex<CaptureStats>>,
}

impl CaptureLoop {
    async fn run(mut self) -> CaptureSummary {
        let name = self.writer.name().to_string();
        let clock = Instant::now();
        let mut failure = None;

        // Ends when every source task has dropped its sender.
        while let Some(message) = self.rx.recv().await {
            match message {
                SourceMessage::Occurrence(occurrence) => {
                    let timestamp_ns = clock.elapsed().as_nanos() as u64;
                    let channel = occurrence.channel.clone();
                    match self.record(occurrence, timestamp_ns).await {
                        Ok(()) => {}
                        Err(e @ Error::FrameTooLarge { .. }) => {
                            warn!(recording = %name, %channel, error = %e, "occurrence dropped");
                            lock_stats(&self.stats).dropped += 1;
                        }
                        Err(e) => {
                            error!(recording = %name, error = %e, "append failed, aborting capture");
                            failure = Some(e.to_string());
                            self.cancel.cancel();
                            break;
                        }
                    }
                }
                SourceMessage::Ended { source, error } => {
                    self.live_sources -= 1;
                    if let Some(e) = error {
                        warn!(recording = %name, source = %source, error = %e, "source dropped");
                        lock_stats(&self.stats).source_failures.insert(source, e.to_string());
                    }
                    if self.live_sources == 0 && !self.cancel.is_cancelled() {
                        let failures = lock_stats(&self.stats).source_failures.len();
                        if failures > 0 {
                            failure = Some(format!("all {} sources failed", failures));
                        }
                    }
                }
            }
        }

        let events = self.writer.event_count();
        let channels = self.writer.channels().len();
        let duration = match self.writer.close().await {
            Ok(trailer) => Duration::from_nanos(trailer.last_timestamp_ns),
            Err(e) => {
                error!(recording = %name, error = %e, "failed to close recording");
                failure.get_or_insert_with(|| e.to_string());
                Duration::ZERO
            }
        };

        match &failure {
            Some(reason) => {
                self.state.send_replace(CaptureState::Failed {
                    name: name.clone(),
                    reason: reason.clone(),
                });
            }
            None => {
                info!(recording = %name, events, channels, "capture finished");
                if self.state.borrow().is_recording() {
                    // Every source ran dry without a stop request.
                    self.state.send_replace(CaptureState::Idle);
                }
            }
        }

        CaptureSummary {
            name,
            events,
            channels,
            duration,
            failure,
        }
    }

    async fn record(&mut self, occurrence: Occurrence, timestamp_ns: u64) -> Result<()> {
        let schema = occurrence.payload.schema();
        let before = self.writer.channels().len();
        self.writer.declare_channel(&occurrence.channel, schema).await?;
        if self.writer.channels().len() != before {
            debug!(channel = %occurrence.channel, %schema, "declared channel");
        }

        self.writer
            .append(&Event::new(occurrence.channel, timestamp_ns, &occurrence.payload))
            .await?;

        let mut stats = lock_stats(&self.stats);
        stats.events += 1;
        stats.channels = self.writer.channels().len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::WriterOptions;
    use crate::event::{CommandInvocation, Payload, Schema};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Yields its items with a gap between them, then idles until cancelled.
    struct Paced {
        items: VecDeque<Result<Occurrence>>,
        gap: Duration,
        exhaust: bool,
    }

    impl Paced {
        fn new(items: Vec<Result<Occurrence>>) -> Self {
            Self {
                items: items.into(),
                gap: Duration::from_millis(1),
                exhaust: false,
            }
        }
    }

    #[async_trait]
    impl ChannelSource for Paced {
        fn name(&self) -> &str {
            "paced"
        }

        async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Occurrence>> {
            match self.items.pop_front() {
                Some(item) => {
                    tokio::time::sleep(self.gap).await;
                    item.map(Some)
                }
                None if self.exhaust => Ok(None),
                None => {
                    cancel.cancelled().await;
                    Ok(None)
                }
            }
        }
    }

    fn set(key: &str) -> Occurrence {
        Occurrence::command(CommandInvocation::new("SET").arg(key.to_string()).arg("v"))
    }

    fn capturer(dir: &TempDir) -> (Arc<LogContainer>, Capturer) {
        let container = Arc::new(LogContainer::new(dir.path(), WriterOptions::default()));
        let capturer = Capturer::new(container.clone(), CaptureOptions::default());
        (container, capturer)
    }

    async fn wait_for_events(capturer: &Capturer, n: u64) {
        for _ in 0..500 {
            if capturer.status().stats.events >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("capture did not reach {} events", n);
    }

    #[tokio::test]
    async fn test_start_record_stop() {
        let dir = TempDir::new().unwrap();
        let (container, mut capturer) = capturer(&dir);

        let source = Paced::new(vec![Ok(set("a")), Ok(set("b")), Ok(set("c"))]);
        capturer.start("run", vec![Box::new(source)]).await.unwrap();
        assert!(capturer.state().is_recording());
        assert_eq!(capturer.current(), Some("run"));

        wait_for_events(&capturer, 3).await;
        let summary = capturer.stop().await.unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.channels, 1);
        assert!(summary.failure.is_none());
        assert_eq!(capturer.state(), CaptureState::Idle);

        let mut reader = container.open_for_read("run").await.unwrap();
        let events = reader.read_all().await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
        assert_eq!(reader.channels()[0].schema, Schema::Command);
        assert_eq!(
            events[1].decode().unwrap(),
            Payload::Command(CommandInvocation::new("SET").arg("b").arg("v"))
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_recording() {
        let dir = TempDir::new().unwrap();
        let (_container, mut capturer) = capturer(&dir);

        capturer.start("one", vec![Box::new(Paced::new(vec![]))]).await.unwrap();
        let err = capturer
            .start("two", vec![Box::new(Paced::new(vec![]))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        capturer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_surviving_source_keeps_recording() {
        let dir = TempDir::new().unwrap();
        let (_container, mut capturer) = capturer(&dir);

        let broken = Paced::new(vec![Err(Error::SourceProtocol {
            message: "garbled".to_string(),
        })]);
        let healthy = Paced::new(vec![Ok(set("a"))]);
        capturer
            .start("mixed", vec![Box::new(broken), Box::new(healthy)])
            .await
            .unwrap();

        wait_for_events(&capturer, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = capturer.status();
        assert!(status.state.is_recording());
        assert!(status.stats.source_failures.contains_key("paced"));

        let summary = capturer.stop().await.unwrap();
        assert_eq!(summary.events, 1);
        assert!(summary.failure.is_none());
    }

    #[tokio::test]
    async fn test_all_sources_failing_fails_capture_and_allows_restart() {
        let dir = TempDir::new().unwrap();
        let (container, mut capturer) = capturer(&dir);
        let mut states = capturer.subscribe();

        let broken = Paced::new(vec![
            Ok(set("a")),
            Err(Error::SourceProtocol {
                message: "garbled".to_string(),
            }),
        ]);
        capturer.start("doomed", vec![Box::new(broken)]).await.unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                states.changed().await.unwrap();
                if let CaptureState::Failed { reason, .. } = states.borrow().clone() {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(failed.contains("sources failed"));

        // Closed with a trailer despite the failure.
        let reader = container.open_for_read("doomed").await.unwrap();
        assert_eq!(reader.event_count(), 1);

        capturer
            .start("retry", vec![Box::new(Paced::new(vec![Ok(set("b"))]))])
            .await
            .unwrap();
        wait_for_events(&capturer, 1).await;
        capturer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_occurrence_is_dropped_and_capture_continues() {
        let dir = TempDir::new().unwrap();
        let options = WriterOptions {
            max_frame_len: 256,
            ..WriterOptions::default()
        };
        let container = Arc::new(LogContainer::new(dir.path(), options));
        let mut capturer = Capturer::new(container.clone(), CaptureOptions::default());

        let huge = Occurrence::command(CommandInvocation::new("SET").arg("big").arg(vec![0u8; 1024]));
        let source = Paced::new(vec![Ok(set("a")), Ok(huge), Ok(set("b"))]);
        capturer.start("bounded", vec![Box::new(source)]).await.unwrap();

        wait_for_events(&capturer, 2).await;
        let status = capturer.status();
        assert!(status.state.is_recording());
        assert_eq!(status.stats.dropped, 1);

        let summary = capturer.stop().await.unwrap();
        assert_eq!(summary.events, 2);
        assert!(summary.failure.is_none());
        assert_eq!(container.open_for_read("bounded").await.unwrap().event_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_sources_finish_cleanly() {
        let dir = TempDir::new().unwrap();
        let (container, mut capturer) = capturer(&dir);

        let mut source = Paced::new(vec![Ok(set("a"))]);
        source.exhaust = true;
        capturer.start("short", vec![Box::new(source)]).await.unwrap();

        let summary = capturer.stop().await.unwrap();
        assert!(summary.failure.is_none());
        assert!(container.open_for_read("short").await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_without_capture_is_invalid() {
        let dir = TempDir::new().unwrap();
        let (_container, mut capturer) = capturer(&dir);
        assert!(matches!(capturer.stop().await, Err(Error::InvalidState { .. })));
    }
}
