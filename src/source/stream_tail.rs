//! Tails store streams, following named streams and glob patterns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{wait_reconnect, ChannelSource, StopBound};
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::RecordingConfig;
use crate::event::{Occurrence, StreamEntry};
use crate::store::{Connector, StoreConnection, StreamBatch, StreamId};
use crate::{Error, Result};

/// Longest a read blocks while draining; entries up to the stop already exist.
const DRAIN_BLOCK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct StreamTailConfig {
    /// Stream keys or glob patterns such as `orders:*`.
    pub streams: Vec<String>,
    /// Glob patterns never tailed, even when a pattern matches them.
    pub ignore: Vec<String>,
    /// Maximum entries per stream per read.
    pub count: usize,
    /// How long a read blocks when no entry is available.
    pub block: Duration,
    /// Interval between key scans for pattern streams.
    pub refresh: Duration,
    /// Sleep while no stream matches yet.
    pub idle_sleep: Duration,
    pub reconnect: BackoffConfig,
}

impl StreamTailConfig {
    /// Builds the tail settings for a recording; the control key is always ignored.
    pub fn from_recording(config: &RecordingConfig) -> Self {
        let mut ignore = config.ignore_streams.clone();
        ignore.push(glob::Pattern::escape(&config.record_key));
        Self {
            streams: config.streams.clone(),
            ignore,
            count: config.read_count.max(1),
            block: Duration::from_millis(config.data_block_ms),
            refresh: Duration::from_millis(config.stream_refresh_ms),
            idle_sleep: Duration::from_millis(config.no_streams_sleep_ms),
            reconnect: config.reconnect_backoff(),
        }
    }
}

fn is_pattern(stream: &str) -> bool {
    stream.contains(['*', '?', '['])
}

/// The set of stream keys a tail follows.
#[derive(Debug, Clone)]
pub struct TailedKeys {
    include: Vec<glob::Pattern>,
    ignore: Vec<glob::Pattern>,
}

impl TailedKeys {
    pub fn new(config: &StreamTailConfig) -> Result<Self> {
        let compile = |p: &str| {
            glob::Pattern::new(p)
                .map_err(|e| Error::Config(format!("invalid stream pattern '{}': {}", p, e)))
        };
        let include = config
            .streams
            .iter()
            .map(|s| {
                if is_pattern(s) {
                    compile(s)
                } else {
                    compile(&glob::Pattern::escape(s))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let ignore = config
            .ignore
            .iter()
            .map(|s| compile(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { include, ignore })
    }

    pub fn covers(&self, key: &str) -> bool {
        self.include.iter().any(|p| p.matches(key)) && !self.ignore.iter().any(|p| p.matches(key))
    }
}

pub struct StreamTailSource {
    connector: Arc<dyn Connector>,
    config: StreamTailConfig,
    patterns: Vec<glob::Pattern>,
    ignore: Vec<glob::Pattern>,
    /// Streams discovered after start begin here.
    anchor: StreamId,
    /// Last id handed out per stream.
    cursors: BTreeMap<String, StreamId>,
    conn: Option<Box<dyn StoreConnection>>,
    last_scan: Option<Instant>,
    pending: VecDeque<Occurrence>,
    backoff: Backoff,
    stop: Option<StopBound>,
    /// Streams read up to the stop bound.
    drained: BTreeSet<String>,
    draining: bool,
}

impl StreamTailSource {
    /// Creates a tail that captures entries added at or after `start`.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: StreamTailConfig,
        start: DateTime<Utc>,
    ) -> Result<Self> {
        let compile = |p: &String| {
            glob::Pattern::new(p)
                .map_err(|e| Error::Config(format!("invalid stream pattern '{}': {}", p, e)))
        };
        let patterns = config
            .streams
            .iter()
            .filter(|s| is_pattern(s))
            .map(compile)
            .collect::<Result<Vec<_>>>()?;
        let ignore = config.ignore.iter().map(compile).collect::<Result<Vec<_>>>()?;

        let anchor = StreamId::at(start).predecessor();
        let cursors = config
            .streams
            .iter()
            .filter(|s| !is_pattern(s))
            .filter(|s| !ignore.iter().any(|p| p.matches(s)))
            .map(|s| (s.clone(), anchor))
            .collect();

        let backoff = Backoff::new(config.reconnect);
        Ok(Self {
            connector,
            config,
            patterns,
            ignore,
            anchor,
            cursors,
            conn: None,
            last_scan: None,
            pending: VecDeque::new(),
            backoff,
            stop: None,
            drained: BTreeSet::new(),
            draining: false,
        })
    }

    /// Streams currently tailed with their last delivered id.
    pub fn cursors(&self) -> &BTreeMap<String, StreamId> {
        &self.cursors
    }

    fn stop_bound(&self) -> Option<StreamId> {
        self.stop.as_ref().and_then(|stop| *stop.borrow())
    }

    fn drain_complete(&self) -> bool {
        self.cursors.keys().all(|stream| self.drained.contains(stream))
    }

    async fn connection(&mut self) -> Result<&mut Box<dyn StoreConnection>> {
        if self.conn.is_none() {
            let conn = self.connector.connect().await?;
            debug!(store = %self.connector.describe(), "stream tail connected");
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Connection("no store connection".to_string()))
    }

    async fn discover(&mut self) -> Result<()> {
        if self.patterns.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.last_scan {
            if last.elapsed() < self.config.refresh {
                return Ok(());
            }
        }

        let patterns: Vec<String> = self.patterns.iter().map(|p| p.as_str().to_string()).collect();
        let mut found = Vec::new();
        let conn = self.connection().await?;
        for pattern in &patterns {
            found.extend(conn.scan_streams(Some(pattern)).await?);
        }

        for key in found {
            if self.cursors.contains_key(&key) || self.ignore.iter().any(|p| p.matches(&key)) {
                continue;
            }
            info!(stream = %key, from = %self.anchor, "tailing new stream");
            self.cursors.insert(key, self.anchor);
        }
        self.last_scan = Some(Instant::now());
        Ok(())
    }

    /// One discovery-and-read round. Fills `pending`.
    async fn poll(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.discover().await?;
        let bound = self.stop_bound();

        if self.cursors.is_empty() {
            if bound.is_some() {
                return Ok(());
            }
            trace!("no streams to tail yet");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.idle_sleep) => {}
            }
            return Ok(());
        }

        let cursors: Vec<(String, StreamId)> = self
            .cursors
            .iter()
            .filter(|(s, _)| !self.drained.contains(*s))
            .map(|(s, id)| (s.clone(), *id))
            .collect();
        if cursors.is_empty() {
            return Ok(());
        }
        let count = self.config.count;
        let block = match bound {
            Some(_) => self.config.block.min(DRAIN_BLOCK),
            None => self.config.block,
        };
        let mut stop = self.stop.clone();
        let conn = self.connection().await?;

        let batches = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = stop_requested(&mut stop), if bound.is_none() => None,
            read = conn.read_streams(&cursors, count, block) => Some(read?),
        };
        match batches {
            Some(batches) => self.accept(&cursors, batches, bound),
            // The reply to an abandoned request may still arrive.
            None => self.conn = None,
        }
        Ok(())
    }

    /// Queues new entries. With a stop bound, a stream is drained once a read
    /// brings nothing new or reaches an entry later than the bound's
    /// millisecond; later entries are dropped.
    fn accept(
        &mut self,
        queried: &[(String, StreamId)],
        batches: Vec<StreamBatch>,
        bound: Option<StreamId>,
    ) {
        let mut advanced = BTreeSet::new();
        for batch in batches {
            let Some(cursor) = self.cursors.get_mut(&batch.stream) else {
                continue;
            };
            for record in batch.records {
                // Redelivery after a reconnect.
                if record.id <= *cursor {
                    continue;
                }
                if let Some(bound) = bound {
                    if record.id.ms > bound.ms {
                        debug!(stream = %batch.stream, id = %record.id, %bound, "entry after stop, stream drained");
                        self.drained.insert(batch.stream.clone());
                        break;
                    }
                }
                *cursor = record.id;
                advanced.insert(batch.stream.clone());
                self.pending.push_back(Occurrence::stream_entry(StreamEntry {
                    stream: batch.stream.clone(),
                    id: record.id.to_string(),
                    fields: record.fields,
                }));
            }
        }
        if bound.is_some() {
            for (stream, _) in queried {
                if !advanced.contains(stream) {
                    self.drained.insert(stream.clone());
                }
            }
        }
    }
}

#[async_trait]
impl ChannelSource for StreamTailSource {
    fn name(&self) -> &str {
        "stream-tail"
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Occurrence>> {
        loop {
            if let Some(occurrence) = self.pending.pop_front() {
                return Ok(Some(occurrence));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(bound) = self.stop_bound() {
                if !self.draining {
                    info!(%bound, streams = self.cursors.len(), "draining streams up to stop");
                    self.draining = true;
                    // Streams created since the last scan still count.
                    self.last_scan = None;
                } else if self.drain_complete() {
                    info!(%bound, streams = self.drained.len(), "streams drained");
                    return Ok(None);
                }
            }

            match self.poll(cancel).await {
                Ok(()) => self.backoff.reset(),
                Err(e) if e.is_transient() => {
                    self.conn = None;
                    if !wait_reconnect(&mut self.backoff, "stream-tail", &e, cancel).await? {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(Error::SourceProtocol {
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    fn bind_stop(&mut self, stop: StopBound) -> bool {
        self.stop = Some(stop);
        true
    }
}

/// Resolves once a stop bound is set. Never resolves without a bound.
async fn stop_requested(stop: &mut Option<StopBound>) {
    let set = match stop {
        Some(stop) => stop.wait_for(Option::is_some).await.is_ok(),
        None => false,
    };
    if !set {
        std::future::pending::<()>().await;
    }
}
