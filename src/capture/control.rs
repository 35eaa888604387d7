//! Control-key driven captures.
//!
//! Clients request a recording by appending to the control stream:
//! `XADD <key> * d <name>` starts (or switches to) `<name>`, an empty name
//! stops. The [`CaptureService`] tails that key and drives a [`Capturer`]
//! through a command queue.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capturer::{CaptureState, Capturer};
use crate::backoff::Backoff;
use crate::config::RecordingConfig;
use crate::container::LogContainer;
use crate::event::CommandInvocation;
use crate::source::{
    ChannelSource, CommandFilter, FirehoseSource, StreamTailConfig, StreamTailSource, TailedKeys,
};
use crate::store::{Connector, StoreConnection, StreamId, StreamRecord};
use crate::{Error, Result};

/// Field of a control entry holding the recording name.
pub const NAME_FIELD: &str = "d";

/// Entries fetched per control read; the last of each read wins.
const CONTROL_READ_COUNT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start { name: String },
    Stop,
}

impl ControlCommand {
    /// Interprets a control entry. A missing or empty name means stop.
    pub fn from_record(record: &StreamRecord) -> Self {
        let name = record
            .fields
            .iter()
            .find(|(field, _)| field.as_ref() == NAME_FIELD.as_bytes())
            .map(|(_, value)| String::from_utf8_lossy(value).trim().to_string())
            .unwrap_or_default();
        if name.is_empty() {
            ControlCommand::Stop
        } else {
            ControlCommand::Start { name }
        }
    }
}

/// Asks a running service to start recording `name`.
pub async fn request_start(
    conn: &mut dyn StoreConnection,
    key: &str,
    name: &str,
) -> Result<StreamId> {
    crate::container::validate_name(name)?;
    append_control(conn, key, name).await
}

/// Asks a running service to stop the current recording.
pub async fn request_stop(conn: &mut dyn StoreConnection, key: &str) -> Result<StreamId> {
    append_control(conn, key, "").await
}

async fn append_control(conn: &mut dyn StoreConnection, key: &str, name: &str) -> Result<StreamId> {
    let command = CommandInvocation::new("XADD")
        .arg(key.to_string())
        .arg("*")
        .arg(NAME_FIELD)
        .arg(name.to_string());
    let id: StreamId = conn.invoke(&command).await?.into_result()?.into_string()?.parse()?;
    debug!(key, name, %id, "control entry appended");
    Ok(id)
}

/// Start time encoded in a control entry id.
pub fn entry_time(id: StreamId) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(id.ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Tails the control key, yielding the latest command of each read.
pub struct ControlListener {
    connector: Arc<dyn Connector>,
    key: String,
    cursor: StreamId,
    block: Duration,
    conn: Option<Box<dyn StoreConnection>>,
    backoff: Backoff,
}

impl ControlListener {
    /// Starts from the beginning of the key so the latest request already
    /// present is honoured.
    pub fn new(connector: Arc<dyn Connector>, config: &RecordingConfig) -> Self {
        Self {
            connector,
            key: config.record_key.clone(),
            cursor: StreamId::MIN,
            block: Duration::from_millis(config.wait_block_ms),
            conn: None,
            backoff: Backoff::new(config.reconnect_backoff()),
        }
    }

    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<(StreamId, ControlCommand)>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.poll(cancel).await {
                Ok(Some(latest)) => {
                    self.backoff.reset();
                    return Ok(Some(latest));
                }
                Ok(None) => self.backoff.reset(),
                Err(e) if e.is_transient() => {
                    self.conn = None;
                    let Some(delay) = self.backoff.next_delay() else {
                        return Err(e);
                    };
                    warn!(key = %self.key, error = %e, "control read failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<(StreamId, ControlCommand)>> {
        if self.conn.is_none() {
            self.conn = Some(self.connector.connect().await?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };

        let mut latest: Option<StreamRecord> = None;
        let mut block = self.block;
        loop {
            let cursors = [(self.key.clone(), self.cursor)];
            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = conn.read_streams(&cursors, CONTROL_READ_COUNT, block) => Some(read?),
            };
            let Some(batches) = read else {
                self.conn = None;
                return Ok(None);
            };

            let records: Vec<StreamRecord> =
                batches.into_iter().flat_map(|batch| batch.records).collect();
            let full = records.len() >= CONTROL_READ_COUNT;
            if let Some(last) = records.into_iter().last() {
                self.cursor = last.id;
                latest = Some(last);
            }
            // Keep reading without blocking until the backlog is consumed.
            if !full {
                break;
            }
            block = Duration::from_millis(1);
        }

        Ok(latest.map(|record| (record.id, ControlCommand::from_record(&record))))
    }
}

/// Long-running capture driven by control commands.
pub struct CaptureService {
    connector: Arc<dyn Connector>,
    config: RecordingConfig,
    capturer: Capturer,
}

impl CaptureService {
    pub fn new(connector: Arc<dyn Connector>, config: RecordingConfig) -> Self {
        let container = Arc::new(LogContainer::new(&config.out_dir, config.writer_options()));
        let options = config.capture_options(connector.describe());
        Self {
            capturer: Capturer::new(container, options),
            connector,
            config,
        }
    }

    pub fn capturer(&self) -> &Capturer {
        &self.capturer
    }

    /// Sources for a recording anchored at `start`, as configured.
    pub fn build_sources(&self, start: DateTime<Utc>) -> Result<Vec<Box<dyn ChannelSource>>> {
        build_sources(self.connector.clone(), &self.config, start)
    }

    /// Applies the command of control entry `id`. Starting the recording
    /// already in progress is a no-op; starting a different one stops the
    /// current recording first. Either way the recording being stopped keeps
    /// stream entries up to `id` and none after it.
    pub async fn apply(&mut self, command: ControlCommand, id: StreamId) -> Result<()> {
        match command {
            ControlCommand::Start { name } => {
                if self.capturer.current() == Some(name.as_str()) {
                    debug!(recording = %name, "already recording");
                    return Ok(());
                }
                self.stop_current(Some(id)).await?;
                let at = entry_time(id);
                let sources = self.build_sources(at)?;
                self.capturer.start_at(&name, at, sources).await
            }
            ControlCommand::Stop => self.stop_current(Some(id)).await,
        }
    }

    async fn stop_current(&mut self, bound: Option<StreamId>) -> Result<()> {
        if self.capturer.state() == CaptureState::Idle {
            return Ok(());
        }
        let stopped = match bound {
            Some(bound) => self.capturer.stop_at(bound).await,
            None => self.capturer.stop().await,
        };
        match stopped {
            Ok(summary) => {
                info!(
                    recording = %summary.name,
                    events = summary.events,
                    channels = summary.channels,
                    "recording finished"
                );
                Ok(())
            }
            // Already reaped.
            Err(Error::InvalidState { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consumes commands until the queue closes or `cancel` fires, then
    /// stops any recording in progress.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<(StreamId, ControlCommand)>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut states = self.capturer.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = commands.recv() => {
                    let Some((id, command)) = next else { break };
                    info!(?command, %id, "control command");
                    if let Err(e) = self.apply(command, id).await {
                        error!(error = %e, "control command failed");
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    if let CaptureState::Failed { name, reason } = state {
                        error!(recording = %name, %reason, "recording failed");
                    }
                }
            }
        }
        self.stop_current(None).await
    }

    /// Tails the control key and runs the service until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let mut listener = ControlListener::new(self.connector.clone(), &self.config);
        let (tx, rx) = mpsc::channel(16);
        info!(key = %self.config.record_key, "waiting for control commands");

        let listen_cancel = cancel.child_token();
        let listen = tokio::spawn(async move {
            loop {
                match listener.next(&listen_cancel).await {
                    Ok(Some((id, command))) => {
                        if tx.send((id, command)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        });

        let result = self.run(rx, cancel.clone()).await;
        cancel.cancel();
        let listened = listen.await.map_err(|e| Error::InvalidState {
            message: format!("control listener panicked: {}", e),
        })?;
        result.and(listened)
    }
}

/// Builds the configured sources: a stream tail when streams are listed and
/// the firehose when enabled.
pub fn build_sources(
    connector: Arc<dyn Connector>,
    config: &RecordingConfig,
    start: DateTime<Utc>,
) -> Result<Vec<Box<dyn ChannelSource>>> {
    let mut sources: Vec<Box<dyn ChannelSource>> = Vec::new();
    let mut tailed = None;
    if !config.streams.is_empty() {
        let tail = StreamTailConfig::from_recording(config);
        tailed = Some(TailedKeys::new(&tail)?);
        sources.push(Box::new(StreamTailSource::new(connector.clone(), tail, start)?));
    }
    if config.firehose {
        let db = connector.db();
        let mut firehose = FirehoseSource::new(
            connector,
            CommandFilter::new(&config.commands),
            config.reconnect_backoff(),
        )
        .with_db(db)
        .ignore_key(config.record_key.clone());
        // Appends to tailed streams are already recorded as entries.
        if let Some(tailed) = tailed {
            firehose = firehose.skip_tailed(tailed);
        }
        sources.push(Box::new(firehose));
    }
    if sources.is_empty() {
        return Err(Error::Config(
            "nothing to record: no streams configured and firehose disabled".to_string(),
        ));
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn record_config(dir: &TempDir) -> RecordingConfig {
        RecordingConfig {
            out_dir: dir.path().to_path_buf(),
            streams: vec!["orders".to_string()],
            data_block_ms: 20,
            wait_block_ms: 20,
            ..RecordingConfig::default()
        }
    }

    #[test]
    fn test_command_from_record() {
        let record = |value: &'static str| StreamRecord {
            id: StreamId::new(1, 0),
            fields: vec![(Bytes::from_static(b"d"), Bytes::from_static(value.as_bytes()))],
        };
        assert_eq!(
            ControlCommand::from_record(&record("run-1")),
            ControlCommand::Start {
                name: "run-1".to_string()
            }
        );
        assert_eq!(ControlCommand::from_record(&record("")), ControlCommand::Stop);
        let no_field = StreamRecord {
            id: StreamId::new(1, 0),
            fields: Vec::new(),
        };
        assert_eq!(ControlCommand::from_record(&no_field), ControlCommand::Stop);
    }

    #[tokio::test]
    async fn test_listener_yields_latest_entry_of_backlog() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        request_start(conn.as_mut(), "XRECORD:ACTIVE", "first").await.unwrap();
        request_stop(conn.as_mut(), "XRECORD:ACTIVE").await.unwrap();
        request_start(conn.as_mut(), "XRECORD:ACTIVE", "second").await.unwrap();

        let mut listener = ControlListener::new(Arc::new(store.clone()), &record_config(&dir));
        let cancel = CancellationToken::new();
        let (_, command) = listener.next(&cancel).await.unwrap().unwrap();
        assert_eq!(
            command,
            ControlCommand::Start {
                name: "second".to_string()
            }
        );

        request_stop(conn.as_mut(), "XRECORD:ACTIVE").await.unwrap();
        let (_, command) = listener.next(&cancel).await.unwrap().unwrap();
        assert_eq!(command, ControlCommand::Stop);
    }

    #[tokio::test]
    async fn test_rejects_invalid_names() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        let err = request_start(conn.as_mut(), "XRECORD:ACTIVE", "../escape").await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_switches() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut service = CaptureService::new(Arc::new(store.clone()), record_config(&dir));
        let now = StreamId::at(Utc::now());

        service
            .apply(ControlCommand::Start { name: "a".to_string() }, now)
            .await
            .unwrap();
        service
            .apply(ControlCommand::Start { name: "a".to_string() }, now)
            .await
            .unwrap();
        assert_eq!(service.capturer().current(), Some("a"));

        service
            .apply(ControlCommand::Start { name: "b".to_string() }, now)
            .await
            .unwrap();
        assert_eq!(service.capturer().current(), Some("b"));

        service.apply(ControlCommand::Stop, now).await.unwrap();
        service.apply(ControlCommand::Stop, now).await.unwrap();
        assert_eq!(service.capturer().state(), CaptureState::Idle);

        assert!(dir.path().join("a.rrec").exists());
        assert!(dir.path().join("b.rrec").exists());
        assert!(!dir.path().join("a_1.rrec").exists());
    }

    #[tokio::test]
    async fn test_firehose_follows_the_selected_database() {
        let store = MemoryStore::new();
        let config = RecordingConfig {
            streams: Vec::new(),
            firehose: true,
            ..RecordingConfig::default()
        };
        let mut sources = build_sources(Arc::new(store.clone()), &config, Utc::now()).unwrap();
        assert_eq!(sources.len(), 1);
        let mut firehose = sources.remove(0);

        let cancel = CancellationToken::new();
        let next = tokio::spawn(async move { firehose.next(&cancel).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.observe(crate::store::ObservedCommand {
            db: Some(3),
            client: None,
            command: CommandInvocation::new("SET").arg("elsewhere").arg("v"),
        });
        let mut conn = store.connect().await.unwrap();
        conn.invoke(&CommandInvocation::new("SET").arg("here").arg("v"))
            .await
            .unwrap();

        let occurrence = tokio::time::timeout(Duration::from_secs(2), next)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        match occurrence.payload {
            crate::event::Payload::Command(command) => assert_eq!(command.args[0].as_ref(), b"here"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_build_sources_needs_something_to_record() {
        let config = RecordingConfig {
            streams: Vec::new(),
            firehose: false,
            ..RecordingConfig::default()
        };
        let err = build_sources(Arc::new(MemoryStore::new()), &config, Utc::now())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
