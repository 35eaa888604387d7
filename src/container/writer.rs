use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::format::{Channel, Frame, RecordingMeta, Trailer, EVENT_OVERHEAD, MAX_FRAME_LEN};
use super::lock::WriteLock;
use crate::event::{Event, Schema};
use crate::{Error, Result};

/// Durability settings for a recording writer.
///
/// Appends are buffered. Every `flush_every` appends the buffer is pushed to
/// the OS, which makes those events survive a crash of this process; with
/// `sync_on_flush` each flush is also fsynced so they survive power loss.
/// [`RecordingWriter::flush`] forces the same at any point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub flush_every: usize,
    pub sync_on_flush: bool,
    /// Largest frame body written, capped at [`MAX_FRAME_LEN`].
    pub max_frame_len: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            flush_every: 1,
            sync_on_flush: false,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Exclusive append handle for one recording.
pub struct RecordingWriter {
    meta: RecordingMeta,
    path: PathBuf,
    file: BufWriter<File>,
    options: WriterOptions,
    channels: Vec<Channel>,
    by_name: HashMap<String, u32>,
    last_timestamp: HashMap<u32, u64>,
    event_count: u64,
    max_timestamp_ns: u64,
    unflushed: usize,
    _lock: WriteLock,
}

impl RecordingWriter {
    pub(crate) async fn create(
        path: &Path,
        meta: RecordingMeta,
        options: WriterOptions,
        lock: WriteLock,
    ) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let mut file = BufWriter::new(file);
        file.write_all(&meta.encode_header()?).await?;
        file.flush().await?;
        file.get_ref().sync_all().await?;

        info!(recording = %meta.name, path = ?path, "opened recording for write");

        Ok(Self {
            meta,
            path: path.to_path_buf(),
            file,
            options,
            channels: Vec::new(),
            by_name: HashMap::new(),
            last_timestamp: HashMap::new(),
            event_count: 0,
            max_timestamp_ns: 0,
            unflushed: 0,
            _lock: lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &RecordingMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Registers a channel, returning its id.
    ///
    /// Re-declaring a channel with the same schema returns the existing id.
    pub async fn declare_channel(&mut self, name: &str, schema: Schema) -> Result<u32> {
        if name.is_empty() {
            return Err(Error::InvalidState {
                message: "channel name must not be empty".to_string(),
            });
        }

        if let Some(&id) = self.by_name.get(name) {
            let existing = self.channels[id as usize].schema;
            if existing != schema {
                return Err(Error::ChannelConflict {
                    channel: name.to_string(),
                    existing: existing.to_string(),
                    requested: schema.to_string(),
                });
            }
            return Ok(id);
        }

        let channel = Channel {
            id: self.channels.len() as u32,
            name: name.to_string(),
            schema,
        };
        self.write_frame(&Frame::Channel(channel.clone())).await?;

        debug!(recording = %self.meta.name, channel = %name, id = channel.id, %schema, "declared channel");
        self.by_name.insert(channel.name.clone(), channel.id);
        let id = channel.id;
        self.channels.push(channel);
        Ok(id)
    }

    /// Appends one event to a declared channel.
    ///
    /// An event too large for a single frame fails with
    /// [`Error::FrameTooLarge`] and leaves the recording untouched.
    pub async fn append(&mut self, event: &Event) -> Result<()> {
        let limit = self.options.max_frame_len.min(MAX_FRAME_LEN);
        let size = EVENT_OVERHEAD + event.payload.len();
        if size > limit {
            return Err(Error::FrameTooLarge { size, limit });
        }

        let id = *self
            .by_name
            .get(&event.channel)
            .ok_or_else(|| Error::SchemaMismatch {
                channel: event.channel.clone(),
                message: "channel has not been declared".to_string(),
            })?;

        let declared = self.channels[id as usize].schema;
        if declared != event.schema {
            return Err(Error::SchemaMismatch {
                channel: event.channel.clone(),
                message: format!("event is {}, channel is {}", event.schema, declared),
            });
        }
        if let Err(e) = declared.decode(&event.payload) {
            return Err(Error::SchemaMismatch {
                channel: event.channel.clone(),
                message: e.to_string(),
            });
        }

        if let Some(&last) = self.last_timestamp.get(&id) {
            if event.timestamp_ns < last {
                return Err(Error::InvalidState {
                    message: format!(
                        "timestamp {} on channel '{}' precedes previous {}",
                        event.timestamp_ns, event.channel, last
                    ),
                });
            }
        }

        self.write_frame(&Frame::Event {
            channel_id: id,
            timestamp_ns: event.timestamp_ns,
            payload: event.payload.clone(),
        })
        .await?;

        self.last_timestamp.insert(id, event.timestamp_ns);
        self.max_timestamp_ns = self.max_timestamp_ns.max(event.timestamp_ns);
        self.event_count += 1;
        Ok(())
    }

    /// Pushes buffered frames to the OS, fsyncing when configured.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        if self.options.sync_on_flush {
            self.file.get_ref().sync_data().await?;
        }
        self.unflushed = 0;
        Ok(())
    }

    /// Writes the trailer, syncs, and releases the write lock.
    pub async fn close(mut self) -> Result<Trailer> {
        let trailer = Trailer {
            event_count: self.event_count,
            channel_count: self.channels.len() as u32,
            last_timestamp_ns: self.max_timestamp_ns,
            closed_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.file.write_all(&Frame::Trailer(trailer).encode()).await?;
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;

        info!(
            recording = %self.meta.name,
            events = trailer.event_count,
            channels = trailer.channel_count,
            "closed recording"
        );
        Ok(trailer)
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode_within(self.options.max_frame_len)?;
        self.file.write_all(&encoded).await?;
        self.unflushed += 1;
        if self.unflushed >= self.options.flush_every {
            self.flush().await?;
        }
        Ok(())
    }
}
