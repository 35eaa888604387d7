//! Append-only log container for recordings.
//!
//! A [`LogContainer`] is a directory of recordings, one file per name. Writers
//! are exclusive per name ([`lock`]); readers are shared and may open a
//! recording while it is still being written, seeing everything up to the
//! last complete frame.
//!
//! # Example
//!
//! ```rust,no_run
//! use redis_record::container::{LogContainer, WriterOptions};
//! use redis_record::event::{Event, Payload, CommandInvocation};
//!
//! # async fn example() -> redis_record::Result<()> {
//! let container = LogContainer::new("./recordings", WriterOptions::default());
//!
//! let mut writer = container.open_for_write("session-1", "manual").await?;
//! let payload = Payload::Command(CommandInvocation::new("SET").arg("k").arg("v"));
//! writer.declare_channel("cmd:set", payload.schema()).await?;
//! writer.append(&Event::new("cmd:set", 0, &payload)).await?;
//! writer.close().await?;
//!
//! let mut reader = container.open_for_read("session-1").await?;
//! while let Some(event) = reader.next_event().await? {
//!     println!("{} @ {}ns", event.channel, event.timestamp_ns);
//! }
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod lock;
pub mod reader;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::event::Schema;
use crate::{Error, Result};

pub use format::{Channel, RecordingMeta, Trailer};
pub use lock::WriterRegistry;
pub use reader::{EventLocation, RecordingReader, Truncation};
pub use writer::{RecordingWriter, WriterOptions};

use format::FILE_EXTENSION;

/// Directory of recordings.
#[derive(Debug, Clone)]
pub struct LogContainer {
    dir: PathBuf,
    options: WriterOptions,
}

/// Per-channel line of [`RecordingInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: u32,
    pub name: String,
    pub schema: Schema,
    pub event_count: u64,
}

/// Metadata of one recording.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub name: String,
    pub source: String,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub event_count: u64,
    pub channels: Vec<ChannelInfo>,
    pub truncated: bool,
    pub truncation_reason: Option<String>,
    pub size_bytes: u64,
}

/// One line of [`LogContainer::list`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub event_count: u64,
    pub channel_count: usize,
    pub truncated: bool,
    pub size_bytes: u64,
}

impl LogContainer {
    pub fn new(dir: impl AsRef<Path>, options: WriterOptions) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path backing a recording name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, FILE_EXTENSION)))
    }

    /// Opens a new recording for exclusive appending.
    ///
    /// Fails with [`Error::AlreadyOpen`] while another writer holds the name.
    /// A finished recording already stored under the name is moved aside to
    /// `<name>_<n>`.
    pub async fn open_for_write(&self, name: &str, source: &str) -> Result<RecordingWriter> {
        self.open_for_write_at(name, source, Utc::now()).await
    }

    /// Like [`open_for_write`](Self::open_for_write) with an explicit start anchor.
    pub async fn open_for_write_at(
        &self,
        name: &str,
        source: &str,
        start_time: DateTime<Utc>,
    ) -> Result<RecordingWriter> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let lock = WriterRegistry::global().acquire_async(name, &path).await?;
        self.move_aside(name, &path).await?;

        let meta = RecordingMeta {
            name: name.to_string(),
            start_time,
            source: source.to_string(),
        };
        RecordingWriter::create(&path, meta, self.options, lock).await
    }

    /// Opens a cleanly closed recording for reading.
    ///
    /// Fails with [`Error::Corrupt`] when the trailer is missing or any frame
    /// is damaged; use [`open_recovering`](Self::open_recovering) to read the
    /// valid prefix of such a recording.
    pub async fn open_for_read(&self, name: &str) -> Result<RecordingReader> {
        RecordingReader::open(&self.path_for(name)?, name, true).await
    }

    /// Opens a recording, reading up to the last valid frame.
    ///
    /// The reader reports whether anything was cut off via
    /// [`RecordingReader::is_truncated`].
    pub async fn open_recovering(&self, name: &str) -> Result<RecordingReader> {
        RecordingReader::open(&self.path_for(name)?, name, false).await
    }

    /// Whether a writer in this process holds the recording open.
    pub fn is_writing(&self, name: &str) -> bool {
        self.path_for(name)
            .map(|path| WriterRegistry::global().is_held(&path))
            .unwrap_or(false)
    }

    pub async fn info(&self, name: &str) -> Result<RecordingInfo> {
        let reader = self.open_recovering(name).await?;
        let size_bytes = tokio::fs::metadata(reader.path()).await?.len();

        let mut counts = vec![0u64; reader.channels().len()];
        for location in reader.index() {
            counts[location.channel_id as usize] += 1;
        }

        Ok(RecordingInfo {
            name: name.to_string(),
            source: reader.meta().source.clone(),
            start_time: reader.meta().start_time,
            duration: reader.duration(),
            event_count: reader.event_count(),
            channels: reader
                .channels()
                .iter()
                .map(|c| ChannelInfo {
                    id: c.id,
                    name: c.name.clone(),
                    schema: c.schema,
                    event_count: counts[c.id as usize],
                })
                .collect(),
            truncated: reader.is_truncated(),
            truncation_reason: reader.truncation().map(|t| t.reason.clone()),
            size_bytes,
        })
    }

    /// Lists recordings in the directory, sorted by name.
    ///
    /// Files that cannot be parsed at all are listed as truncated with no
    /// start time rather than failing the listing.
    pub async fn list(&self) -> Result<Vec<RecordingSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let size_bytes = entry.metadata().await?.len();

            match RecordingReader::open(&path, &name, false).await {
                Ok(reader) => summaries.push(RecordingSummary {
                    start_time: Some(reader.meta().start_time),
                    duration: reader.duration(),
                    event_count: reader.event_count(),
                    channel_count: reader.channels().len(),
                    truncated: reader.is_truncated(),
                    size_bytes,
                    name,
                }),
                Err(e) => {
                    warn!(path = ?path, error = %e, "unreadable recording");
                    summaries.push(RecordingSummary {
                        name,
                        start_time: None,
                        duration: Duration::ZERO,
                        event_count: 0,
                        channel_count: 0,
                        truncated: true,
                        size_bytes,
                    });
                }
            }
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn move_aside(&self, name: &str, path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }

        let mut n = 1u32;
        loop {
            let candidate = self.dir.join(format!("{}_{}.{}", name, n, FILE_EXTENSION));
            if !tokio::fs::try_exists(&candidate).await? {
                tokio::fs::rename(path, &candidate).await?;
                info!(recording = %name, moved_to = ?candidate, "moved previous recording aside");
                return Ok(());
            }
            n += 1;
        }
    }
}

/// Recording names become file names: non-empty, no separators, no dot files.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('.')
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if valid {
        Ok(())
    } else {
        debug!(name, "rejected recording name");
        Err(Error::InvalidName(name.to_string()))
    }
}
