use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use super::format::{
    Channel, Frame, RecordingMeta, Trailer, FRAME_PREFIX_LEN, HEADER_PREFIX_LEN,
};
use crate::event::Event;
use crate::{Error, Result};

/// Position of one event frame in a recording file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLocation {
    /// Append order of the event within the recording.
    pub seq: u64,
    pub offset: u64,
    pub channel_id: u32,
    pub timestamp_ns: u64,
}

/// Why a recording could only be read partially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    /// Byte offset of the first unreadable frame.
    pub offset: u64,
    pub reason: String,
}

/// Read handle for one recording.
///
/// Opening scans the whole file once to validate every frame and build the
/// channel table and an index of event positions. Events are then read on
/// demand, sequentially or by location.
#[derive(Debug)]
pub struct RecordingReader {
    meta: RecordingMeta,
    path: PathBuf,
    channels: Vec<Channel>,
    by_name: HashMap<String, u32>,
    index: Vec<EventLocation>,
    trailer: Option<Trailer>,
    truncation: Option<Truncation>,
    file: File,
    cursor: usize,
}

impl RecordingReader {
    /// Opens a recording. With `strict`, any truncation is an error.
    pub(crate) async fn open(path: &Path, name: &str, strict: bool) -> Result<Self> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let file_len = file.metadata().await?.len();
        let mut scan = BufReader::new(file);

        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        if scan.read_exact(&mut prefix).await.is_err() {
            return Err(corrupt(name, 0, "header truncated"));
        }
        let meta_len = RecordingMeta::decode_prefix(&prefix).map_err(|e| corrupt(name, 0, e))?;
        let mut meta = vec![0u8; meta_len];
        scan.read_exact(&mut meta)
            .await
            .map_err(|_| corrupt(name, 0, "header truncated"))?;
        let meta = RecordingMeta::decode_meta(&meta).map_err(|e| corrupt(name, 0, e))?;

        let mut offset = (HEADER_PREFIX_LEN + meta_len) as u64;

        let mut channels: Vec<Channel> = Vec::new();
        let mut by_name = HashMap::new();
        let mut index = Vec::new();
        let mut trailer = None;
        let mut truncation = None;

        loop {
            if offset == file_len {
                break;
            }
            if file_len - offset < FRAME_PREFIX_LEN as u64 {
                truncation = Some(Truncation {
                    offset,
                    reason: "torn frame header".to_string(),
                });
                break;
            }

            let mut frame_prefix = [0u8; FRAME_PREFIX_LEN];
            scan.read_exact(&mut frame_prefix).await?;
            let (len, crc) = match Frame::decode_prefix(&frame_prefix) {
                Ok(parsed) => parsed,
                Err(e) => {
                    truncation = Some(Truncation {
                        offset,
                        reason: e.to_string(),
                    });
                    break;
                }
            };
            if file_len - offset - (FRAME_PREFIX_LEN as u64) < len as u64 {
                truncation = Some(Truncation {
                    offset,
                    reason: "torn frame".to_string(),
                });
                break;
            }

            let mut body = vec![0u8; len];
            scan.read_exact(&mut body).await?;
            let frame = match Frame::decode_body(&body, crc) {
                Ok(frame) => frame,
                Err(e) => {
                    truncation = Some(Truncation {
                        offset,
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            match frame {
                Frame::Channel(channel) => {
                    if channel.id as usize != channels.len() || by_name.contains_key(&channel.name) {
                        truncation = Some(Truncation {
                            offset,
                            reason: format!("inconsistent declaration of channel '{}'", channel.name),
                        });
                        break;
                    }
                    by_name.insert(channel.name.clone(), channel.id);
                    channels.push(channel);
                }
                Frame::Event {
                    channel_id,
                    timestamp_ns,
                    ..
                } => {
                    if channel_id as usize >= channels.len() {
                        truncation = Some(Truncation {
                            offset,
                            reason: format!("event on undeclared channel {}", channel_id),
                        });
                        break;
                    }
                    index.push(EventLocation {
                        seq: index.len() as u64,
                        offset,
                        channel_id,
                        timestamp_ns,
                    });
                }
                Frame::Trailer(t) => {
                    if t.event_count != index.len() as u64 {
                        truncation = Some(Truncation {
                            offset,
                            reason: format!(
                                "trailer counts {} events, found {}",
                                t.event_count,
                                index.len()
                            ),
                        });
                    } else {
                        trailer = Some(t);
                    }
                    break;
                }
            }

            offset += (FRAME_PREFIX_LEN + len) as u64;
        }

        if trailer.is_none() && truncation.is_none() {
            truncation = Some(Truncation {
                offset,
                reason: "missing trailer".to_string(),
            });
        }

        if let Some(t) = &truncation {
            if strict {
                return Err(Error::Corrupt {
                    name: name.to_string(),
                    valid_events: index.len() as u64,
                    reason: t.reason.clone(),
                });
            }
            warn!(
                recording = %name,
                valid_events = index.len(),
                offset = t.offset,
                reason = %t.reason,
                "recording is truncated, reading recoverable prefix"
            );
        }

        debug!(recording = %name, events = index.len(), channels = channels.len(), "scanned recording");

        Ok(Self {
            meta,
            path: path.to_path_buf(),
            channels,
            by_name,
            index,
            trailer,
            truncation,
            file: scan.into_inner(),
            cursor: 0,
        })
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

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(id as usize)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(name).and_then(|&id| self.channel(id))
    }

    pub fn index(&self) -> &[EventLocation] {
        &self.index
    }

    pub fn event_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    pub fn truncation(&self) -> Option<&Truncation> {
        self.truncation.as_ref()
    }

    /// Span between the start of the recording and its last event.
    pub fn duration(&self) -> Duration {
        let last = match &self.trailer {
            Some(t) => t.last_timestamp_ns,
            None => self.index.iter().map(|l| l.timestamp_ns).max().unwrap_or(0),
        };
        Duration::from_nanos(last)
    }

    /// Reads the next event in append order.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        let Some(location) = self.index.get(self.cursor).copied() else {
            return Ok(None);
        };
        let event = self.read_at(&location).await?;
        self.cursor += 1;
        Ok(Some(event))
    }

    /// Moves the sequential cursor back to the first event.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Reads every event in append order.
    pub async fn read_all(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(self.index.len());
        for location in self.index.clone() {
            events.push(self.read_at(&location).await?);
        }
        Ok(events)
    }

    /// Reads the event at an indexed location.
    pub async fn read_at(&mut self, location: &EventLocation) -> Result<Event> {
        self.file.seek(SeekFrom::Start(location.offset)).await?;

        let mut frame_prefix = [0u8; FRAME_PREFIX_LEN];
        self.file.read_exact(&mut frame_prefix).await?;
        let (len, crc) = Frame::decode_prefix(&frame_prefix)?;
        let mut body = vec![0u8; len];
        self.file.read_exact(&mut body).await?;

        match Frame::decode_body(&body, crc)? {
            Frame::Event {
                channel_id,
                timestamp_ns,
                payload,
            } => {
                let channel = self.channel(channel_id).ok_or_else(|| Error::InvalidPayload {
                    message: format!("event on undeclared channel {}", channel_id),
                })?;
                Ok(Event {
                    channel: channel.name.clone(),
                    timestamp_ns,
                    schema: channel.schema,
                    payload,
                })
            }
            _ => Err(Error::InvalidPayload {
                message: format!("no event frame at offset {}", location.offset),
            }),
        }
    }
}

fn corrupt(name: &str, valid_events: u64, reason: impl ToString) -> Error {
    Error::Corrupt {
        name: name.to_string(),
        valid_events,
        reason: reason.to_string(),
    }
}
