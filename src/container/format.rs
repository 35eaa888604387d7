//! On-disk layout of a recording file.
//!
//! ```text
//! header:  "RREC" | version u16 | flags u16 | meta_len u32 | meta (JSON)
//! frame*:  len u32 | crc32 u32 | kind u8 | body (len - 1 bytes)
//! ```
//!
//! All integers are little-endian. The CRC covers `kind` and `body`. Frames
//! are channel declarations, events, and a single closing trailer. A file
//! without a trailer was not closed cleanly; its frames are still readable up
//! to the first short or damaged one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Schema;
use crate::{Error, Result};

pub const MAGIC: &[u8; 4] = b"RREC";
pub const FORMAT_VERSION: u16 = 1;
pub const FILE_EXTENSION: &str = "rrec";

/// Fixed part of the file header preceding the metadata block.
pub const HEADER_PREFIX_LEN: usize = 12;

/// Length and checksum preceding every frame.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Largest frame body. Writers refuse larger frames and readers treat them
/// as damage, so everything a writer accepts reads back.
pub const MAX_FRAME_LEN: usize = 1024 * 1024 * 1024;

/// Event frame body bytes besides the payload: kind, channel id, timestamp.
pub const EVENT_OVERHEAD: usize = 1 + 4 + 8;

const KIND_CHANNEL: u8 = 1;
const KIND_EVENT: u8 = 2;
const KIND_TRAILER: u8 = 3;

/// Recording-level metadata stored in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub name: String,
    /// Wall-clock anchor for the capture clock.
    pub start_time: DateTime<Utc>,
    /// Free-form description of what was captured.
    pub source: String,
}

impl RecordingMeta {
    pub fn encode_header(&self) -> Result<Bytes> {
        let meta = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(HEADER_PREFIX_LEN + meta.len());
        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(meta.len() as u32);
        buf.put_slice(&meta);
        Ok(buf.freeze())
    }

    /// Parses the fixed header prefix, returning the metadata block length.
    pub fn decode_prefix(mut prefix: &[u8]) -> Result<usize> {
        if prefix.len() < HEADER_PREFIX_LEN || &prefix[..4] != MAGIC {
            return Err(Error::InvalidPayload {
                message: "not a recording file (bad magic)".to_string(),
            });
        }
        prefix.advance(4);
        let version = prefix.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(Error::InvalidPayload {
                message: format!("unsupported recording format version {}", version),
            });
        }
        let _flags = prefix.get_u16_le();
        let meta_len = prefix.get_u32_le() as usize;
        if meta_len > MAX_FRAME_LEN {
            return Err(Error::InvalidPayload {
                message: format!("metadata block of {} bytes is implausible", meta_len),
            });
        }
        Ok(meta_len)
    }

    pub fn decode_meta(meta: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(meta)?)
    }
}

/// Entry of a recording's channel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub schema: Schema,
}

/// Summary written when a recording is closed cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub event_count: u64,
    pub channel_count: u32,
    /// Largest event timestamp, i.e. the recording's duration.
    pub last_timestamp_ns: u64,
    pub closed_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Channel(Channel),
    Event {
        channel_id: u32,
        timestamp_ns: u64,
        payload: Bytes,
    },
    Trailer(Trailer),
}

impl Frame {
    /// Serializes the frame including its length and checksum prefix.
    ///
    /// Fails with [`Error::FrameTooLarge`] when the body exceeds `limit`.
    pub fn encode_within(&self, limit: usize) -> Result<Bytes> {
        let encoded = self.encode();
        let size = encoded.len() - FRAME_PREFIX_LEN;
        if size > limit.min(MAX_FRAME_LEN) {
            return Err(Error::FrameTooLarge {
                size,
                limit: limit.min(MAX_FRAME_LEN),
            });
        }
        Ok(encoded)
    }

    /// Serializes the frame including its length and checksum prefix.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Frame::Channel(channel) => {
                body.put_u8(KIND_CHANNEL);
                body.put_u32_le(channel.id);
                body.put_u32_le(channel.name.len() as u32);
                body.put_slice(channel.name.as_bytes());
                let schema = channel.schema.as_str();
                body.put_u8(schema.len() as u8);
                body.put_slice(schema.as_bytes());
            }
            Frame::Event {
                channel_id,
                timestamp_ns,
                payload,
            } => {
                body.put_u8(KIND_EVENT);
                body.put_u32_le(*channel_id);
                body.put_u64_le(*timestamp_ns);
                body.put_slice(payload);
            }
            Frame::Trailer(trailer) => {
                body.put_u8(KIND_TRAILER);
                body.put_u64_le(trailer.event_count);
                body.put_u32_le(trailer.channel_count);
                body.put_u64_le(trailer.last_timestamp_ns);
                body.put_i64_le(trailer.closed_at_ms);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Reads the frame prefix, returning `(body_len, crc)`.
    pub fn decode_prefix(mut prefix: &[u8]) -> Result<(usize, u32)> {
        let len = prefix.get_u32_le() as usize;
        let crc = prefix.get_u32_le();
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(Error::InvalidPayload {
                message: format!("frame length {} out of range", len),
            });
        }
        Ok((len, crc))
    }

    /// Verifies and decodes a frame body.
    pub fn decode_body(body: &[u8], crc: u32) -> Result<Self> {
        if crc32fast::hash(body) != crc {
            return Err(Error::InvalidPayload {
                message: "frame checksum mismatch".to_string(),
            });
        }

        if body.is_empty() {
            return Err(short("empty"));
        }

        let mut cursor = body;
        let kind = cursor.get_u8();
        match kind {
            KIND_CHANNEL => {
                if cursor.remaining() < 8 {
                    return Err(short("channel"));
                }
                let id = cursor.get_u32_le();
                let name_len = cursor.get_u32_le() as usize;
                if cursor.remaining() <= name_len {
                    return Err(short("channel name"));
                }
                let name = std::str::from_utf8(&cursor[..name_len])
                    .map_err(|_| Error::InvalidPayload {
                        message: "channel name is not valid UTF-8".to_string(),
                    })?
                    .to_string();
                cursor.advance(name_len);
                let schema_len = cursor.get_u8() as usize;
                if cursor.remaining() < schema_len {
                    return Err(short("channel schema"));
                }
                let schema_name = String::from_utf8_lossy(&cursor[..schema_len]).to_string();
                let schema = Schema::parse(&schema_name).ok_or_else(|| Error::InvalidPayload {
                    message: format!("unknown schema '{}'", schema_name),
                })?;
                Ok(Frame::Channel(Channel { id, name, schema }))
            }
            KIND_EVENT => {
                if cursor.remaining() < 12 {
                    return Err(short("event"));
                }
                let channel_id = cursor.get_u32_le();
                let timestamp_ns = cursor.get_u64_le();
                Ok(Frame::Event {
                    channel_id,
                    timestamp_ns,
                    payload: Bytes::copy_from_slice(cursor),
                })
            }
            KIND_TRAILER => {
                if cursor.remaining() < 28 {
                    return Err(short("trailer"));
                }
                Ok(Frame::Trailer(Trailer {
                    event_count: cursor.get_u64_le(),
                    channel_count: cursor.get_u32_le(),
                    last_timestamp_ns: cursor.get_u64_le(),
                    closed_at_ms: cursor.get_i64_le(),
                }))
            }
            other => Err(Error::InvalidPayload {
                message: format!("unknown frame kind {}", other),
            }),
        }
    }
}

fn short(what: &str) -> Error {
    Error::InvalidPayload {
        message: format!("{} frame too short", what),
    }
}
