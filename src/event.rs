//! Captured events and the payload schemas that describe them.
//!
//! An [`Event`] is what the log container stores: a channel name, a
//! capture-relative timestamp and an opaque payload. The payload bytes are
//! only meaningful together with the channel's [`Schema`], which knows how to
//! turn them back into a [`Payload`] that replay can re-issue.

use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Prefix for channels that carry firehose-tapped commands.
pub const COMMAND_CHANNEL_PREFIX: &str = "@cmd:";

/// Marker that starts every command channel. Stream keys that begin with
/// it are escaped by doubling it, so the two namespaces never meet.
const RESERVED_MARKER: char = '@';

/// Channel name for entries of the stream `key`.
pub fn stream_channel(key: &str) -> String {
    if key.starts_with(RESERVED_MARKER) {
        format!("{}{}", RESERVED_MARKER, key)
    } else {
        key.to_string()
    }
}

/// Decode/encode contract for the payloads of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Schema {
    /// One entry appended to a stream.
    #[serde(rename = "stream-entry/v1")]
    StreamEntry,
    /// One command invocation, name plus arguments.
    #[serde(rename = "command/v1")]
    Command,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::StreamEntry => "stream-entry/v1",
            Schema::Command => "command/v1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stream-entry/v1" => Some(Schema::StreamEntry),
            "command/v1" => Some(Schema::Command),
            _ => None,
        }
    }

    /// Decodes payload bytes written under this schema.
    pub fn decode(&self, data: &[u8]) -> Result<Payload> {
        let mut cursor = data;
        let payload = match self {
            Schema::StreamEntry => {
                let stream = read_str(&mut cursor, "stream key")?;
                let id = read_str(&mut cursor, "entry id")?;
                let count = read_u32(&mut cursor, "field count")? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let field = read_bytes(&mut cursor, "field")?;
                    let value = read_bytes(&mut cursor, "value")?;
                    fields.push((field, value));
                }
                Payload::StreamEntry(StreamEntry { stream, id, fields })
            }
            Schema::Command => {
                let name = read_str(&mut cursor, "command name")?;
                let count = read_u32(&mut cursor, "argument count")? as usize;
                let mut args = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    args.push(read_bytes(&mut cursor, "argument")?);
                }
                Payload::Command(CommandInvocation { name, args })
            }
        };

        if cursor.has_remaining() {
            return Err(Error::InvalidPayload {
                message: format!(
                    "{} trailing bytes after {} payload",
                    cursor.remaining(),
                    self
                ),
            });
        }

        Ok(payload)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream entry as observed on the source store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    /// Entry id assigned by the source store (`<ms>-<seq>`).
    pub id: String,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// A command invocation: name and raw arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl CommandInvocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Lowercased command name, used for channel naming and filtering.
    pub fn family(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name.to_ascii_uppercase())?;
        for arg in &self.args {
            write!(f, " {}", render_bytes(arg))?;
        }
        Ok(())
    }
}

/// Typed view of an event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    StreamEntry(StreamEntry),
    Command(CommandInvocation),
}

impl Payload {
    pub fn schema(&self) -> Schema {
        match self {
            Payload::StreamEntry(_) => Schema::StreamEntry,
            Payload::Command(_) => Schema::Command,
        }
    }

    /// Encodes the payload in the binary form of its schema.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Payload::StreamEntry(entry) => {
                put_str(&mut buf, &entry.stream);
                put_str(&mut buf, &entry.id);
                buf.put_u32_le(entry.fields.len() as u32);
                for (field, value) in &entry.fields {
                    put_bytes(&mut buf, field);
                    put_bytes(&mut buf, value);
                }
            }
            Payload::Command(cmd) => {
                put_str(&mut buf, &cmd.name);
                buf.put_u32_le(cmd.args.len() as u32);
                for arg in &cmd.args {
                    put_bytes(&mut buf, arg);
                }
            }
        }
        buf.freeze()
    }
}

/// One occurrence observed by a source, before it is timestamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub channel: String,
    pub payload: Payload,
}

impl Occurrence {
    /// Occurrence for a stream entry, on the channel named after its key.
    pub fn stream_entry(entry: StreamEntry) -> Self {
        Self {
            channel: stream_channel(&entry.stream),
            payload: Payload::StreamEntry(entry),
        }
    }

    /// Occurrence for a tapped command. The channel is `@cmd:<family>`.
    pub fn command(cmd: CommandInvocation) -> Self {
        Self {
            channel: format!("{}{}", COMMAND_CHANNEL_PREFIX, cmd.family()),
            payload: Payload::Command(cmd),
        }
    }
}

/// One captured event as stored in a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub channel: String,
    /// Nanoseconds since the recording's start, on the capture clock.
    pub timestamp_ns: u64,
    pub schema: Schema,
    pub payload: Bytes,
}

impl Event {
    pub fn new(channel: impl Into<String>, timestamp_ns: u64, payload: &Payload) -> Self {
        Self {
            channel: channel.into(),
            timestamp_ns,
            schema: payload.schema(),
            payload: payload.encode(),
        }
    }

    pub fn decode(&self) -> Result<Payload> {
        self.schema.decode(&self.payload)
    }
}

/// Renders bytes for humans: UTF-8 text when possible, base64 otherwise.
pub fn render_bytes(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!(
            "base64:{}",
            base64::engine::general_purpose::STANDARD.encode(data)
        ),
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn read_u32(cursor: &mut &[u8], what: &str) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(Error::InvalidPayload {
            message: format!("truncated {}", what),
        });
    }
    Ok(cursor.get_u32_le())
}

fn read_str(cursor: &mut &[u8], what: &str) -> Result<String> {
    let len = read_u32(cursor, what)? as usize;
    if cursor.remaining() < len {
        return Err(Error::InvalidPayload {
            message: format!("truncated {}", what),
        });
    }
    let value = std::str::from_utf8(&cursor[..len])
        .map_err(|_| Error::InvalidPayload {
            message: format!("{} is not valid UTF-8", what),
        })?
        .to_string();
    cursor.advance(len);
    Ok(value)
}

fn read_bytes(cursor: &mut &[u8], what: &str) -> Result<Bytes> {
    let len = read_u32(cursor, what)? as usize;
    if cursor.remaining() < len {
        return Err(Error::InvalidPayload {
            message: format!("truncated {}", what),
        });
    }
    let value = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(value)
}
