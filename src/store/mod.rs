//! Store capabilities consumed by sources, control, and replay.
//!
//! The engine needs three things from a store: read stream entries after a
//! position, tap every executed command, and invoke a command. They are
//! expressed as the [`StoreConnection`] and [`Connector`] traits so the
//! capture and replay logic does not depend on a particular transport.

pub mod memory;
pub mod monitor;
pub mod redis;
pub mod resp;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::event::CommandInvocation;
use crate::{Error, Result};

pub use memory::MemoryStore;
pub use redis::RedisConnector;
pub use resp::RespValue;

/// Stream entry id, `<milliseconds>-<sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// First id at or after a wall-clock instant.
    pub fn at(time: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            ms: time.timestamp_millis().max(0) as u64,
            seq: 0,
        }
    }

    /// The greatest id strictly below this one.
    pub fn predecessor(self) -> Self {
        match (self.ms, self.seq) {
            (0, 0) => self,
            (ms, 0) => Self {
                ms: ms - 1,
                seq: u64::MAX,
            },
            (ms, seq) => Self { ms, seq: seq - 1 },
        }
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid stream id '{}'", s));
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| invalid())?,
                seq: 0,
            }),
        }
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// Entries of one stream returned by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub records: Vec<StreamRecord>,
}

/// A command observed on the store's execution feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedCommand {
    /// Database the command ran against, when the feed reports it.
    pub db: Option<u32>,
    /// Client address, or `lua` for scripted commands.
    pub client: Option<String>,
    pub command: CommandInvocation,
}

/// Feed of executed commands. Ends when the underlying connection closes.
pub type CommandFeed = BoxStream<'static, Result<ObservedCommand>>;

/// One request/response connection to a store.
#[async_trait]
pub trait StoreConnection: Send {
    async fn ping(&mut self) -> Result<()>;

    /// Reads entries strictly after each `(stream, id)` cursor.
    ///
    /// Blocks up to `block` when nothing is available and then returns an
    /// empty vector.
    async fn read_streams(
        &mut self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>>;

    /// Keys of type stream, optionally filtered by a glob pattern.
    async fn scan_streams(&mut self, pattern: Option<&str>) -> Result<Vec<String>>;

    /// Invokes a command and returns the raw reply.
    ///
    /// Error replies are returned as [`RespValue::Error`], not as `Err`, so
    /// callers can tell a rejected command from a broken connection.
    async fn invoke(&mut self, command: &CommandInvocation) -> Result<RespValue>;
}

/// Factory for store connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>>;

    /// Opens a dedicated connection that reports every executed command.
    async fn tap_commands(&self) -> Result<CommandFeed>;

    /// Human-readable address for logs and recording metadata.
    fn describe(&self) -> String;

    /// Database that `connect` selects.
    fn db(&self) -> u32;
}
