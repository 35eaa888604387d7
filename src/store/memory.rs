//! In-process store used for dry-run replays and tests.
//!
//! Supports the subset of commands the engine issues (`XADD`, `XLEN`,
//! `PING`) and acknowledges everything else with `OK`, logging each
//! invocation with the instant it arrived.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{
    CommandFeed, Connector, ObservedCommand, RespValue, StoreConnection, StreamBatch, StreamId,
    StreamRecord,
};
use crate::event::CommandInvocation;
use crate::{Error, Result};

const XADD_ID_TOO_SMALL: &str =
    "ERR The ID specified in XADD is equal or smaller than the target stream top item";

/// A command received by the store and when it arrived.
#[derive(Debug, Clone)]
pub struct InvokedCommand {
    pub at: Instant,
    pub command: CommandInvocation,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, Vec<StreamRecord>>,
    invoked: Vec<InvokedCommand>,
    unreachable: bool,
    failing_reads: u32,
    failing_invokes: u32,
    lost_replies: u32,
    garbled_replies: u32,
    connections: u64,
}

struct Shared {
    state: Mutex<State>,
    appended: Notify,
    feed: broadcast::Sender<ObservedCommand>,
}

/// Cheaply cloneable handle; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(4096);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                feed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unreachable, connects and in-flight requests fail with a
    /// connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Fails the next `n` stream reads with a connection error.
    pub fn fail_next_reads(&self, n: u32) {
        self.state().failing_reads = n;
    }

    /// Fails the next `n` invocations with a connection error.
    pub fn fail_next_invokes(&self, n: u32) {
        self.state().failing_invokes = n;
    }

    /// Applies the next `n` client invocations but loses their replies.
    pub fn lose_next_replies(&self, n: u32) {
        self.state().lost_replies = n;
    }

    /// Applies the next `n` client invocations but answers with bytes that
    /// are not a valid reply.
    pub fn garble_next_replies(&self, n: u32) {
        self.state().garbled_replies = n;
    }

    /// Reports a command on the execution feed without applying it, as if
    /// another client ran it, possibly on another database.
    pub fn observe(&self, observed: ObservedCommand) {
        let _ = self.shared.feed.send(observed);
    }

    /// Connections opened so far.
    pub fn connections(&self) -> u64 {
        self.state().connections
    }

    /// Appends an entry to a stream as a client would, with `*` or an
    /// explicit id.
    pub fn xadd(&self, stream: &str, id: &str, fields: &[(&str, &str)]) -> Result<StreamId> {
        let mut command = CommandInvocation::new("XADD").arg(stream.to_string()).arg(id.to_string());
        for (field, value) in fields {
            command = command.arg(field.to_string()).arg(value.to_string());
        }
        let reply = self.execute(command)?;
        reply.into_result()?.into_string()?.parse()
    }

    /// Entries of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamRecord> {
        self.state().streams.get(stream).cloned().unwrap_or_default()
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<InvokedCommand> {
        self.state().invoked.clone()
    }

    fn execute(&self, command: CommandInvocation) -> Result<RespValue> {
        let reply = {
            let mut state = self.state();
            if state.unreachable {
                return Err(Error::Connection("store unreachable".to_string()));
            }
            if state.failing_invokes > 0 {
                state.failing_invokes -= 1;
                return Err(Error::Connection("injected invoke failure".to_string()));
            }
            state.invoked.push(InvokedCommand {
                at: Instant::now(),
                command: command.clone(),
            });
            apply(&mut state, &command)
        };

        if matches!(reply, RespValue::Bulk(Some(_))) && command.family() == "xadd" {
            self.shared.appended.notify_waiters();
        }
        // No subscribers is fine.
        let _ = self.shared.feed.send(ObservedCommand {
            db: Some(0),
            client: None,
            command,
        });
        Ok(reply)
    }

    /// Applies reply damage injected for client connections.
    fn deliver(&self, command: &CommandInvocation, reply: RespValue) -> Result<RespValue> {
        let mut state = self.state();
        if state.lost_replies > 0 {
            state.lost_replies -= 1;
            return Err(Error::ReplyLost {
                command: command.name.clone(),
                source: Box::new(Error::Connection("injected lost reply".to_string())),
            });
        }
        if state.garbled_replies > 0 {
            state.garbled_replies -= 1;
            return Err(Error::Protocol("unknown reply type byte 0x3f".to_string()));
        }
        Ok(reply)
    }

    fn read_ready(
        &self,
        cursors: &[(String, StreamId)],
        count: usize,
    ) -> Result<Vec<StreamBatch>> {
        let mut state = self.state();
        if state.unreachable {
            return Err(Error::Connection("store unreachable".to_string()));
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::Connection("injected read failure".to_string()));
        }

        let mut batches = Vec::new();
        for (stream, after) in cursors {
            let Some(entries) = state.streams.get(stream) else {
                continue;
            };
            let records: Vec<StreamRecord> = entries
                .iter()
                .filter(|r| r.id > *after)
                .take(count.max(1))
                .cloned()
                .collect();
            if !records.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    records,
                });
            }
        }
        Ok(batches)
    }
}

fn apply(state: &mut State, command: &CommandInvocation) -> RespValue {
    match command.family().as_str() {
        "ping" => RespValue::Simple("PONG".to_string()),
        "xadd" => xadd(state, &command.args),
        "xlen" => {
            let len = command
                .args
                .first()
                .and_then(|key| state.streams.get(String::from_utf8_lossy(key).as_ref()))
                .map_or(0, Vec::len);
            RespValue::Integer(len as i64)
        }
        _ => RespValue::ok(),
    }
}

fn xadd(state: &mut State, args: &[Bytes]) -> RespValue {
    if args.len() < 4 || args.len() % 2 != 0 {
        return RespValue::Error("ERR wrong number of arguments for 'xadd' command".to_string());
    }
    let stream = String::from_utf8_lossy(&args[0]).to_string();
    let requested = String::from_utf8_lossy(&args[1]).to_string();
    let entries = state.streams.entry(stream).or_default();
    let top = entries.last().map(|r| r.id);

    let id = if requested == "*" {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        match top {
            Some(top) if top.ms >= now => StreamId::new(top.ms, top.seq + 1),
            _ => StreamId::new(now, 0),
        }
    } else {
        let Ok(id) = requested.parse::<StreamId>() else {
            return RespValue::Error(
                "ERR Invalid stream ID specified as stream command argument".to_string(),
            );
        };
        if id == StreamId::MIN || top.is_some_and(|top| id <= top) {
            return RespValue::Error(XADD_ID_TOO_SMALL.to_string());
        }
        id
    };

    let fields = args[2..]
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    entries.push(StreamRecord { id, fields });
    RespValue::bulk(id.to_string())
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        let mut state = self.state();
        if state.unreachable {
            return Err(Error::Connection("store unreachable".to_string()));
        }
        state.connections += 1;
        drop(state);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }

    async fn tap_commands(&self) -> Result<CommandFeed> {
        if self.state().unreachable {
            return Err(Error::Connection("store unreachable".to_string()));
        }
        let feed = BroadcastStream::new(self.shared.feed.subscribe()).filter_map(|item| async move {
            match item {
                Ok(observed) => Some(Ok(observed)),
                Err(e) => {
                    debug!(error = %e, "command feed lagged");
                    None
                }
            }
        });
        Ok(feed.boxed())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn db(&self) -> u32 {
        0
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.store.execute(CommandInvocation::new("PING")).map(|_| ())
    }

    async fn read_streams(
        &mut self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed.
            let appended = self.store.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batches = self.store.read_ready(cursors, count)?;
            if !batches.is_empty() {
                return Ok(batches);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn scan_streams(&mut self, pattern: Option<&str>) -> Result<Vec<String>> {
        let state = self.store.state();
        if state.unreachable {
            return Err(Error::Connection("store unreachable".to_string()));
        }
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| Error::Protocol(format!("invalid pattern: {}", e)))?;
        Ok(state
            .streams
            .keys()
            .filter(|key| pattern.as_ref().map_or(true, |p| p.matches(key)))
            .cloned()
            .collect())
    }

    async fn invoke(&mut self, command: &CommandInvocation) -> Result<RespValue> {
        let reply = self.store.execute(command.clone())?;
        self.store.deliver(command, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_xadd_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.xadd("orders", "*", &[("id", "1")]).unwrap();
        let b = store.xadd("orders", "*", &[("id", "2")]).unwrap();
        assert!(b > a);
        assert_eq!(store.entries("orders").len(), 2);
    }

    #[tokio::test]
    async fn test_xadd_rejects_stale_explicit_id() {
        let store = MemoryStore::new();
        store.xadd("s", "5-0", &[("f", "v")]).unwrap();
        let err = store.xadd("s", "5-0", &[("f", "v")]).unwrap_err();
        assert!(matches!(err, Error::Server(ref m) if m.contains("equal or smaller")));
        assert!(store.xadd("s", "5-1", &[("f", "v")]).is_ok());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.xadd("s", "*", &[("k", "v")]).unwrap();
        });

        let batches = conn
            .read_streams(&[("s".to_string(), StreamId::MIN)], 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 1);
    }

    #[tokio::test]
    async fn test_read_times_out_empty() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        let batches = conn
            .read_streams(&[("s".to_string(), StreamId::MIN)], 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        assert!(store.connect().await.err().unwrap().is_transient());
        store.set_reachable(true);

        let mut conn = store.connect().await.unwrap();
        store.fail_next_invokes(1);
        assert!(conn.invoke(&CommandInvocation::new("PING")).await.is_err());
        assert!(conn.invoke(&CommandInvocation::new("PING")).await.is_ok());
    }

    #[tokio::test]
    async fn test_tap_sees_commands() {
        let store = MemoryStore::new();
        let mut feed = store.tap_commands().await.unwrap();
        let mut conn = store.connect().await.unwrap();
        conn.invoke(&CommandInvocation::new("SET").arg("k").arg("v"))
            .await
            .unwrap();

        let observed = feed.next().await.unwrap().unwrap();
        assert_eq!(observed.command.name, "SET");
    }

    #[tokio::test]
    async fn test_scan_streams_by_pattern() {
        let store = MemoryStore::new();
        store.xadd("orders", "*", &[("a", "1")]).unwrap();
        store.xadd("events:x", "*", &[("a", "1")]).unwrap();
        let mut conn = store.connect().await.unwrap();
        assert_eq!(
            conn.scan_streams(Some("events:*")).await.unwrap(),
            vec!["events:x".to_string()]
        );
        assert_eq!(conn.scan_streams(None).await.unwrap().len(), 2);
    }
}
