//! Captures executed commands from the store's command feed.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream_tail::TailedKeys;
use super::{wait_reconnect, ChannelSource};
use crate::backoff::{Backoff, BackoffConfig};
use crate::event::Occurrence;
use crate::store::{CommandFeed, Connector, ObservedCommand};
use crate::{Error, Result};

/// Data-mutating commands captured when no allow-list is configured.
pub const DEFAULT_COMMANDS: &[&str] = &[
    // strings
    "set", "setex", "psetex", "setnx", "setrange", "append", "getset", "getdel", "getex",
    "incr", "incrby", "incrbyfloat", "decr", "decrby", "mset", "msetnx",
    // keys
    "del", "unlink", "expire", "expireat", "pexpire", "pexpireat", "persist", "rename",
    "renamenx", "copy",
    // hashes
    "hset", "hsetnx", "hmset", "hdel", "hincrby", "hincrbyfloat",
    // lists
    "lpush", "lpushx", "rpush", "rpushx", "lpop", "rpop", "lset", "linsert", "lrem", "ltrim",
    "lmove", "rpoplpush",
    // sets
    "sadd", "srem", "spop", "smove", "sinterstore", "sunionstore", "sdiffstore",
    // sorted sets
    "zadd", "zincrby", "zrem", "zremrangebyscore", "zremrangebyrank", "zremrangebylex",
    "zpopmin", "zpopmax", "zunionstore", "zinterstore",
    // streams
    "xadd", "xdel", "xtrim", "xsetid",
];

/// Ordered, case-insensitive set of command names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFilter {
    names: Vec<String>,
}

impl CommandFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filtered: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            if !name.is_empty() && !filtered.contains(&name) {
                filtered.push(name);
            }
        }
        Self { names: filtered }
    }

    pub fn allows(&self, command: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(command))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for CommandFilter {
    fn default() -> Self {
        Self::new(DEFAULT_COMMANDS)
    }
}

pub struct FirehoseSource {
    connector: Arc<dyn Connector>,
    filter: CommandFilter,
    db: Option<u32>,
    ignore_keys: Vec<String>,
    tailed: Option<TailedKeys>,
    feed: Option<CommandFeed>,
    backoff: Backoff,
}

impl FirehoseSource {
    pub fn new(connector: Arc<dyn Connector>, filter: CommandFilter, reconnect: BackoffConfig) -> Self {
        Self {
            connector,
            filter,
            db: None,
            ignore_keys: Vec::new(),
            tailed: None,
            feed: None,
            backoff: Backoff::new(reconnect),
        }
    }

    /// Only keep commands that ran against `db`.
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = Some(db);
        self
    }

    /// Drop `XADD`s to streams a stream tail already records.
    pub fn skip_tailed(mut self, tailed: TailedKeys) -> Self {
        self.tailed = Some(tailed);
        self
    }

    /// Drop commands whose first argument is `key`.
    pub fn ignore_key(mut self, key: impl Into<String>) -> Self {
        self.ignore_keys.push(key.into());
        self
    }

    fn keep(&self, observed: &ObservedCommand) -> bool {
        if let (Some(want), Some(got)) = (self.db, observed.db) {
            if want != got {
                return false;
            }
        }
        if !self.filter.allows(&observed.command.name) {
            return false;
        }
        let Some(key) = observed.command.args.first() else {
            return true;
        };
        if self.ignore_keys.iter().any(|k| k.as_bytes() == key.as_ref()) {
            return false;
        }
        match &self.tailed {
            Some(tailed) if observed.command.family() == "xadd" => {
                !tailed.covers(&String::from_utf8_lossy(key))
            }
            _ => true,
        }
    }

    async fn recover(&mut self, cause: Error, cancel: &CancellationToken) -> Result<bool> {
        self.feed = None;
        if !cause.is_transient() {
            return Err(Error::SourceProtocol {
                message: cause.to_string(),
            });
        }
        wait_reconnect(&mut self.backoff, "firehose", &cause, cancel).await
    }
}

#[async_trait]
impl ChannelSource for FirehoseSource {
    fn name(&self) -> &str {
        "firehose"
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Occurrence>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let feed = match self.feed.as_mut() {
                Some(feed) => feed,
                None => match self.connector.tap_commands().await {
                    Ok(feed) => {
                        info!(store = %self.connector.describe(), "command feed attached");
                        self.feed.insert(feed)
                    }
                    Err(e) => {
                        if !self.recover(e, cancel).await? {
                            return Ok(None);
                        }
                        continue;
                    }
                },
            };

            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                item = feed.next() => item,
            };

            match item {
                Some(Ok(observed)) => {
                    self.backoff.reset();
                    if self.keep(&observed) {
                        return Ok(Some(Occurrence::command(observed.command)));
                    }
                    debug!(command = %observed.command.name, "command filtered out");
                }
                Some(Err(e)) => {
                    if !self.recover(e, cancel).await? {
                        return Ok(None);
                    }
                }
                None => {
                    warn!("command feed closed");
                    let cause = Error::Connection("command feed closed".to_string());
                    if !self.recover(cause, cancel).await? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommandInvocation, Payload};
    use crate::source::StreamTailConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_filter_is_ordered_and_case_insensitive() {
        let filter = CommandFilter::new(["SET", "hset", "set", " "]);
        assert_eq!(filter.names(), &["set".to_string(), "hset".to_string()]);
        assert!(filter.allows("HSET"));
        assert!(!filter.allows("get"));
        assert!(CommandFilter::default().allows("XADD"));
        assert!(!CommandFilter::default().allows("flushall"));
    }

    #[tokio::test]
    async fn test_captures_allowed_commands_only() {
        let store = MemoryStore::new();
        let mut source = FirehoseSource::new(
            Arc::new(store.clone()),
            CommandFilter::default(),
            BackoffConfig::default(),
        )
        .ignore_key("XRECORD:ACTIVE");
        let cancel = CancellationToken::new();

        // Attach the feed before issuing commands.
        let pending = tokio::time::timeout(Duration::from_millis(20), source.next(&cancel)).await;
        assert!(pending.is_err());

        let mut conn = store.connect().await.unwrap();
        conn.invoke(&CommandInvocation::new("GET").arg("k")).await.unwrap();
        conn.invoke(&CommandInvocation::new("XADD").arg("XRECORD:ACTIVE").arg("*").arg("d").arg("x"))
            .await
            .unwrap();
        conn.invoke(&CommandInvocation::new("SET").arg("k").arg("v")).await.unwrap();

        let occurrence = source.next(&cancel).await.unwrap().unwrap();
        assert_eq!(occurrence.channel, "@cmd:set");
        assert_eq!(
            occurrence.payload,
            Payload::Command(CommandInvocation::new("SET").arg("k").arg("v"))
        );

        cancel.cancel();
        assert!(source.next(&cancel).await.unwrap().is_none());
    }

    fn observed(db: u32, command: CommandInvocation) -> ObservedCommand {
        ObservedCommand {
            db: Some(db),
            client: None,
            command,
        }
    }

    #[test]
    fn test_tailed_stream_appends_are_skipped() {
        let tail = StreamTailConfig {
            streams: vec!["orders".to_string(), "audit:*".to_string()],
            ignore: vec!["audit:debug".to_string()],
            count: 1,
            block: Duration::from_millis(1),
            refresh: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
            reconnect: BackoffConfig::default(),
        };
        let source = FirehoseSource::new(
            Arc::new(MemoryStore::new()),
            CommandFilter::default(),
            BackoffConfig::default(),
        )
        .skip_tailed(TailedKeys::new(&tail).unwrap());

        let xadd = |key: &str| observed(0, CommandInvocation::new("XADD").arg(key.to_string()).arg("*").arg("f").arg("v"));
        assert!(!source.keep(&xadd("orders")));
        assert!(!source.keep(&xadd("audit:login")));
        assert!(source.keep(&xadd("audit:debug")));
        assert!(source.keep(&xadd("payments")));
        // Other stream commands are not seen by the tail.
        assert!(source.keep(&observed(0, CommandInvocation::new("XDEL").arg("orders").arg("1-0"))));
    }

    #[test]
    fn test_other_databases_are_skipped() {
        let source = FirehoseSource::new(
            Arc::new(MemoryStore::new()),
            CommandFilter::default(),
            BackoffConfig::default(),
        )
        .with_db(2);
        let set = CommandInvocation::new("SET").arg("k").arg("v");
        assert!(source.keep(&observed(2, set.clone())));
        assert!(!source.keep(&observed(0, set)));
    }

    #[tokio::test]
    async fn test_unreachable_store_exhausts_budget() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let mut source = FirehoseSource::new(
            Arc::new(store),
            CommandFilter::default(),
            BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(2),
                multiplier: 2.0,
                max_attempts: Some(3),
            },
        );
        let err = source.next(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::SourceDisconnected { .. }));
    }
}
