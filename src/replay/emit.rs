use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{IdPolicy, ReplayOptions};
use crate::backoff::{Backoff, BackoffConfig};
use crate::event::{CommandInvocation, Payload};
use crate::store::{Connector, RespValue, StoreConnection};
use crate::{Error, Result};

/// The command that re-applies a recorded payload.
pub fn to_command(payload: &Payload, policy: IdPolicy) -> CommandInvocation {
    match payload {
        Payload::StreamEntry(entry) => {
            let id = match policy {
                IdPolicy::Fresh => "*".to_string(),
                IdPolicy::Preserve => entry.id.clone(),
            };
            let mut command = CommandInvocation::new("XADD").arg(entry.stream.clone()).arg(id);
            for (field, value) in &entry.fields {
                command = command.arg(field.clone()).arg(value.clone());
            }
            command
        }
        Payload::Command(command) => command.clone(),
    }
}

/// Issues payloads against the replay target, reconnecting after any
/// failure that leaves the connection in an unknown state.
pub struct Emitter {
    connector: Arc<dyn Connector>,
    conn: Option<Box<dyn StoreConnection>>,
    policy: IdPolicy,
    retry: BackoffConfig,
}

impl Emitter {
    /// Connects and pings the target.
    pub async fn connect(connector: Arc<dyn Connector>, options: &ReplayOptions) -> Result<Self> {
        let unreachable = |e: Error| Error::TargetUnreachable {
            message: format!("{}: {}", connector.describe(), e),
        };
        let mut conn = connector.connect().await.map_err(unreachable)?;
        conn.ping().await.map_err(unreachable)?;

        Ok(Self {
            connector: connector.clone(),
            conn: Some(conn),
            policy: options.id_policy,
            retry: options.retry,
        })
    }

    /// Emits one payload.
    ///
    /// Only failures before the request reached the target are retried.
    /// Server rejections and requests with an unknown outcome are returned
    /// without retrying. Returns `Ok(None)` when `cancel` fires while
    /// waiting to retry.
    pub async fn emit(
        &mut self,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<Option<RespValue>> {
        let command = to_command(payload, self.policy);
        let mut backoff = Backoff::new(self.retry);

        loop {
            let failure = match self.try_emit(&command).await {
                Ok(RespValue::Error(message)) => return Err(Error::Server(message)),
                Ok(reply) => {
                    debug!(%command, "emitted");
                    return Ok(Some(reply));
                }
                Err(e) => e,
            };
            // The connection may hold a partial reply.
            self.conn = None;
            if !failure.is_transient() || failure.is_unconfirmed() {
                return Err(failure);
            }
            let Some(delay) = backoff.next_delay() else {
                return Err(failure);
            };
            warn!(
                command = %command.name,
                error = %failure,
                attempt = backoff.attempt(),
                "emit failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(command = %command.name, "stopped while waiting to retry");
                    return Ok(None);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_emit(&mut self, command: &CommandInvocation) -> Result<RespValue> {
        if self.conn.is_none() {
            self.conn = Some(self.connector.connect().await?);
        }
        match self.conn.as_mut() {
            Some(conn) => conn.invoke(command).await,
            None => Err(Error::Connection("no target connection".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEntry;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn entry() -> Payload {
        Payload::StreamEntry(StreamEntry {
            stream: "orders".to_string(),
            id: "1700000000000-0".to_string(),
            fields: vec![(Bytes::from_static(b"id"), Bytes::from_static(b"1"))],
        })
    }

    fn options(policy: IdPolicy) -> ReplayOptions {
        ReplayOptions {
            id_policy: policy,
            retry: BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(2),
                multiplier: 2.0,
                max_attempts: Some(3),
            },
            ..ReplayOptions::default()
        }
    }

    #[test]
    fn test_stream_entry_command() {
        assert_eq!(
            to_command(&entry(), IdPolicy::Fresh).to_string(),
            "XADD orders * id 1"
        );
        assert_eq!(
            to_command(&entry(), IdPolicy::Preserve).to_string(),
            "XADD orders 1700000000000-0 id 1"
        );
        let set = CommandInvocation::new("set").arg("k").arg("v");
        assert_eq!(to_command(&Payload::Command(set.clone()), IdPolicy::Fresh), set);
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let err = Emitter::connect(Arc::new(store), &options(IdPolicy::Fresh))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::TargetUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryStore::new();
        let mut emitter = Emitter::connect(Arc::new(store.clone()), &options(IdPolicy::Fresh))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        store.fail_next_invokes(2);
        emitter.emit(&entry(), &cancel).await.unwrap().unwrap();
        assert_eq!(store.entries("orders").len(), 1);

        store.fail_next_invokes(5);
        assert!(emitter.emit(&entry(), &cancel).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_lost_reply_is_not_repeated() {
        let store = MemoryStore::new();
        let mut emitter = Emitter::connect(Arc::new(store.clone()), &options(IdPolicy::Fresh))
            .await
            .unwrap();

        store.lose_next_replies(1);
        let err = emitter.emit(&entry(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ReplyLost { .. }), "{:?}", err);
        assert_eq!(store.entries("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_garbled_reply_drops_the_connection() {
        let store = MemoryStore::new();
        let mut emitter = Emitter::connect(Arc::new(store.clone()), &options(IdPolicy::Fresh))
            .await
            .unwrap();
        assert_eq!(store.connections(), 1);
        let cancel = CancellationToken::new();

        store.garble_next_replies(1);
        let err = emitter.emit(&entry(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{:?}", err);
        assert_eq!(store.entries("orders").len(), 1);

        emitter.emit(&entry(), &cancel).await.unwrap().unwrap();
        assert_eq!(store.connections(), 2);
        assert_eq!(store.entries("orders").len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_wait() {
        let store = MemoryStore::new();
        let mut options = options(IdPolicy::Fresh);
        options.retry = BackoffConfig {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(3),
        };
        let mut emitter = Emitter::connect(Arc::new(store.clone()), &options).await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        store.fail_next_invokes(1);
        let outcome = tokio::time::timeout(Duration::from_secs(2), emitter.emit(&entry(), &cancel))
            .await
            .expect("retry wait ignored the stop");
        assert!(outcome.unwrap().is_none());
        assert!(store.entries("orders").is_empty());
    }

    #[tokio::test]
    async fn test_preserved_stale_id_is_rejected_once() {
        let store = MemoryStore::new();
        store.xadd("orders", "1700000000001-0", &[("id", "0")]).unwrap();
        let mut emitter = Emitter::connect(Arc::new(store.clone()), &options(IdPolicy::Preserve))
            .await
            .unwrap();

        let before = store.commands().len();
        let err = emitter.emit(&entry(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Server(_)));
        assert_eq!(store.commands().len(), before + 1);
    }
}
