//! Channel sources: adapters that turn store activity into occurrences.
//!
//! Every adapter implements [`ChannelSource`]. The capturer runs each one as
//! its own task via [`spawn_source`], which pushes into a bounded queue so a
//! slow writer suspends the adapters instead of buffering without limit.

pub mod firehose;
pub mod stream_tail;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::event::Occurrence;
use crate::store::StreamId;
use crate::{Error, Result};

pub use firehose::{CommandFilter, FirehoseSource};
pub use stream_tail::{StreamTailConfig, StreamTailSource, TailedKeys};

/// Produces occurrences one at a time.
#[async_trait]
pub trait ChannelSource: Send {
    /// Name used in logs and capture statistics.
    fn name(&self) -> &str;

    /// Waits for the next occurrence.
    ///
    /// Returns `Ok(None)` once `cancel` fires or the source is exhausted.
    /// Recoverable disconnects are retried internally; an `Err` is fatal
    /// to this source.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Occurrence>>;

    /// Hands over the stop bound of the capture this source feeds.
    ///
    /// Returns true if the source ends by itself once it has delivered
    /// everything up to the bound. Sources that return false are cancelled
    /// as soon as a bounded stop begins.
    fn bind_stop(&mut self, _stop: StopBound) -> bool {
        false
    }
}

/// Id of the control entry that stopped a capture. Unset while recording.
pub type StopBound = watch::Receiver<Option<StreamId>>;

/// What a source task reports to the capturer.
#[derive(Debug)]
pub enum SourceMessage {
    Occurrence(Occurrence),
    /// The source finished; `error` is set when it failed.
    Ended {
        source: String,
        error: Option<Error>,
    },
}

/// Runs a source until it ends, forwarding into `tx`.
pub fn spawn_source(
    mut source: Box<dyn ChannelSource>,
    tx: mpsc::Sender<SourceMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = source.name().to_string();
        info!(source = %name, "source started");

        let error = loop {
            match source.next(&cancel).await {
                Ok(Some(occurrence)) => {
                    if tx.send(SourceMessage::Occurrence(occurrence)).await.is_err() {
                        debug!(source = %name, "capturer gone, stopping source");
                        return;
                    }
                }
                Ok(None) => break None,
                Err(e) => {
                    error!(source = %name, error = %e, "source failed");
                    break Some(e);
                }
            }
        };

        info!(source = %name, failed = error.is_some(), "source ended");
        let _ = tx
            .send(SourceMessage::Ended {
                source: name,
                error,
            })
            .await;
    })
}

/// Sleeps for the next reconnect delay after a transient failure.
///
/// Returns `Ok(false)` if cancelled while waiting and
/// `Err(SourceDisconnected)` once the retry budget is spent.
pub(crate) async fn wait_reconnect(
    backoff: &mut Backoff,
    source: &str,
    cause: &Error,
    cancel: &CancellationToken,
) -> Result<bool> {
    let Some(delay) = backoff.next_delay() else {
        return Err(Error::SourceDisconnected {
            message: format!("{}: {}", source, cause),
        });
    };
    warn!(
        source,
        error = %cause,
        attempt = backoff.attempt(),
        delay_ms = delay.as_millis() as u64,
        "source disconnected, reconnecting"
    );
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        _ = tokio::time::sleep(delay) => Ok(true),
    }
}
