//! Error types and result handling for redis-record.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use redis_record::{Error, Result};
//!
//! fn open_recording() -> Result<()> {
//!     Err(Error::NotFound { name: "orders".to_string() })
//! }
//!
//! match open_recording() {
//!     Ok(()) => println!("Opened"),
//!     Err(Error::NotFound { name }) => eprintln!("No recording named {}", name),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for redis-record operations.
///
/// Variants fall into three groups: ambient failures (configuration, I/O,
/// wire protocol), capture-side failures raised by sources and the log
/// container, and replay-side failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error from recording files or lock files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error for recording metadata.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store connection was lost or could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed reply on the store wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The store answered with an error reply.
    #[error("Server error: {0}")]
    Server(String),

    /// A payload could not be decoded under its schema.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of what was invalid
        message: String,
    },

    /// A source lost its store connection. Sources retry these themselves.
    #[error("Source disconnected: {message}")]
    SourceDisconnected {
        /// Description of the disconnect
        message: String,
    },

    /// A source received a feed it cannot interpret. Fatal to that source.
    #[error("Source protocol error: {message}")]
    SourceProtocol {
        /// Description of the malformed input
        message: String,
    },

    /// An event does not match the schema registered for its channel.
    #[error("Schema mismatch on channel '{channel}': {message}")]
    SchemaMismatch {
        /// Channel the event was appended to
        channel: String,
        /// Description of the mismatch
        message: String,
    },

    /// A channel was re-declared with a different schema.
    #[error("Channel '{channel}' already declared as {existing}, cannot redeclare as {requested}")]
    ChannelConflict {
        /// Channel name
        channel: String,
        /// Schema already registered
        existing: String,
        /// Schema in the rejected declaration
        requested: String,
    },

    /// Another writer holds the recording open.
    #[error("Recording '{name}' is already open for writing")]
    AlreadyOpen {
        /// Recording name
        name: String,
    },

    /// Another replay session is active for the recording.
    #[error("Replay of '{name}' is already in progress")]
    ReplayInProgress {
        /// Recording name
        name: String,
    },

    /// The replay target could not be reached before any event was emitted.
    #[error("Replay target unreachable: {message}")]
    TargetUnreachable {
        /// Description of the connection failure
        message: String,
    },

    /// No recording exists under the name.
    #[error("Recording '{name}' not found")]
    NotFound {
        /// Recording name
        name: String,
    },

    /// The recording has no valid trailer or contains a damaged record.
    ///
    /// `valid_events` events precede the damage and can still be read with
    /// [`LogContainer::open_recovering`](crate::container::LogContainer::open_recovering).
    #[error("Recording '{name}' is corrupt after {valid_events} events: {reason}")]
    Corrupt {
        /// Recording name
        name: String,
        /// Number of events readable before the damage
        valid_events: u64,
        /// What was wrong
        reason: String,
    },

    /// Recording names must be usable as a single file name.
    #[error("Invalid recording name: {0:?}")]
    InvalidName(String),

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the state conflict
        message: String,
    },

    /// A frame would exceed what readers accept; nothing was written.
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// A request was written but no reply arrived; the store may or may not
    /// have applied it.
    #[error("No reply to {command}: {source}")]
    ReplyLost {
        /// Name of the command sent
        command: String,
        /// Why the reply was not received
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether retrying the same operation after a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ReplyLost { source, .. } => source.is_transient(),
            other => matches!(
                other,
                Error::Connection(_)
                    | Error::Io(_)
                    | Error::Timeout { .. }
                    | Error::SourceDisconnected { .. }
            ),
        }
    }

    /// Whether the request reached the store without a confirmed outcome.
    /// Repeating it could apply it twice.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, Error::ReplyLost { .. } | Error::Protocol(_))
    }

    /// Whether the error is a rejection of a conflicting concurrent operation.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadyOpen { .. } | Error::ReplayInProgress { .. }
        )
    }
}

/// A convenient Result type alias for redis-record operations.
///
/// This is equivalent to `std::result::Result<T, redis_record::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Connection("reset".to_string()).is_transient());
        assert!(Error::SourceDisconnected {
            message: "eof".to_string()
        }
        .is_transient());
        assert!(!Error::Server("ERR wrong type".to_string()).is_transient());
        assert!(!Error::SourceProtocol {
            message: "bad".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_lost_reply_is_transient_but_unconfirmed() {
        let lost = Error::ReplyLost {
            command: "XADD".to_string(),
            source: Box::new(Error::Timeout {
                message: "no reply within 30s".to_string(),
            }),
        };
        assert!(lost.is_transient());
        assert!(lost.is_unconfirmed());
        assert_eq!(
            lost.to_string(),
            "No reply to XADD: Timeout error: no reply within 30s"
        );
        assert!(!Error::Connection("refused".to_string()).is_unconfirmed());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(Error::AlreadyOpen {
            name: "a".to_string()
        }
        .is_conflict());
        assert!(Error::ReplayInProgress {
            name: "a".to_string()
        }
        .is_conflict());
        assert!(!Error::NotFound {
            name: "a".to_string()
        }
        .is_conflict());
    }
}
