//! Replay of recordings against a target store.
//!
//! Events are re-issued in global timestamp order with the recorded gaps
//! scaled by `speed_factor`. A session can be paused, resumed, and stopped
//! while it runs; the returned [`ReplayReport`] lists every event that could
//! not be applied.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use redis_record::config::StoreConfig;
//! use redis_record::container::{LogContainer, WriterOptions};
//! use redis_record::replay::{ReplayOptions, Replayer};
//! use redis_record::store::RedisConnector;
//!
//! # async fn example() -> redis_record::Result<()> {
//! let container = Arc::new(LogContainer::new("./recordings", WriterOptions::default()));
//! let target = Arc::new(RedisConnector::new(StoreConfig::default()));
//!
//! let report = Replayer::new(container)
//!     .run("session-1", target, ReplayOptions::default())
//!     .await?;
//! println!("emitted {} of {}", report.emitted, report.total);
//! # Ok(())
//! # }
//! ```

pub mod emit;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::{Error, Result};

pub use emit::{to_command, Emitter};
pub use scheduler::{ReplaySession, Replayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Honour the recorded gaps, scaled by the speed factor.
    #[default]
    Timed,
    /// Emit back to back.
    Fast,
}

/// How recorded stream entry ids are treated on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    /// Let the target assign new ids (`XADD key * ...`).
    #[default]
    Fresh,
    /// Re-use the recorded ids. Entries the target already holds an equal
    /// or newer id for are rejected and reported as failures.
    Preserve,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOptions {
    pub speed_factor: f64,
    pub mode: ReplayMode,
    pub id_policy: IdPolicy,
    /// Retry budget for transient emit failures.
    pub retry: BackoffConfig,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed_factor: 1.0,
            mode: ReplayMode::Timed,
            id_policy: IdPolicy::Fresh,
            retry: BackoffConfig {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(2),
                multiplier: 2.0,
                max_attempts: Some(5),
            },
        }
    }
}

impl ReplayOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.speed_factor.is_finite() || self.speed_factor <= 0.0 {
            return Err(Error::Config(format!(
                "speed factor must be a positive number, got {}",
                self.speed_factor
            )));
        }
        Ok(())
    }

    /// Wall-clock wait for a recorded gap.
    pub fn scaled(&self, gap_ns: u64) -> Duration {
        match self.mode {
            ReplayMode::Fast => Duration::ZERO,
            ReplayMode::Timed => Duration::from_secs_f64(gap_ns as f64 / 1e9 / self.speed_factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl ReplayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplayState::Stopped | ReplayState::Failed)
    }
}

/// An event the target did not accept.
#[derive(Debug, Clone, Serialize)]
pub struct FailedEvent {
    /// Position in replay order.
    pub index: u64,
    pub channel: String,
    pub timestamp_ns: u64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub name: String,
    /// Events scheduled for replay.
    pub total: u64,
    pub emitted: u64,
    pub failures: Vec<FailedEvent>,
    /// The recording was cut short and only its valid prefix was replayed.
    pub truncated: bool,
    pub state: ReplayState,
    pub elapsed: Duration,
}
