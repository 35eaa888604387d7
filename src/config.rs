use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::capture::CaptureOptions;
use crate::container::WriterOptions;
use crate::replay::{IdPolicy, ReplayMode, ReplayOptions};
use crate::source::firehose::DEFAULT_COMMANDS;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Longest wait for a reply beyond a read's own block time.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    /// Stream key carrying start/stop requests for `serve`.
    #[serde(default = "default_record_key")]
    pub record_key: String,
    /// Stream names or glob patterns to tail. Empty disables stream tailing.
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
    #[serde(default)]
    pub ignore_streams: Vec<String>,
    /// Also tap every executed command through the firehose.
    #[serde(default)]
    pub firehose: bool,
    /// Command allow-list for the firehose.
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
    #[serde(default = "default_stream_refresh_ms")]
    pub stream_refresh_ms: u64,
    #[serde(default = "default_data_block_ms")]
    pub data_block_ms: u64,
    #[serde(default = "default_wait_block_ms")]
    pub wait_block_ms: u64,
    #[serde(default = "default_no_streams_sleep_ms")]
    pub no_streams_sleep_ms: u64,
    #[serde(default = "default_read_count")]
    pub read_count: usize,
    #[serde(default = "default_source_buffer")]
    pub source_buffer: usize,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    #[serde(default)]
    pub sync_on_flush: bool,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// How long a stop waits for tailed streams to drain up to the stop
    /// request before cutting them off.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Emit back to back, ignoring recorded gaps.
    #[serde(default)]
    pub fast: bool,
    /// Re-use recorded stream entry ids instead of letting the target assign them.
    #[serde(default)]
    pub preserve_ids: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        Self::build(Some(path.as_ref()), true)
    }

    /// Loads an optional config file layered under `REDIS_RECORD_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::build(path, false)
    }

    fn build(path: Option<&Path>, required: bool) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(required));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("REDIS_RECORD")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("recording.streams")
                    .with_list_parse_key("recording.ignore_streams")
                    .with_list_parse_key("recording.commands")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            recording: RecordingConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            username: None,
            password: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RecordingConfig {
    pub fn capture_options(&self, source_label: String) -> CaptureOptions {
        CaptureOptions {
            source_buffer: self.source_buffer,
            source_label,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            flush_every: self.flush_every.max(1),
            sync_on_flush: self.sync_on_flush,
            ..WriterOptions::default()
        }
    }

    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            record_key: default_record_key(),
            streams: default_streams(),
            ignore_streams: Vec::new(),
            firehose: false,
            commands: default_commands(),
            stream_refresh_ms: default_stream_refresh_ms(),
            data_block_ms: default_data_block_ms(),
            wait_block_ms: default_wait_block_ms(),
            no_streams_sleep_ms: default_no_streams_sleep_ms(),
            read_count: default_read_count(),
            source_buffer: default_source_buffer(),
            flush_every: default_flush_every(),
            sync_on_flush: false,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ReplayConfig {
    pub fn options(&self) -> ReplayOptions {
        ReplayOptions {
            speed_factor: self.speed,
            mode: if self.fast {
                ReplayMode::Fast
            } else {
                ReplayMode::Timed
            },
            id_policy: if self.preserve_ids {
                IdPolicy::Preserve
            } else {
                IdPolicy::Fresh
            },
            retry: BackoffConfig {
                initial: Duration::from_millis(self.retry_initial_ms),
                max: Duration::from_millis(self.retry_max_ms),
                multiplier: 2.0,
                max_attempts: Some(self.max_attempts.max(1)),
            },
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            fast: false,
            preserve_ids: false,
            max_attempts: default_max_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./recordings")
}

fn default_record_key() -> String {
    "XRECORD:ACTIVE".to_string()
}

fn default_streams() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_commands() -> Vec<String> {
    DEFAULT_COMMANDS.iter().map(|c| c.to_string()).collect()
}

fn default_stream_refresh_ms() -> u64 {
    3000
}

fn default_data_block_ms() -> u64 {
    1000
}

fn default_wait_block_ms() -> u64 {
    3000
}

fn default_no_streams_sleep_ms() -> u64 {
    1000
}

fn default_read_count() -> usize {
    1000
}

fn default_source_buffer() -> usize {
    1024
}

fn default_flush_every() -> usize {
    1
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_speed() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    50
}

fn default_retry_max_ms() -> u64 {
    2000
}
