pub mod backoff;
pub mod capture;
pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod replay;
pub mod source;
pub mod store;

pub use capture::{CaptureService, Capturer};
pub use config::Config;
pub use container::LogContainer;
pub use error::{Error, Result};
pub use replay::{ReplayOptions, Replayer};
