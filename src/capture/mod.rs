//! Capture: fan-in of channel sources into a recording.

pub mod capturer;
pub mod control;

pub use capturer::{CaptureOptions, CaptureState, CaptureStats, CaptureStatus, CaptureSummary, Capturer};
pub use control::{
    build_sources, request_start, request_stop, CaptureService, ControlCommand, ControlListener,
};
