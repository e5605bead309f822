// THEORY:
// One error type for the whole engine. Most variants describe failures that are local to a
// single frame or a single camera; the pipeline absorbs those, counts them, and keeps going.
// Only `Config` is fatal, and only at startup.

use thiserror::Error;

use crate::core_modules::observation::{CameraId, Millis};

pub type Result<T> = std::result::Result<T, VisionError>;

#[derive(Debug, Error)]
pub enum VisionError {
    /// A perception record had missing geometry or an out-of-range confidence.
    /// The whole frame is dropped and counted.
    #[error("malformed detection from camera '{camera}': {reason}")]
    MalformedDetection { camera: CameraId, reason: String },

    /// The optimal assignment solver could not produce an answer inside the frame budget.
    /// The tracker degrades to greedy matching for that frame.
    #[error("assignment of {size}x{size} exceeded the frame budget: {reason}")]
    AssignmentTimeout { size: usize, reason: String },

    /// An event arrived behind the sequencer's release horizon and is emitted as `late`.
    #[error("event at {timestamp_ms}ms from camera '{camera}' arrived behind the horizon ({horizon_ms}ms)")]
    ClockSkew {
        camera: CameraId,
        timestamp_ms: Millis,
        horizon_ms: Millis,
    },

    /// A camera pipeline has stopped producing frames.
    #[error("camera '{camera}' produced no frames for {silent_ms}ms")]
    TrackletStarvation { camera: CameraId, silent_ms: u64 },

    /// An event targeted a KPI window that is already finalized.
    #[error("window {window} is closed; event redirected to window {redirected_to}")]
    WindowClosed { window: u64, redirected_to: u64 },

    #[error("unknown camera '{0}'")]
    UnknownCamera(CameraId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VisionError {
    /// Failures that the pipeline counts and absorbs rather than propagating.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VisionError::Config(_) | VisionError::Io(_))
    }
}
