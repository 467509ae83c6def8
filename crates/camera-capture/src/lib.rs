//! Camera Capture Library for Driver Monitoring
//!
//! Provides the frame sources the monitoring pipeline polls:
//! - Image sequences on disk (finite, file-backed playback)
//! - In-memory frame lists (dry runs and tests)
//! - V4L2 cameras (live, feature `v4l2`)

pub mod frame;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::VideoFrame;
pub use source::{FrameSource, ImageSequenceSource, MemorySource};
#[cfg(feature = "v4l2")]
pub use v4l2::CameraSource;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Frame source error types
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source could not be opened (missing file, busy camera)
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode frame {sequence}: {reason}")]
    Decode { sequence: u32, reason: String },

    #[error("Device error: {0}")]
    Device(String),
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSelector {
    /// Finite source: a directory of frames or a single image
    File(PathBuf),
    /// Live camera by device index (`/dev/video{N}`)
    Device(u32),
}

impl std::fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSelector::File(path) => write!(f, "file:{}", path.display()),
            SourceSelector::Device(index) => write!(f, "device:{}", index),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Nominal frame rate, used for playback pacing of finite sources
    pub fps: u32,
    /// Number of driver buffers for live capture
    pub buffer_count: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
        }
    }
}

/// Open the source described by `selector`.
///
/// Fails with [`SourceError::Unavailable`] here, never on the first
/// `next_frame`, when the file or device cannot be opened.
pub fn open_source(
    selector: &SourceSelector,
    config: &CameraConfig,
) -> Result<Box<dyn FrameSource>, SourceError> {
    info!("Opening frame source {}", selector);
    match selector {
        SourceSelector::File(path) => Ok(Box::new(ImageSequenceSource::open(path, config.fps)?)),
        #[cfg(feature = "v4l2")]
        SourceSelector::Device(index) => Ok(Box::new(CameraSource::open(*index, config)?)),
        #[cfg(not(feature = "v4l2"))]
        SourceSelector::Device(index) => Err(SourceError::Unavailable(format!(
            "device {} requested but camera support was not compiled in (enable feature `v4l2`)",
            index
        ))),
    }
}
