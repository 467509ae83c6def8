//! Frame sources

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use tracing::{debug, info, warn};

use crate::{SourceError, VideoFrame};

/// File extensions accepted for image-sequence playback
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// A sequence of video frames, polled one frame at a time.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` once the stream has ended.
    ///
    /// Finite sources end when exhausted; live sources end only on device
    /// failure or after [`FrameSource::release`].
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError>;

    /// Release the underlying handle. Further calls to `next_frame` return
    /// `Ok(None)`.
    fn release(&mut self);

    /// Whether this is a live device rather than a finite recording
    fn is_live(&self) -> bool;

    /// Playback pacing for finite sources; live sources pace themselves
    fn frame_interval(&self) -> Option<Duration> {
        None
    }
}

/// Finite, file-backed source over a directory of still frames
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    /// Frame 0, decoded at open
    first: Option<RgbImage>,
    position: usize,
    fps: u32,
    released: bool,
}

impl ImageSequenceSource {
    /// Open a directory of frames (sorted by file name) or a single image.
    ///
    /// The first frame is decoded here; a path without a decodable image is
    /// [`SourceError::Unavailable`].
    pub fn open(path: impl AsRef<Path>, fps: u32) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let paths = if path.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|e| {
                SourceError::Unavailable(format!("{}: {}", path.display(), e))
            })?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_frame_extension(p))
                .collect();
            paths.sort();
            paths
        } else if path.is_file() {
            ImageFormat::from_path(path).map_err(|e| {
                SourceError::Unavailable(format!("{}: not a still image ({})", path.display(), e))
            })?;
            vec![path.to_path_buf()]
        } else {
            return Err(SourceError::Unavailable(format!(
                "{}: no such file or directory",
                path.display()
            )));
        };

        let Some(first_path) = paths.first() else {
            return Err(SourceError::Unavailable(format!(
                "{}: no frames found",
                path.display()
            )));
        };
        let first = decode(first_path, 0)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", first_path.display(), e)))?;

        info!(
            "Opened image sequence {} ({} frames @ {} fps)",
            path.display(),
            paths.len(),
            fps
        );

        Ok(Self {
            paths,
            first: Some(first),
            position: 0,
            fps: fps.max(1),
            released: false,
        })
    }

    /// Total number of frames in the sequence
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the sequence holds no frames
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn decode(path: &Path, sequence: u32) -> Result<RgbImage, SourceError> {
    image::open(path).map(|image| image.to_rgb8()).map_err(|e| {
        warn!("Failed to decode {}: {}", path.display(), e);
        SourceError::Decode {
            sequence,
            reason: e.to_string(),
        }
    })
}

fn has_frame_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        if self.released {
            return Ok(None);
        }
        let Some(path) = self.paths.get(self.position) else {
            debug!("Image sequence exhausted after {} frames", self.position);
            return Ok(None);
        };

        let sequence = self.position as u32;
        self.position += 1;

        let image = match self.first.take() {
            Some(image) if sequence == 0 => image,
            _ => decode(path, sequence)?,
        };

        let timestamp_ns = sequence as u64 * 1_000_000_000 / self.fps as u64;
        Ok(Some(VideoFrame::from_image(image, timestamp_ns, sequence)))
    }

    fn release(&mut self) {
        if !self.released {
            debug!("Releasing image sequence at frame {}", self.position);
        }
        self.released = true;
        self.first = None;
    }

    fn is_live(&self) -> bool {
        false
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1) / self.fps)
    }
}

/// Finite source over frames already in memory
pub struct MemorySource {
    frames: VecDeque<VideoFrame>,
    released: bool,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = VideoFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            released: false,
        }
    }

    /// Frames not yet handed out
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        if self.released {
            return Ok(None);
        }
        Ok(self.frames.pop_front())
    }

    fn release(&mut self) {
        self.released = true;
        self.frames.clear();
    }

    fn is_live(&self) -> bool {
        false
    }
}
