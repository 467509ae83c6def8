//! Live V4L2 camera source (MJPEG capture)

use std::time::Instant;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::frame::decode_mjpeg;
use crate::source::FrameSource;
use crate::{CameraConfig, SourceError, VideoFrame};

/// Live camera. Conceptually infinite; ends only on device failure.
pub struct CameraSource {
    index: u32,
    stream: Option<Stream<'static>>,
    opened_at: Instant,
    sequence: u32,
}

impl CameraSource {
    /// Open `/dev/video{index}` and start streaming
    pub fn open(index: u32, config: &CameraConfig) -> Result<Self, SourceError> {
        let device = Device::new(index as usize)
            .map_err(|e| SourceError::Unavailable(format!("camera {}: {}", index, e)))?;

        let mut format = device
            .format()
            .map_err(|e| SourceError::Unavailable(format!("camera {}: {}", index, e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = FourCC::new(b"MJPG");
        let format = device
            .set_format(&format)
            .map_err(|e| SourceError::Unavailable(format!("camera {}: {}", index, e)))?;

        if format.fourcc != FourCC::new(b"MJPG") {
            return Err(SourceError::Unavailable(format!(
                "camera {} does not support MJPEG capture (got {})",
                index, format.fourcc
            )));
        }

        let stream = Stream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(|e| SourceError::Unavailable(format!("camera {}: {}", index, e)))?;

        info!(
            "Camera {} streaming {}x{} MJPEG",
            index, format.width, format.height
        );

        Ok(Self {
            index,
            stream: Some(stream),
            opened_at: Instant::now(),
            sequence: 0,
        })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let buffer = match stream.next() {
            Ok((buffer, _meta)) => buffer.to_vec(),
            Err(e) => {
                warn!("Camera {} read failed: {}", self.index, e);
                self.stream = None;
                return Err(SourceError::Device(e.to_string()));
            }
        };

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let timestamp_ns = self.opened_at.elapsed().as_nanos() as u64;

        decode_mjpeg(&buffer, timestamp_ns, sequence)
            .map(Some)
            .map_err(|e| SourceError::Decode {
                sequence,
                reason: e.to_string(),
            })
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("Camera {} released", self.index);
        }
    }

    fn is_live(&self) -> bool {
        true
    }
}
