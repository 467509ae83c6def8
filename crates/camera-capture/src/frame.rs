//! Video frame types and processing

use image::imageops::{self, FilterType};
use image::{GenericImageView, ImageBuffer, Rgb, RgbImage};

/// Decoded RGB video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// RGB pixel data (width * height * 3)
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture timestamp since the source was opened (nanoseconds)
    pub timestamp_ns: u64,
    /// Frame sequence number
    pub sequence: u32,
}

impl VideoFrame {
    /// Samples per pixel; frames are always RGB8
    pub const CHANNELS: u32 = 3;

    /// Create a new video frame from raw RGB data
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ns: u64, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ns,
            sequence,
        }
    }

    /// Create a frame filled with one color
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], timestamp_ns: u64, sequence: u32) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(buffer_len(width, height))
            .collect();
        Self::new(data, width, height, timestamp_ns, sequence)
    }

    /// Wrap a decoded image
    pub fn from_image(image: RgbImage, timestamp_ns: u64, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, timestamp_ns, sequence)
    }

    /// Copy into an `image` buffer; `None` if the data length is inconsistent
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// Samples per pixel
    pub fn channels(&self) -> u32 {
        Self::CHANNELS
    }

    /// Get pixel at (x, y)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.data
            .get(idx..idx + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Bilinear resize (display path)
    pub fn resize(&self, new_width: u32, new_height: u32) -> VideoFrame {
        if (new_width, new_height) == (self.width, self.height) {
            return self.clone();
        }
        let data = match self.view() {
            Some(view) if new_width > 0 && new_height > 0 => {
                imageops::resize(&view, new_width, new_height, FilterType::Triangle).into_raw()
            }
            _ => vec![0; buffer_len(new_width, new_height)],
        };
        self.with_pixels(data, new_width, new_height)
    }

    /// Copy of the `width` x `height` region at (`x`, `y`), clipped to the frame
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> VideoFrame {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        let data = match self.view() {
            Some(view) => {
                let sub = imageops::crop_imm(&view, x, y, width, height);
                RgbImage::from_fn(width, height, |px, py| sub.get_pixel(px, py)).into_raw()
            }
            None => vec![0; buffer_len(width, height)],
        };
        self.with_pixels(data, width, height)
    }

    /// Borrowed `image` view; `None` if the data length is inconsistent
    fn view(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
    }

    fn with_pixels(&self, data: Vec<u8>, width: u32, height: u32) -> VideoFrame {
        Self::new(data, width, height, self.timestamp_ns, self.sequence)
    }
}

fn buffer_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * VideoFrame::CHANNELS as usize
}

/// Decode an MJPEG buffer to an RGB frame
#[cfg(feature = "v4l2")]
pub fn decode_mjpeg(
    mjpeg_data: &[u8],
    timestamp_ns: u64,
    sequence: u32,
) -> Result<VideoFrame, image::ImageError> {
    use image::ImageFormat;

    let img = image::load_from_memory_with_format(mjpeg_data, ImageFormat::Jpeg)?;
    Ok(VideoFrame::from_image(img.to_rgb8(), timestamp_ns, sequence))
}
