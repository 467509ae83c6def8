//! Model input tensors and frame preprocessing

use camera_capture::VideoFrame;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

use crate::InferenceError;

/// Memory layout of a single-image batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, C]` (Keras / TFLite exports)
    #[default]
    Nhwc,
    /// `[1, C, H, W]` (PyTorch exports)
    Nchw,
}

/// Input shape a model expects, batch size one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub height: u32,
    pub width: u32,
    /// 3 for color, 1 for grayscale
    pub channels: u32,
    #[serde(default)]
    pub layout: TensorLayout,
}

impl TensorShape {
    pub fn new(height: u32, width: u32, channels: u32, layout: TensorLayout) -> Self {
        Self {
            height,
            width,
            channels,
            layout,
        }
    }

    /// Four-dimensional shape including the batch axis
    pub fn dims(&self) -> [usize; 4] {
        let (h, w, c) = (self.height as usize, self.width as usize, self.channels as usize);
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, c],
            TensorLayout::Nchw => [1, c, h, w],
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, y: usize, x: usize, c: usize) -> usize {
        let (h, w, ch) = (self.height as usize, self.width as usize, self.channels as usize);
        match self.layout {
            TensorLayout::Nhwc => (y * w + x) * ch + c,
            TensorLayout::Nchw => c * h * w + y * w + x,
        }
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}

/// Scaling applied to 8-bit samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// `v / 255`, range [0, 1]
    #[default]
    Unit,
    /// `v / 127.5 - 1`, range [-1, 1]
    Symmetric,
    /// Unscaled, range [0, 255]
    Raw,
}

impl Normalization {
    #[inline]
    pub fn apply(&self, value: u8) -> f32 {
        match self {
            Normalization::Unit => value as f32 / 255.0,
            Normalization::Symmetric => value as f32 / 127.5 - 1.0,
            Normalization::Raw => value as f32,
        }
    }
}

/// Channel order the model was trained with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    /// OpenCV capture order
    Bgr,
}

/// Resize algorithm; must match the one the model was calibrated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Bilinear,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Bilinear => FilterType::Triangle,
        }
    }
}

/// Fixed-shape `f32` model input
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor from raw values; the length must match the shape
    pub fn from_data(shape: TensorShape, data: Vec<f32>) -> Result<Self, InferenceError> {
        if data.len() != shape.len() {
            return Err(InferenceError::InvalidInputShape {
                expected: format!("{} ({} values)", shape, shape.len()),
                actual: format!("{} values", data.len()),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Value at row `y`, column `x`, channel `c`
    pub fn get(&self, y: usize, x: usize, c: usize) -> Option<f32> {
        if y >= self.shape.height as usize
            || x >= self.shape.width as usize
            || c >= self.shape.channels as usize
        {
            return None;
        }
        self.data.get(self.shape.index(y, x, c)).copied()
    }
}

/// Resizes and normalizes frames into model input tensors.
///
/// Stateless: one instance can serve any number of threads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Preprocessor {
    #[serde(default)]
    pub filter: ResizeFilter,
    #[serde(default)]
    pub channel_order: ChannelOrder,
}

impl Preprocessor {
    pub fn new(filter: ResizeFilter, channel_order: ChannelOrder) -> Self {
        Self {
            filter,
            channel_order,
        }
    }

    /// Resize `frame` to `shape` and scale its samples with `normalization`
    pub fn prepare(
        &self,
        frame: &VideoFrame,
        shape: &TensorShape,
        normalization: Normalization,
    ) -> Result<Tensor, InferenceError> {
        if shape.channels != 1 && shape.channels != 3 {
            return Err(InferenceError::Preprocess(format!(
                "unsupported channel count {}",
                shape.channels
            )));
        }
        if shape.width == 0 || shape.height == 0 {
            return Err(InferenceError::Preprocess(format!("empty target shape {}", shape)));
        }

        let image = frame.to_image().ok_or_else(|| {
            InferenceError::Preprocess(format!(
                "frame {} has {} bytes, expected {}x{}x3",
                frame.sequence,
                frame.data.len(),
                frame.width,
                frame.height
            ))
        })?;

        let resized = if image.dimensions() == (shape.width, shape.height) {
            image
        } else {
            imageops::resize(&image, shape.width, shape.height, self.filter.into())
        };

        let mut data = vec![0.0f32; shape.len()];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if shape.channels == 1 {
                let luma = (pixel[0] as f32 * 0.299
                    + pixel[1] as f32 * 0.587
                    + pixel[2] as f32 * 0.114)
                    .round()
                    .clamp(0.0, 255.0) as u8;
                data[shape.index(y, x, 0)] = normalization.apply(luma);
                continue;
            }
            for c in 0..3 {
                let source = match self.channel_order {
                    ChannelOrder::Rgb => c,
                    ChannelOrder::Bgr => 2 - c,
                };
                data[shape.index(y, x, c)] = normalization.apply(pixel[source]);
            }
        }

        Ok(Tensor {
            shape: *shape,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
    }

    #[test]
    fn test_solid_frame_unit_normalization() {
        let frame = VideoFrame::solid(32, 24, [51, 102, 255], 0, 0);
        let shape = TensorShape::new(8, 8, 3, TensorLayout::Nhwc);
        let tensor = Preprocessor::default()
            .prepare(&frame, &shape, Normalization::Unit)
            .unwrap();

        assert_eq!(tensor.data().len(), 8 * 8 * 3);
        for y in 0..8 {
            for x in 0..8 {
                assert_close(tensor.get(y, x, 0).unwrap(), 0.2);
                assert_close(tensor.get(y, x, 1).unwrap(), 0.4);
                assert_close(tensor.get(y, x, 2).unwrap(), 1.0);
            }
        }
    }

    #[test]
    fn test_bgr_order_and_nchw_layout() {
        let frame = VideoFrame::solid(4, 4, [255, 0, 0], 0, 0);
        let shape = TensorShape::new(2, 2, 3, TensorLayout::Nchw);
        let tensor = Preprocessor::new(ResizeFilter::Nearest, ChannelOrder::Bgr)
            .prepare(&frame, &shape, Normalization::Unit)
            .unwrap();

        // Red ends up in the last channel plane
        assert_eq!(&tensor.data()[0..4], &[0.0; 4]);
        assert_eq!(&tensor.data()[8..12], &[1.0; 4]);
    }

    #[test]
    fn test_symmetric_and_grayscale() {
        let frame = VideoFrame::solid(2, 2, [255, 255, 255], 0, 0);
        let shape = TensorShape::new(2, 2, 1, TensorLayout::Nhwc);
        let tensor = Preprocessor::default()
            .prepare(&frame, &shape, Normalization::Symmetric)
            .unwrap();
        assert!(tensor.data().iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert_close(Normalization::Symmetric.apply(0), -1.0);
        assert_close(Normalization::Raw.apply(17), 17.0);
    }

    #[test]
    fn test_inconsistent_frame_is_rejected() {
        let frame = VideoFrame::new(vec![0; 5], 2, 2, 0, 3);
        let shape = TensorShape::new(2, 2, 3, TensorLayout::Nhwc);
        let result = Preprocessor::default().prepare(&frame, &shape, Normalization::Unit);
        assert!(matches!(result, Err(InferenceError::Preprocess(_))));
    }

    #[test]
    fn test_from_data_checks_length() {
        let shape = TensorShape::new(2, 2, 3, TensorLayout::Nhwc);
        assert!(Tensor::from_data(shape, vec![0.0; 12]).is_ok());
        assert!(Tensor::from_data(shape, vec![0.0; 11]).is_err());
    }
}
