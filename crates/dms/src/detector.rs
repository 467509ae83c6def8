//! Face and eye landmark detection

use camera_capture::VideoFrame;
use inference_engine::{
    ChannelOrder, Normalization, Preprocessor, ResizeFilter, TensorLayout, TensorShape,
};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{DmsConfig, DmsError};

/// Points per face in the iBUG 68-point scheme
pub const LANDMARK_COUNT: usize = 68;

/// Subject's right eye, outer corner first
const RIGHT_EYE: std::ops::Range<usize> = 36..42;
/// Subject's left eye, outer corner first
const LEFT_EYE: std::ops::Range<usize> = 42..48;

/// 2D point in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Six-point eye contours of one detected face.
///
/// Each eye is ordered p1..p6: outer corner, two upper-lid points, inner
/// corner, two lower-lid points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub left: [Point; 6],
    pub right: [Point; 6],
}

/// All landmarks of one detected face
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub points: Vec<Point>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Extract the two eye contours
    pub fn eyes(&self) -> Result<LandmarkSet, DmsError> {
        if self.points.len() < LEFT_EYE.end {
            return Err(DmsError::KeypointsMissing);
        }
        let mut left = [Point::default(); 6];
        let mut right = [Point::default(); 6];
        left.copy_from_slice(&self.points[LEFT_EYE]);
        right.copy_from_slice(&self.points[RIGHT_EYE]);
        Ok(LandmarkSet { left, right })
    }
}

/// Locates faces and their landmarks in a frame.
///
/// Zero faces is a normal result, not an error.
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<FaceLandmarks>, DmsError>;
}

/// Face bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let ix = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let iy = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Square region around the box, grown by `margin`, as integer
    /// `(x, y, side)`; the caller clips it to the frame
    fn square_region(&self, margin: f32) -> (u32, u32, u32) {
        let side = (self.width.max(self.height) * margin).round().max(1.0);
        let x = (self.x + self.width / 2.0 - side / 2.0).round().max(0.0);
        let y = (self.y + self.height / 2.0 - side / 2.0).round().max(0.0);
        (x as u32, y as u32, side as u32)
    }
}

/// Locates face boxes in a frame
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, frame: &VideoFrame) -> Result<Vec<FaceBox>, DmsError>;
}

/// Regresses 68 landmarks from a frame cropped to a single face.
///
/// Points are returned in crop pixel coordinates.
pub trait LandmarkRegressor: Send + Sync {
    fn regress(&self, face: &VideoFrame) -> Result<FaceLandmarks, DmsError>;
}

fn load_session(path: &str, what: &str) -> Result<Session, DmsError> {
    info!("Loading {} model from {}", what, path);
    Session::builder()
        .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|builder| builder.commit_from_file(path))
        .map_err(|e| {
            error!("Failed to load {} model: {}", what, e);
            DmsError::ModelLoad(format!("{}: {}", path, e))
        })
}

/// Run `session` on `frame` resized to `shape` and return the first
/// `count` outputs flattened to `f32`
fn run_session(
    session: &Session,
    preprocessor: &Preprocessor,
    shape: &TensorShape,
    frame: &VideoFrame,
    count: usize,
) -> Result<Vec<Vec<f32>>, DmsError> {
    let tensor = preprocessor
        .prepare(frame, shape, Normalization::Symmetric)
        .map_err(|e| DmsError::ImageProcessing(e.to_string()))?;

    let dims = shape.dims();
    let input_array = Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), tensor.into_data())
        .map_err(|e| DmsError::ImageProcessing(e.to_string()))?;

    let outputs = session
        .run(ort::inputs![input_array].map_err(|e| DmsError::Inference(e.to_string()))?)
        .map_err(|e| DmsError::Inference(e.to_string()))?;

    if outputs.len() < count {
        return Err(DmsError::Inference(format!(
            "model produced {} outputs, expected {}",
            outputs.len(),
            count
        )));
    }
    let mut flattened = Vec::with_capacity(count);
    for index in 0..count {
        flattened.push(
            outputs[index]
                .try_extract_tensor::<f32>()
                .map_err(|e| DmsError::Inference(e.to_string()))?
                .iter()
                .copied()
                .collect(),
        );
    }
    Ok(flattened)
}

/// Single-shot face detector executed with ONNX Runtime.
///
/// Expects a `[1, 3, H, W]` input scaled to [-1, 1] and two outputs:
/// scores `[1, N, 2]` (background, face) and boxes `[1, N, 4]` as
/// normalized `(x1, y1, x2, y2)` corners.
pub struct OnnxFaceDetector {
    session: Session,
    input_shape: TensorShape,
    preprocessor: Preprocessor,
    confidence: f32,
}

impl OnnxFaceDetector {
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let path = config
            .face_model_path
            .as_deref()
            .ok_or_else(|| DmsError::Config("face_model_path is not set".into()))?;
        let session = load_session(path, "face detector")?;

        Ok(Self {
            session,
            input_shape: TensorShape::new(
                config.face_input_height,
                config.face_input_width,
                3,
                TensorLayout::Nchw,
            ),
            preprocessor: Preprocessor::new(ResizeFilter::Bilinear, ChannelOrder::Rgb),
            confidence: config.face_confidence,
        })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect_faces(&self, frame: &VideoFrame) -> Result<Vec<FaceBox>, DmsError> {
        let outputs = run_session(&self.session, &self.preprocessor, &self.input_shape, frame, 2)?;
        let faces = decode_faces(&outputs[0], &outputs[1], frame.width, frame.height, self.confidence)?;
        Ok(non_max_suppression(faces, NMS_IOU_THRESHOLD))
    }
}

/// Overlap above which the weaker of two face boxes is dropped
pub const NMS_IOU_THRESHOLD: f32 = 0.3;

/// Turn raw detector outputs into pixel boxes at or above `confidence`
pub fn decode_faces(
    scores: &[f32],
    boxes: &[f32],
    width: u32,
    height: u32,
    confidence: f32,
) -> Result<Vec<FaceBox>, DmsError> {
    if scores.len() % 2 != 0 || boxes.len() % 4 != 0 || scores.len() / 2 != boxes.len() / 4 {
        return Err(DmsError::Inference(format!(
            "face detector outputs disagree: {} scores, {} box values",
            scores.len(),
            boxes.len()
        )));
    }

    let (w, h) = (width as f32, height as f32);
    Ok(scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(score, _)| score[1] >= confidence)
        .map(|(score, corners)| {
            let x1 = corners[0].clamp(0.0, 1.0) * w;
            let y1 = corners[1].clamp(0.0, 1.0) * h;
            let x2 = corners[2].clamp(0.0, 1.0) * w;
            let y2 = corners[3].clamp(0.0, 1.0) * h;
            FaceBox {
                x: x1,
                y: y1,
                width: (x2 - x1).max(0.0),
                height: (y2 - y1).max(0.0),
                confidence: score[1],
            }
        })
        .filter(|face| face.area() > 0.0)
        .collect())
}

/// Greedy non-maximum suppression, strongest box first
pub fn non_max_suppression(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<FaceBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.iou(&face) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

/// 68-point landmark model executed with ONNX Runtime.
///
/// Expects a `[1, 3, S, S]` face crop scaled to [-1, 1] and a `[1, 136]`
/// output of `(x, y)` pairs normalized to the crop.
pub struct OnnxLandmarkRegressor {
    session: Session,
    input_shape: TensorShape,
    preprocessor: Preprocessor,
}

impl OnnxLandmarkRegressor {
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let path = config
            .landmark_model_path
            .as_deref()
            .ok_or_else(|| DmsError::Config("landmark_model_path is not set".into()))?;
        let session = load_session(path, "facial landmark")?;

        let size = config.landmark_input_size;
        Ok(Self {
            session,
            input_shape: TensorShape::new(size, size, 3, TensorLayout::Nchw),
            preprocessor: Preprocessor::new(ResizeFilter::Bilinear, ChannelOrder::Rgb),
        })
    }
}

impl LandmarkRegressor for OnnxLandmarkRegressor {
    fn regress(&self, face: &VideoFrame) -> Result<FaceLandmarks, DmsError> {
        let outputs = run_session(&self.session, &self.preprocessor, &self.input_shape, face, 1)?;
        decode_landmarks(&outputs[0], face.width, face.height)?
            .into_iter()
            .next()
            .ok_or_else(|| DmsError::Inference("landmark model returned no face".into()))
    }
}

/// Margin around a detected face box before landmark regression
const FACE_CROP_MARGIN: f32 = 1.2;

/// Two-stage detector: face boxes first, then landmarks per face crop
pub struct CascadeLandmarkDetector {
    faces: Box<dyn FaceDetector>,
    landmarks: Box<dyn LandmarkRegressor>,
}

impl CascadeLandmarkDetector {
    pub fn new(faces: Box<dyn FaceDetector>, landmarks: Box<dyn LandmarkRegressor>) -> Self {
        Self { faces, landmarks }
    }

    /// Load both ONNX stages named in `config`
    pub fn from_config(config: &DmsConfig) -> Result<Self, DmsError> {
        Ok(Self::new(
            Box::new(OnnxFaceDetector::new(config)?),
            Box::new(OnnxLandmarkRegressor::new(config)?),
        ))
    }
}

impl LandmarkDetector for CascadeLandmarkDetector {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<FaceLandmarks>, DmsError> {
        let boxes = self.faces.detect_faces(frame)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for face in &boxes {
            let (x, y, side) = face.square_region(FACE_CROP_MARGIN);
            let crop = frame.crop(x, y, side, side);
            if crop.width == 0 || crop.height == 0 {
                continue;
            }
            let local = self.landmarks.regress(&crop)?;
            faces.push(FaceLandmarks::new(
                local
                    .points
                    .iter()
                    .map(|p| Point::new(p.x + x as f32, p.y + y as f32))
                    .collect(),
            ));
        }
        debug!("Located {} face(s) in frame {}", faces.len(), frame.sequence);
        Ok(faces)
    }
}

/// Detector returning the same faces for every frame (dry runs, tests)
#[derive(Debug, Clone, Default)]
pub struct FixedLandmarkDetector {
    faces: Vec<FaceLandmarks>,
}

impl FixedLandmarkDetector {
    pub fn new(faces: Vec<FaceLandmarks>) -> Self {
        Self { faces }
    }
}

impl LandmarkDetector for FixedLandmarkDetector {
    fn detect(&self, _frame: &VideoFrame) -> Result<Vec<FaceLandmarks>, DmsError> {
        Ok(self.faces.clone())
    }
}
