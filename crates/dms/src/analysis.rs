//! Eye-aspect-ratio analysis

use camera_capture::VideoFrame;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detector::{LandmarkDetector, LandmarkSet, Point};
use crate::state::DrowsinessState;
use crate::DmsError;

/// EAR of one six-point eye contour:
/// `(|p2 - p6| + |p3 - p5|) / (2 |p1 - p4|)`
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> Result<f32, DmsError> {
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);

    if !horizontal.is_finite() || horizontal <= 0.0 {
        return Err(DmsError::DegenerateLandmarks(format!(
            "eye corners coincide at ({}, {})",
            eye[0].x, eye[0].y
        )));
    }

    let ear = (vertical_a + vertical_b) / (2.0 * horizontal);
    if !ear.is_finite() {
        return Err(DmsError::DegenerateLandmarks(format!("non-finite EAR {}", ear)));
    }
    Ok(ear)
}

impl LandmarkSet {
    pub fn left_ear(&self) -> Result<f32, DmsError> {
        eye_aspect_ratio(&self.left)
    }

    pub fn right_ear(&self) -> Result<f32, DmsError> {
        eye_aspect_ratio(&self.right)
    }

    /// Mean EAR of both eyes
    pub fn ear(&self) -> Result<f32, DmsError> {
        Ok((self.left_ear()? + self.right_ear()?) / 2.0)
    }
}

/// Locates eye landmarks through a [`LandmarkDetector`]
pub struct LandmarkAnalyzer {
    detector: Box<dyn LandmarkDetector>,
}

impl LandmarkAnalyzer {
    pub fn new(detector: Box<dyn LandmarkDetector>) -> Self {
        Self { detector }
    }

    /// Eye contours of every face found in `frame`
    pub fn locate_eyes(&self, frame: &VideoFrame) -> Result<Vec<LandmarkSet>, DmsError> {
        let faces = self.detector.detect(frame)?;
        let eyes = faces
            .iter()
            .map(|face| face.eyes())
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Frame {}: {} eye set(s)", frame.sequence, eyes.len());
        Ok(eyes)
    }
}

/// Per-frame drowsiness result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrowsinessAnalysis {
    /// Faces found in the frame
    pub faces: usize,

    /// Eyes of the face that drove the update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eyes: Option<LandmarkSet>,

    /// Mean EAR of that face
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ear: Option<f32>,

    pub state: DrowsinessState,

    pub consecutive_closed_frames: u32,
}

impl DrowsinessAnalysis {
    pub fn face_detected(&self) -> bool {
        self.faces > 0
    }

    pub fn is_alerting(&self) -> bool {
        self.state == DrowsinessState::Alerting
    }
}
