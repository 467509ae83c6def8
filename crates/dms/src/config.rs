//! DMS configuration

use serde::{Deserialize, Serialize};

/// DMS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmsConfig {
    /// Eye-aspect-ratio below which an eye counts as closed
    pub ear_threshold: f32,

    /// Consecutive closed-eye frames before the drowsiness alert fires
    pub consecutive_frames: u32,

    /// Face detector model (single-shot, scores plus corner boxes)
    pub face_model_path: Option<String>,

    /// Face detector input width
    pub face_input_width: u32,

    /// Face detector input height
    pub face_input_height: u32,

    /// Minimum face score
    pub face_confidence: f32,

    /// Facial landmark model (68-point ONNX export, run per face crop)
    pub landmark_model_path: Option<String>,

    /// Square input size of the landmark model
    pub landmark_input_size: u32,
}

impl Default for DmsConfig {
    fn default() -> Self {
        Self {
            ear_threshold: 0.25,
            consecutive_frames: 20,
            face_model_path: None,
            face_input_width: 320,
            face_input_height: 240,
            face_confidence: 0.7,
            landmark_model_path: None,
            landmark_input_size: 192,
        }
    }
}

