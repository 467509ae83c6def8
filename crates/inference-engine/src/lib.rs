//! Frame Inference Engine
//!
//! Turns video frames into labelled classifications:
//! - Preprocessing into the tensor shape a model was trained on
//! - ONNX inference using tract, with the input shape validated at load
//! - Binary-sigmoid and multi-class argmax output interpretation

mod classifier;
mod engine;
mod tensor;

pub use classifier::{
    argmax, binary_sigmoid, Classification, Classifier, LabelMap, OutputPolicy,
};
pub use engine::{InferenceEngine, InferenceResult, MockBackend, ModelBackend, TractBackend};
pub use tensor::{
    ChannelOrder, Normalization, Preprocessor, ResizeFilter, Tensor, TensorLayout, TensorShape,
};

use thiserror::Error;

/// Errors during model loading, preprocessing and inference
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    #[error("Model not loaded")]
    NotLoaded,
    #[error("Invalid input shape: expected {expected}, got {actual}")]
    InvalidInputShape { expected: String, actual: String },
    #[error("Preprocessing failed: {0}")]
    Preprocess(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
    #[error("Invalid label map: {0}")]
    LabelMap(String),
}

impl InferenceError {
    /// Whether the error ends the session rather than a single tick
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InferenceError::ModelLoad(_) | InferenceError::NotLoaded | InferenceError::LabelMap(_)
        )
    }
}
