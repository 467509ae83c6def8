//! Driver Monitoring Session
//!
//! Ties the pipeline stages together:
//! - Frame source -> sampling gate -> classification, inline or on a worker
//! - Drowsiness analysis on every frame
//! - Publication of the latest classification, overlay rendering and logging

pub mod telemetry;
mod results;
mod session;
mod stage;
mod worker;

pub use results::{PublishOutcome, ResultCell};
pub use session::{
    FrameReport, MonitorSession, SessionCommand, SessionConfig, SessionMode, StepOutcome,
    WAITING_LABEL,
};
pub use stage::ClassificationStage;
pub use worker::InferenceWorker;

use alerting::SinkError;
use camera_capture::SourceError;
use dms::DmsError;
use inference_engine::InferenceError;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Frame source: {0}")]
    Source(#[from] SourceError),

    #[error("Inference: {0}")]
    Inference(#[from] InferenceError),

    #[error("Drowsiness analysis: {0}")]
    Drowsiness(#[from] DmsError),

    #[error("Output: {0}")]
    Sink(#[from] SinkError),

    #[error("Session is not running")]
    NotRunning,

    #[error("Session is already running")]
    AlreadyRunning,
}
