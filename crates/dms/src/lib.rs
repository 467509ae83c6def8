//! Driver Monitoring System (DMS)
//!
//! Drowsiness detection from facial landmarks:
//! - Face detection, then eye landmark regression per face crop
//! - Eye-aspect-ratio (EAR) per face
//! - Frame-counter debouncing of the drowsiness alert

pub mod analysis;
pub mod config;
pub mod detector;
pub mod state;

pub use analysis::{eye_aspect_ratio, DrowsinessAnalysis, LandmarkAnalyzer};
pub use config::DmsConfig;
pub use detector::{
    CascadeLandmarkDetector, FaceBox, FaceDetector, FaceLandmarks, FixedLandmarkDetector,
    LandmarkDetector, LandmarkRegressor, LandmarkSet, OnnxFaceDetector, OnnxLandmarkRegressor, Point,
};
pub use state::{DebounceState, DrowsinessDebouncer, DrowsinessState};

use camera_capture::VideoFrame;
use thiserror::Error;
use tracing::warn;

/// DMS error types
#[derive(Error, Debug)]
pub enum DmsError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("Keypoints missing for feature calculation")]
    KeypointsMissing,

    /// Landmarks too corrupt to compute an EAR; skips one frame
    #[error("Degenerate landmarks: {0}")]
    DegenerateLandmarks(String),
}

impl DmsError {
    /// Errors that skip the current frame only
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DmsError::ModelLoad(_) | DmsError::Config(_))
    }
}

/// Drowsiness monitor: landmark analysis plus debouncing
pub struct DrowsinessMonitor {
    analyzer: LandmarkAnalyzer,
    debouncer: DrowsinessDebouncer,
    last: DrowsinessAnalysis,
}

impl DrowsinessMonitor {
    /// Create a monitor backed by the face and landmark models in `config`
    pub fn new(config: &DmsConfig) -> Result<Self, DmsError> {
        let detector = CascadeLandmarkDetector::from_config(config)?;
        Ok(Self::with_detector(Box::new(detector), config))
    }

    /// Create a monitor over any landmark detector
    pub fn with_detector(detector: Box<dyn LandmarkDetector>, config: &DmsConfig) -> Self {
        Self {
            analyzer: LandmarkAnalyzer::new(detector),
            debouncer: DrowsinessDebouncer::new(config.ear_threshold, config.consecutive_frames),
            last: DrowsinessAnalysis::default(),
        }
    }

    /// Analyze one frame.
    ///
    /// Only the first face drives the debouncer. Frames without a face leave
    /// the counter untouched. A degenerate face is reported as an error and
    /// the debouncer is not updated for that frame.
    pub fn analyze(&mut self, frame: &VideoFrame) -> Result<DrowsinessAnalysis, DmsError> {
        let eyes = self.analyzer.locate_eyes(frame)?;

        let Some(first) = eyes.first() else {
            self.last = DrowsinessAnalysis {
                faces: 0,
                eyes: None,
                ear: None,
                state: self.debouncer.current(),
                consecutive_closed_frames: self.debouncer.state().consecutive_closed_frames,
            };
            return Ok(self.last.clone());
        };

        let ear = first.ear()?;
        let state = self.debouncer.update(ear);
        if eyes.len() > 1 {
            warn!("{} faces in frame {}, using the first", eyes.len(), frame.sequence);
        }

        self.last = DrowsinessAnalysis {
            faces: eyes.len(),
            eyes: Some(*first),
            ear: Some(ear),
            state,
            consecutive_closed_frames: self.debouncer.state().consecutive_closed_frames,
        };
        Ok(self.last.clone())
    }

    /// Most recent analysis
    pub fn last(&self) -> &DrowsinessAnalysis {
        &self.last
    }

    pub fn debouncer(&self) -> &DrowsinessDebouncer {
        &self.debouncer
    }

    pub fn debouncer_mut(&mut self) -> &mut DrowsinessDebouncer {
        &mut self.debouncer
    }

    /// Reset driver state (on session stop)
    pub fn reset_state(&mut self) {
        self.debouncer.reset();
        self.last = DrowsinessAnalysis::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eye(open: f32) -> [Point; 6] {
        [
            Point::new(0.0, 0.0),
            Point::new(0.3, -open / 2.0),
            Point::new(0.7, -open / 2.0),
            Point::new(1.0, 0.0),
            Point::new(0.7, open / 2.0),
            Point::new(0.3, open / 2.0),
        ]
    }

    fn face(open: f32) -> FaceLandmarks {
        let mut points = vec![Point::new(5.0, 5.0); 68];
        points[36..42].copy_from_slice(&eye(open));
        points[42..48].copy_from_slice(&eye(open));
        FaceLandmarks::new(points)
    }

    fn monitor(faces: Vec<FaceLandmarks>, frames: u32) -> DrowsinessMonitor {
        let config = DmsConfig {
            consecutive_frames: frames,
            ..Default::default()
        };
        DrowsinessMonitor::with_detector(Box::new(FixedLandmarkDetector::new(faces)), &config)
    }

    #[test]
    fn test_closed_eyes_raise_alert() {
        let mut dms = monitor(vec![face(0.1)], 3);
        let frame = VideoFrame::solid(4, 4, [0, 0, 0], 0, 0);
        assert!(!dms.analyze(&frame).unwrap().is_alerting());
        assert!(!dms.analyze(&frame).unwrap().is_alerting());
        let analysis = dms.analyze(&frame).unwrap();
        assert!(analysis.is_alerting());
        assert!((analysis.ear.unwrap() - 0.1).abs() < 1e-5);
        assert_eq!(analysis.consecutive_closed_frames, 3);
    }

    #[test]
    fn test_open_eyes_stay_normal() {
        let mut dms = monitor(vec![face(0.4)], 1);
        let frame = VideoFrame::solid(4, 4, [0, 0, 0], 0, 0);
        let analysis = dms.analyze(&frame).unwrap();
        assert!(analysis.face_detected());
        assert_eq!(analysis.state, DrowsinessState::Normal);
    }

    #[test]
    fn test_no_face_keeps_counter() {
        let frame = VideoFrame::solid(4, 4, [0, 0, 0], 0, 0);
        let mut dms = monitor(vec![face(0.1)], 5);
        dms.analyze(&frame).unwrap();
        dms.analyze(&frame).unwrap();

        let mut faceless = monitor(Vec::new(), 5);
        *faceless.debouncer_mut() = dms.debouncer_mut().clone();
        let analysis = faceless.analyze(&frame).unwrap();
        assert!(!analysis.face_detected());
        assert_eq!(analysis.consecutive_closed_frames, 2);
    }

    #[test]
    fn test_degenerate_face_skips_update() {
        let mut points = vec![Point::new(5.0, 5.0); 68];
        points[42..48].copy_from_slice(&eye(0.1));
        let mut dms = monitor(vec![FaceLandmarks::new(points)], 1);
        let frame = VideoFrame::solid(4, 4, [0, 0, 0], 0, 0);

        let err = dms.analyze(&frame).unwrap_err();
        assert!(matches!(err, DmsError::DegenerateLandmarks(_)));
        assert!(err.is_recoverable());
        assert_eq!(dms.debouncer_mut().state().consecutive_closed_frames, 0);
    }
}
