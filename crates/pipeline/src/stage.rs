//! Preprocess, infer, classify

use std::sync::Arc;

use camera_capture::VideoFrame;
use inference_engine::{
    Classification, Classifier, InferenceEngine, InferenceError, LabelMap, Normalization, OutputPolicy,
    Preprocessor,
};
use metrics::{counter, histogram};
use tracing::info;

use crate::telemetry::{INFERENCES, INFERENCE_LATENCY};

/// The classification path for one frame.
///
/// Holds only shared, read-only state so the same stage can run inline or on
/// a blocking worker thread.
pub struct ClassificationStage {
    engine: Arc<InferenceEngine>,
    preprocessor: Preprocessor,
    normalization: Normalization,
    classifier: Classifier,
}

impl ClassificationStage {
    /// Validates `labels` against the engine's output cardinality
    pub fn new(
        engine: Arc<InferenceEngine>,
        preprocessor: Preprocessor,
        normalization: Normalization,
        policy: OutputPolicy,
        labels: LabelMap,
    ) -> Result<Self, InferenceError> {
        let classifier = Classifier::new(policy, labels, engine.output_len())?;
        info!(
            "Classification stage ready: {:?} over {} labels, input {}",
            policy,
            classifier.labels().len(),
            engine.input_shape()
        );
        Ok(Self {
            engine,
            preprocessor,
            normalization,
            classifier,
        })
    }

    pub fn classify(&self, frame: &VideoFrame) -> Result<Classification, InferenceError> {
        let tensor = self
            .preprocessor
            .prepare(frame, self.engine.input_shape(), self.normalization)?;
        let result = self.engine.infer(tensor)?;
        histogram!(INFERENCE_LATENCY).record(result.latency_ms as f64);
        let classification = self.classifier.classify(&result, frame.sequence)?;
        counter!(INFERENCES).increment(1);
        Ok(classification)
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> {
        &self.engine
    }

    pub fn labels(&self) -> &LabelMap {
        self.classifier.labels()
    }
}
