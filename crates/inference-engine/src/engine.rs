//! Inference Engine Implementation

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;
use tract_onnx::tract_core::internal::DimLike;

use crate::tensor::{Tensor, TensorShape};
use crate::InferenceError;

/// A loaded model that maps one input tensor to a flat output vector.
///
/// Implementations must be safe to call from several threads; backends that
/// are not reentrant serialize internally for the duration of one `run`.
pub trait ModelBackend: Send + Sync {
    /// Input dimensions as declared by the model; `None` for symbolic axes
    fn input_dims(&self) -> Vec<Option<usize>>;

    /// Number of output values per image, when the model declares it
    fn output_len(&self) -> Option<usize>;

    /// Whether weights are loaded and `run` may be called
    fn is_ready(&self) -> bool {
        true
    }

    /// Forward pass
    fn run(&self, tensor: Tensor) -> Result<Vec<f32>, InferenceError>;
}

/// Raw output of one forward pass
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Sigmoid scalar or per-class scores, in model order
    pub values: Vec<f32>,
    /// Wall-clock completion time, for display
    pub completed_at: DateTime<Local>,
    /// Monotonic completion time, for ordering
    pub finished: Instant,
    /// Inference latency in milliseconds
    pub latency_ms: u64,
}

/// ONNX model executed with tract
pub struct TractBackend {
    plan: TypedRunnableModel<TypedModel>,
    input_dims: Vec<Option<usize>>,
    output_len: Option<usize>,
}

impl TractBackend {
    /// Load an ONNX model, check its declared input against `expected` and
    /// pin the batch axis to one.
    pub fn load(path: &Path, expected: &TensorShape) -> Result<Self, InferenceError> {
        let load_err = |e: TractError| InferenceError::ModelLoad(format!("{}: {}", path.display(), e));

        let mut model = tract_onnx::onnx().model_for_path(path).map_err(load_err)?;

        let input_dims = match model.clone().into_typed() {
            Ok(typed) => concrete_dims(typed.input_fact(0).map_err(load_err)?.shape.dims()),
            Err(e) => {
                debug!("Model input shape not declared ({}), relying on pinned shape", e);
                vec![None; 4]
            }
        };
        check_input_dims(&input_dims, expected)?;

        model
            .set_input_fact(0, f32::fact(expected.dims()).into())
            .map_err(load_err)?;
        let optimized = model.into_optimized().map_err(load_err)?;
        let output_len = concrete_dims(optimized.output_fact(0).map_err(load_err)?.shape.dims())
            .last()
            .copied()
            .flatten();
        let plan = optimized.into_runnable().map_err(load_err)?;

        Ok(Self {
            plan,
            input_dims,
            output_len,
        })
    }
}

impl ModelBackend for TractBackend {
    fn input_dims(&self) -> Vec<Option<usize>> {
        self.input_dims.clone()
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn run(&self, tensor: Tensor) -> Result<Vec<f32>, InferenceError> {
        let dims = tensor.shape().dims();
        let input = tract_onnx::prelude::Tensor::from_shape::<f32>(&dims, tensor.data())
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let first = outputs
            .first()
            .ok_or_else(|| InferenceError::InvalidOutput("model produced no outputs".into()))?;
        let values = first
            .as_slice::<f32>()
            .map_err(|e| InferenceError::InvalidOutput(e.to_string()))?;
        Ok(values.to_vec())
    }
}

/// Concrete sizes of `dims`; symbolic axes map to `None`
fn concrete_dims(dims: &[TDim]) -> Vec<Option<usize>> {
    dims.iter().map(|d| d.to_usize().ok()).collect()
}

/// Every concrete declared dimension must equal the configured one
fn check_input_dims(declared: &[Option<usize>], expected: &TensorShape) -> Result<(), InferenceError> {
    let wanted = expected.dims();
    let matches = declared.len() == wanted.len()
        && declared
            .iter()
            .zip(wanted.iter())
            .all(|(d, w)| d.map_or(true, |d| d == *w));

    if matches {
        Ok(())
    } else {
        let actual: Vec<String> = declared
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
            .collect();
        Err(InferenceError::ModelLoad(format!(
            "model input [{}] does not match configured shape {}",
            actual.join(", "),
            expected
        )))
    }
}

/// Scripted backend for dry runs and tests.
///
/// Returns queued outputs in order and repeats the last one once the queue
/// is drained. `Err` entries surface as [`InferenceError::InferenceFailed`].
pub struct MockBackend {
    script: Mutex<VecDeque<Result<Vec<f32>, String>>>,
    last: Mutex<Vec<f32>>,
    output_len: Option<usize>,
    delay: Duration,
    ready: bool,
}

impl MockBackend {
    /// Backend that always returns `values`
    pub fn constant(values: Vec<f32>) -> Self {
        Self::scripted(vec![Ok(values)])
    }

    /// Backend that replays `script`
    pub fn scripted(script: Vec<Result<Vec<f32>, String>>) -> Self {
        let output_len = script
            .iter()
            .find_map(|entry| entry.as_ref().ok().map(|v| v.len()));
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            output_len,
            delay: Duration::ZERO,
            ready: true,
        }
    }

    /// Backend whose weights never loaded
    pub fn unloaded() -> Self {
        Self {
            ready: false,
            ..Self::scripted(Vec::new())
        }
    }

    /// Simulated forward-pass time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelBackend for MockBackend {
    fn input_dims(&self) -> Vec<Option<usize>> {
        vec![None; 4]
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn run(&self, _tensor: Tensor) -> Result<Vec<f32>, InferenceError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let next = self
            .script
            .lock()
            .map_err(|_| InferenceError::InferenceFailed("mock script poisoned".into()))?
            .pop_front();
        let mut last = self
            .last
            .lock()
            .map_err(|_| InferenceError::InferenceFailed("mock script poisoned".into()))?;
        match next {
            Some(Ok(values)) => {
                *last = values.clone();
                Ok(values)
            }
            Some(Err(reason)) => Err(InferenceError::InferenceFailed(reason)),
            None if !last.is_empty() => Ok(last.clone()),
            None => Err(InferenceError::InferenceFailed("mock script exhausted".into())),
        }
    }
}

/// Loaded, read-only model shared by every inference caller
pub struct InferenceEngine {
    backend: Box<dyn ModelBackend>,
    input_shape: TensorShape,
    model_path: String,
}

impl InferenceEngine {
    /// Load an ONNX model from `path`; a shape mismatch is fatal here
    pub fn load(path: impl AsRef<Path>, input_shape: TensorShape) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        info!("Loading classification model from {}", path.display());
        let backend = TractBackend::load(path, &input_shape)?;
        let engine = Self::from_backend(Box::new(backend), input_shape, path.display().to_string())?;
        info!(
            "Model loaded: input {}, output cardinality {:?}",
            input_shape,
            engine.output_len()
        );
        Ok(engine)
    }

    /// Wrap an already loaded backend
    pub fn from_backend(
        backend: Box<dyn ModelBackend>,
        input_shape: TensorShape,
        model_path: impl Into<String>,
    ) -> Result<Self, InferenceError> {
        check_input_dims(&backend.input_dims(), &input_shape)?;
        Ok(Self {
            backend,
            input_shape,
            model_path: model_path.into(),
        })
    }

    /// Engine over a backend that always returns `values`
    pub fn mock(values: Vec<f32>, input_shape: TensorShape) -> Self {
        info!("Creating mock inference engine");
        Self {
            backend: Box::new(MockBackend::constant(values)),
            input_shape,
            model_path: "mock".to_string(),
        }
    }

    /// Run one forward pass
    pub fn infer(&self, tensor: Tensor) -> Result<InferenceResult, InferenceError> {
        if !self.backend.is_ready() {
            return Err(InferenceError::NotLoaded);
        }
        if *tensor.shape() != self.input_shape {
            return Err(InferenceError::InvalidInputShape {
                expected: self.input_shape.to_string(),
                actual: tensor.shape().to_string(),
            });
        }

        let start = Instant::now();
        let values = self.backend.run(tensor)?;
        if values.is_empty() {
            warn!("Model {} returned an empty output", self.model_path);
            return Err(InferenceError::InvalidOutput("empty output".into()));
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!("Inference completed in {}ms", latency_ms);

        Ok(InferenceResult {
            values,
            completed_at: Local::now(),
            finished: Instant::now(),
            latency_ms,
        })
    }

    /// Number of output values per image, if the model declares it
    pub fn output_len(&self) -> Option<usize> {
        self.backend.output_len()
    }

    /// Shape every input tensor must have
    pub fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    /// Get model path
    pub fn model_path(&self) -> &str {
        &self.model_path
    }
}
