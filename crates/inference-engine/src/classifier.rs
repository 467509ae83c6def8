//! Interpretation of raw model output as labelled classifications

use std::time::Instant;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::InferenceResult;
use crate::InferenceError;

/// How raw output values map to a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// One sigmoid scalar; below 0.5 is label 0, otherwise label 1
    BinarySigmoid,
    /// One score per class; highest score wins
    Argmax,
}

/// Ordered class labels, index `i` naming model class `i`.
///
/// The order is fixed when the model is trained; there is no implicit
/// alphabetical default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Result<Self, InferenceError> {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(InferenceError::LabelMap("no class labels configured".into()));
        }
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(InferenceError::LabelMap(format!("label {} is blank", i)));
            }
            if labels[..i].contains(label) {
                return Err(InferenceError::LabelMap(format!("duplicate label '{}'", label)));
            }
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl TryFrom<Vec<String>> for LabelMap {
    type Error = InferenceError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(labels)
    }
}

impl From<LabelMap> for Vec<String> {
    fn from(map: LabelMap) -> Self {
        map.labels
    }
}

/// A labelled inference outcome. Replaced, never merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub class_index: usize,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Wall-clock completion time; only shown, never compared
    pub completed_at: DateTime<Local>,
    /// Monotonic completion time; orders results
    pub finished: Instant,
    /// Sequence number of the frame that was classified
    pub frame_sequence: u32,
}

/// Binary-sigmoid mapping: `(class_index, confidence)`.
///
/// `p < 0.5` is class 0 with confidence `1 - 2p`; `p >= 0.5` is class 1 with
/// confidence `2p - 1`.
pub fn binary_sigmoid(p: f32) -> (usize, f32) {
    let p = p.clamp(0.0, 1.0);
    if p < 0.5 {
        (0, 1.0 - 2.0 * p)
    } else {
        (1, 2.0 * p - 1.0)
    }
}

/// Index and value of the highest score; ties go to the lowest index
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((i, score)),
        }
    }
    best
}

/// Applies an [`OutputPolicy`] and a [`LabelMap`] to inference results
#[derive(Debug, Clone)]
pub struct Classifier {
    policy: OutputPolicy,
    labels: LabelMap,
}

impl Classifier {
    /// Validate `labels` against the policy and the model's output cardinality
    pub fn new(
        policy: OutputPolicy,
        labels: LabelMap,
        output_len: Option<usize>,
    ) -> Result<Self, InferenceError> {
        match policy {
            OutputPolicy::BinarySigmoid => {
                if labels.len() != 2 {
                    return Err(InferenceError::LabelMap(format!(
                        "binary sigmoid policy needs exactly 2 labels, got {}",
                        labels.len()
                    )));
                }
                if let Some(n) = output_len.filter(|&n| n != 1) {
                    return Err(InferenceError::LabelMap(format!(
                        "binary sigmoid policy needs a single model output, model has {}",
                        n
                    )));
                }
            }
            OutputPolicy::Argmax => match output_len {
                Some(n) if n != labels.len() => {
                    return Err(InferenceError::LabelMap(format!(
                        "model has {} output classes but {} labels are configured",
                        n,
                        labels.len()
                    )));
                }
                None => warn!("Model does not declare its output cardinality; checking per inference"),
                _ => {}
            },
        }

        info!("Classifier ready: {:?} over {:?}", policy, labels.labels());
        Ok(Self { policy, labels })
    }

    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Turn one inference result into a classification
    pub fn classify(
        &self,
        result: &InferenceResult,
        frame_sequence: u32,
    ) -> Result<Classification, InferenceError> {
        if let Some(bad) = result.values.iter().find(|v| !v.is_finite()) {
            return Err(InferenceError::InvalidOutput(format!("non-finite score {}", bad)));
        }

        let (class_index, confidence) = match self.policy {
            OutputPolicy::BinarySigmoid => match result.values.as_slice() {
                [p] => binary_sigmoid(*p),
                other => {
                    return Err(InferenceError::InvalidOutput(format!(
                        "expected 1 sigmoid output, got {}",
                        other.len()
                    )))
                }
            },
            OutputPolicy::Argmax => {
                if result.values.len() != self.labels.len() {
                    return Err(InferenceError::InvalidOutput(format!(
                        "expected {} class scores, got {}",
                        self.labels.len(),
                        result.values.len()
                    )));
                }
                let (index, score) = argmax(&result.values)
                    .ok_or_else(|| InferenceError::InvalidOutput("empty output".into()))?;
                (index, score.clamp(0.0, 1.0))
            }
        };

        let label = self
            .labels
            .get(class_index)
            .ok_or_else(|| InferenceError::InvalidOutput(format!("no label for class {}", class_index)))?
            .to_string();

        debug!("Classified frame {} as {} ({:.3})", frame_sequence, label, confidence);

        Ok(Classification {
            label,
            class_index,
            confidence,
            completed_at: result.completed_at,
            finished: result.finished,
            frame_sequence,
        })
    }
}
