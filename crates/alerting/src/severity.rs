//! Label severity mapping

use std::collections::BTreeMap;

use image::Rgb;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How alarming a displayed label is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// No classification yet
    Pending,
    Safe,
    Caution,
    Danger,
}

impl Severity {
    /// Accent color (label stripe, bars)
    pub fn color(&self) -> Rgb<u8> {
        match self {
            Severity::Pending => Rgb([255, 165, 0]),
            Severity::Safe => Rgb([0, 200, 0]),
            Severity::Caution => Rgb([255, 215, 0]),
            Severity::Danger => Rgb([230, 0, 0]),
        }
    }

    /// Darker tint used for the translucent status box
    pub fn background(&self) -> Rgb<u8> {
        match self {
            Severity::Pending => Rgb([90, 55, 0]),
            Severity::Safe => Rgb([0, 70, 0]),
            Severity::Caution => Rgb([90, 75, 0]),
            Severity::Danger => Rgb([90, 0, 0]),
        }
    }
}

/// Label -> severity lookup; unknown labels fall back to `default`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityMap {
    pub labels: BTreeMap<String, Severity>,
    pub default: Severity,
}

impl SeverityMap {
    pub fn new(default: Severity) -> Self {
        Self {
            labels: BTreeMap::new(),
            default,
        }
    }

    /// Add or replace one label
    pub fn with(mut self, label: impl Into<String>, severity: Severity) -> Self {
        self.labels.insert(label.into(), severity);
        self
    }

    /// CRASH / NORMAL model
    pub fn crash() -> Self {
        Self::new(Severity::Danger)
            .with("CRASH", Severity::Danger)
            .with("NORMAL", Severity::Safe)
    }

    /// Five-class driver behavior model
    pub fn behavior() -> Self {
        Self::new(Severity::Danger)
            .with("Safe Driving", Severity::Safe)
            .with("Turning", Severity::Caution)
    }

    /// Severity of `label`; `None` is the waiting placeholder
    pub fn severity_of(&self, label: Option<&str>) -> Severity {
        let Some(label) = label else {
            return Severity::Pending;
        };
        match self.labels.get(label) {
            Some(severity) => *severity,
            None => {
                debug!("No severity configured for '{}', using {:?}", label, self.default);
                self.default
            }
        }
    }
}

impl Default for SeverityMap {
    fn default() -> Self {
        Self::new(Severity::Danger)
    }
}
