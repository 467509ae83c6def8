//! Drowsiness debouncing

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Debouncer output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DrowsinessState {
    #[default]
    Normal,
    Alerting,
}

/// Counter state carried across frames of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebounceState {
    pub consecutive_closed_frames: u32,
    pub alerting: bool,
}

/// Turns per-frame EAR readings into a debounced drowsiness alert.
///
/// The alert fires once `consecutive_frames` readings in a row are below
/// `ear_threshold`; a single open-eye reading clears it.
#[derive(Debug, Clone)]
pub struct DrowsinessDebouncer {
    ear_threshold: f32,
    consecutive_frames: u32,
    state: DebounceState,
}

impl DrowsinessDebouncer {
    pub fn new(ear_threshold: f32, consecutive_frames: u32) -> Self {
        Self {
            ear_threshold,
            consecutive_frames: consecutive_frames.max(1),
            state: DebounceState::default(),
        }
    }

    /// Feed one EAR reading
    pub fn update(&mut self, ear: f32) -> DrowsinessState {
        if ear < self.ear_threshold {
            self.state.consecutive_closed_frames = self.state.consecutive_closed_frames.saturating_add(1);
            if self.state.consecutive_closed_frames >= self.consecutive_frames && !self.state.alerting {
                info!(
                    "Drowsiness alert: eyes closed for {} frames (EAR {:.3})",
                    self.state.consecutive_closed_frames, ear
                );
                self.state.alerting = true;
            }
        } else {
            if self.state.alerting {
                debug!("Drowsiness alert cleared (EAR {:.3})", ear);
            }
            self.state = DebounceState::default();
        }
        self.current()
    }

    /// Current state without feeding a reading
    pub fn current(&self) -> DrowsinessState {
        if self.state.alerting {
            DrowsinessState::Alerting
        } else {
            DrowsinessState::Normal
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Change thresholds mid-session; the counter is kept
    pub fn set_thresholds(&mut self, ear_threshold: f32, consecutive_frames: u32) {
        self.ear_threshold = ear_threshold;
        self.consecutive_frames = consecutive_frames.max(1);
    }

    pub fn ear_threshold(&self) -> f32 {
        self.ear_threshold
    }

    pub fn consecutive_frames(&self) -> u32 {
        self.consecutive_frames
    }

    /// Reset state (on session stop)
    pub fn reset(&mut self) {
        self.state = DebounceState::default();
    }
}

impl Default for DrowsinessDebouncer {
    fn default() -> Self {
        Self::new(0.25, 20)
    }
}
