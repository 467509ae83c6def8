//! Frame Sampling Scheduler
//!
//! Decides, frame by frame, whether enough wall-clock time has passed to
//! run another inference.

mod scheduler;

pub use scheduler::{SamplingScheduler, SamplingState, DEFAULT_INTERVAL, MIN_INTERVAL};
