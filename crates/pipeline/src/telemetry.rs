//! Metric names and descriptions

use metrics::{describe_counter, describe_histogram, Unit};

pub const FRAMES_READ: &str = "driver_monitor_frames_read_total";
pub const FRAMES_UNDECODABLE: &str = "driver_monitor_frames_undecodable_total";
pub const INFERENCES: &str = "driver_monitor_inferences_total";
pub const INFERENCE_FAILURES: &str = "driver_monitor_inference_failures_total";
pub const WORKER_DROPS: &str = "driver_monitor_worker_drops_total";
pub const STALE_RESULTS: &str = "driver_monitor_stale_results_total";
pub const DROWSINESS_ALERTS: &str = "driver_monitor_drowsiness_alerts_total";
pub const LANDMARK_FAILURES: &str = "driver_monitor_landmark_failures_total";
pub const INFERENCE_LATENCY: &str = "driver_monitor_inference_latency_ms";

/// Register descriptions with the installed recorder
pub fn describe() {
    describe_counter!(FRAMES_READ, "Frames pulled from the video source");
    describe_counter!(FRAMES_UNDECODABLE, "Frames skipped because they failed to decode");
    describe_counter!(INFERENCES, "Completed classifications");
    describe_counter!(INFERENCE_FAILURES, "Classifications that failed and were skipped");
    describe_counter!(WORKER_DROPS, "Sampled frames dropped because the worker slot was full");
    describe_counter!(STALE_RESULTS, "Results discarded as older than the published one or from a stopped session");
    describe_counter!(DROWSINESS_ALERTS, "Transitions into the drowsiness alert");
    describe_counter!(LANDMARK_FAILURES, "Frames whose landmarks could not be analyzed");
    describe_histogram!(INFERENCE_LATENCY, Unit::Milliseconds, "Model forward-pass latency");
}
