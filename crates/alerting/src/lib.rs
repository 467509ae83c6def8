//! Alerting and Presentation
//!
//! Provides label severity mapping, the append-only detection log and the
//! frame overlay renderer.

mod glyphs;
mod log;
mod overlay;
mod severity;

pub use log::{format_line, DetectionLog, LogFormat, ResultSink, SinkError, DEFAULT_RETAINED_LINES};
pub use overlay::{write_png, Overlay, OverlayRenderer};
pub use severity::{Severity, SeverityMap};
