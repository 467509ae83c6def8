//! Detection log

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use inference_engine::Classification;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Overlay image {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives every published classification
pub trait ResultSink: Send {
    fn record(&mut self, classification: &Classification) -> Result<(), SinkError>;

    /// Session lifecycle message (source opened, interval changed, ...)
    fn note(&mut self, _message: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// On-disk line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Jsonl,
}

#[derive(Serialize)]
struct DetectionRecord<'a> {
    timestamp: String,
    label: &'a str,
    confidence: f32,
    frame_sequence: u32,
}

#[derive(Serialize)]
struct NoteRecord<'a> {
    timestamp: String,
    message: &'a str,
}

/// `[HH:MM:SS.mmm] LABEL (xx.xx%)`
pub fn format_line(classification: &Classification) -> String {
    format!(
        "[{}] {} ({:.2}%)",
        classification.completed_at.format("%H:%M:%S%.3f"),
        classification.label,
        classification.confidence * 100.0
    )
}

fn format_note(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}", at.format("%H:%M:%S%.3f"), message)
}

/// Lines kept in memory unless [`DetectionLog::with_retention`] says otherwise
pub const DEFAULT_RETAINED_LINES: usize = 1000;

/// Append-only detection log.
///
/// The most recent lines are kept in memory, oldest evicted first. Every line
/// also goes to `tracing` and, optionally, is appended to a file that is never
/// truncated.
pub struct DetectionLog {
    lines: VecDeque<String>,
    retain: usize,
    file: Option<(PathBuf, File)>,
    format: LogFormat,
}

impl DetectionLog {
    /// In-memory log only
    pub fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            retain: DEFAULT_RETAINED_LINES,
            file: None,
            format: LogFormat::Text,
        }
    }

    /// Keep at most `lines` recent lines in memory; zero keeps none
    pub fn with_retention(mut self, lines: usize) -> Self {
        self.retain = lines;
        self.evict();
        self
    }

    /// Log that also appends to `path`
    pub fn with_file(path: impl AsRef<Path>, format: LogFormat) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
        info!("Appending detections to {} ({:?})", path.display(), format);
        Ok(Self {
            file: Some((path, file)),
            format,
            ..Self::new()
        })
    }

    /// Retained lines, oldest first
    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn append(
        &mut self,
        text_line: String,
        json_line: impl FnOnce() -> Result<String, serde_json::Error>,
    ) -> Result<(), SinkError> {
        if let Some((path, file)) = self.file.as_mut() {
            let line = match self.format {
                LogFormat::Text => text_line.clone(),
                LogFormat::Jsonl => json_line()?,
            };
            writeln!(file, "{}", line)
                .and_then(|_| file.flush())
                .map_err(|source| SinkError::Io {
                    path: path.clone(),
                    source,
                })?;
        }
        self.lines.push_back(text_line);
        self.evict();
        Ok(())
    }

    fn evict(&mut self) {
        while self.lines.len() > self.retain {
            self.lines.pop_front();
        }
    }
}

impl Default for DetectionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSink for DetectionLog {
    fn record(&mut self, classification: &Classification) -> Result<(), SinkError> {
        let line = format_line(classification);
        info!("{}", line);
        self.append(line, || {
            serde_json::to_string(&DetectionRecord {
                timestamp: classification.completed_at.to_rfc3339(),
                label: &classification.label,
                confidence: classification.confidence,
                frame_sequence: classification.frame_sequence,
            })
        })
    }

    fn note(&mut self, message: &str) -> Result<(), SinkError> {
        let now = Local::now();
        debug!("Session note: {}", message);
        self.append(format_note(now, message), || {
            serde_json::to_string(&NoteRecord {
                timestamp: now.to_rfc3339(),
                message,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn classification(label: &str, confidence: f32) -> Classification {
        Classification {
            label: label.to_string(),
            class_index: 0,
            confidence,
            completed_at: Local.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap()
                + chrono::Duration::milliseconds(42),
            finished: std::time::Instant::now(),
            frame_sequence: 7,
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            format_line(&classification("CRASH", 0.8765)),
            "[14:05:09.042] CRASH (87.65%)"
        );
        assert_eq!(
            format_line(&classification("Safe Driving", 1.0)),
            "[14:05:09.042] Safe Driving (100.00%)"
        );
    }

    #[test]
    fn test_log_is_append_only() {
        let mut log = DetectionLog::new();
        log.record(&classification("NORMAL", 0.5)).unwrap();
        log.note("Video ended").unwrap();
        log.record(&classification("CRASH", 0.25)).unwrap();

        assert_eq!(log.len(), 3);
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], "[14:05:09.042] NORMAL (50.00%)");
        assert!(lines[1].ends_with("] Video ended"));
        assert_eq!(lines[2], "[14:05:09.042] CRASH (25.00%)");
    }

    #[test]
    fn test_memory_is_bounded() {
        let mut log = DetectionLog::new().with_retention(2);
        for confidence in [0.1, 0.2, 0.3, 0.4] {
            log.record(&classification("NORMAL", confidence)).unwrap();
        }
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.lines().collect::<Vec<_>>(),
            vec!["[14:05:09.042] NORMAL (30.00%)", "[14:05:09.042] NORMAL (40.00%)"]
        );

        let mut silent = DetectionLog::new().with_retention(0);
        silent.record(&classification("CRASH", 0.9)).unwrap();
        assert!(silent.is_empty());
    }

    #[test]
    fn test_file_keeps_lines_evicted_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.log");
        let mut log = DetectionLog::with_file(&path, LogFormat::Text)
            .unwrap()
            .with_retention(1);
        log.record(&classification("NORMAL", 0.5)).unwrap();
        log.record(&classification("CRASH", 0.9)).unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_text_file_appends_across_logs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.log");

        let mut first = DetectionLog::with_file(&path, LogFormat::Text).unwrap();
        first.record(&classification("NORMAL", 0.5)).unwrap();
        drop(first);
        let mut second = DetectionLog::with_file(&path, LogFormat::Text).unwrap();
        second.record(&classification("CRASH", 0.9)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec!["[14:05:09.042] NORMAL (50.00%)", "[14:05:09.042] CRASH (90.00%)"]
        );
    }

    #[test]
    fn test_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.jsonl");
        let mut log = DetectionLog::with_file(&path, LogFormat::Jsonl).unwrap();
        log.record(&classification("Texting", 0.7)).unwrap();
        log.note("Scan interval updated to 200 ms").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records[0]["label"], "Texting");
        assert_eq!(records[0]["frame_sequence"], 7);
        assert_eq!(records[1]["message"], "Scan interval updated to 200 ms");

        // In-memory copy stays in text form
        assert_eq!(log.lines().next(), Some("[14:05:09.042] Texting (70.00%)"));
    }

    #[test]
    fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = DetectionLog::with_file(dir.path().join("missing/log.txt"), LogFormat::Text);
        assert!(matches!(result, Err(SinkError::Io { .. })));
    }
}
