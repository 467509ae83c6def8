//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use pipeline::SessionMode;

use crate::settings::{Overrides, Profile};

/// Where classification runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Inline,
    Worker,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Inline => SessionMode::Inline,
            ModeArg::Worker => SessionMode::Worker,
        }
    }
}

/// Driver monitor - crash detection, driver behavior and drowsiness alerts
#[derive(Debug, Parser)]
#[command(name = "driver-monitor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Monitoring profile
    #[arg(short, long, value_enum)]
    pub profile: Option<Profile>,

    /// Image file or directory of frames to play back
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Camera index
    #[arg(short, long)]
    pub device: Option<u32>,

    /// Sampling interval in milliseconds (floor 100)
    #[arg(short, long)]
    pub interval_ms: Option<u64>,

    /// Classification model (ONNX)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Face detector model (ONNX)
    #[arg(long)]
    pub face_model: Option<PathBuf>,

    /// Facial landmark model (ONNX)
    #[arg(long)]
    pub landmark_model: Option<PathBuf>,

    /// Disable drowsiness detection
    #[arg(long)]
    pub no_drowsiness: bool,

    /// Run classification inline or on a worker
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Append detections to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Write rendered frames to this directory
    #[arg(long)]
    pub overlay_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            profile: self.profile,
            source: self.source.clone(),
            device: self.device,
            interval_ms: self.interval_ms,
            model: self.model.clone(),
            face_model: self.face_model.clone(),
            landmark_model: self.landmark_model.clone(),
            no_drowsiness: self.no_drowsiness,
            mode: self.mode.map(Into::into),
            log_file: self.log_file.clone(),
            overlay_dir: self.overlay_dir.clone(),
            metrics_listen: self.metrics_listen,
        }
    }
}
