//! Monitor configuration.
//!
//! Layered, lowest priority first:
//! - Profile preset (`crash` or `behavior`)
//! - Optional TOML file (`--config`)
//! - Environment: `DRIVER_MONITOR_<SECTION>__<KEY>`, e.g.
//!   `DRIVER_MONITOR_SAMPLING__INTERVAL_MS=250`
//! - Command-line flags

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alerting::{LogFormat, Severity, SeverityMap, DEFAULT_RETAINED_LINES};
use camera_capture::{CameraConfig, SourceSelector};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use dms::DmsConfig;
use frame_scheduler::MIN_INTERVAL;
use inference_engine::{
    ChannelOrder, LabelMap, Normalization, OutputPolicy, ResizeFilter, TensorLayout, TensorShape,
};
use pipeline::{SessionConfig, SessionMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DRIVER_MONITOR";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Configuration could not be loaded: {0}")]
    Load(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Monitoring profile; selects the preset defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// CRASH / NORMAL classification of recorded footage
    #[default]
    Crash,
    /// Driver behavior classification and drowsiness on a live camera
    Behavior,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Crash => "crash",
            Profile::Behavior => "behavior",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub profile: Profile,
    pub source: SourceSettings,
    pub model: ModelSettings,
    pub drowsiness: DrowsinessSettings,
    pub sampling: SamplingSettings,
    pub session: SessionSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
    pub metrics: MetricsSettings,
}

/// Video source. `file` wins over `device` when both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Image file or directory of frames
    pub file: Option<PathBuf>,
    /// Camera index
    pub device: Option<u32>,
    /// Playback rate of image sequences, nominal rate of cameras
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub channels: u32,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    pub channel_order: ChannelOrder,
    pub resize_filter: ResizeFilter,
    pub policy: OutputPolicy,
    /// Class labels in model output order
    pub labels: Vec<String>,
    /// Labels drawn green
    pub safe_labels: Vec<String>,
    /// Labels drawn yellow; any other label is drawn red
    pub caution_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrowsinessSettings {
    pub enabled: bool,
    pub ear_threshold: f32,
    pub consecutive_frames: u32,
    /// Face detector run before landmark regression
    pub face_model: Option<PathBuf>,
    pub face_confidence: f32,
    pub landmark_model: Option<PathBuf>,
    pub landmark_input_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub mode: SessionMode,
    pub pace_playback: bool,
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Detection log file, appended to
    pub log_file: Option<PathBuf>,
    pub log_format: LogFormat,
    /// Directory for rendered frames
    pub overlay_dir: Option<PathBuf>,
    /// Log lines kept in memory; the file keeps everything
    pub retained_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset and no `-v` is given
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Prometheus listener; disabled when unset
    pub listen: Option<SocketAddr>,
}

/// Command-line values that override every other layer
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub profile: Option<Profile>,
    pub source: Option<PathBuf>,
    pub device: Option<u32>,
    pub interval_ms: Option<u64>,
    pub model: Option<PathBuf>,
    pub face_model: Option<PathBuf>,
    pub landmark_model: Option<PathBuf>,
    pub no_drowsiness: bool,
    pub mode: Option<SessionMode>,
    pub log_file: Option<PathBuf>,
    pub overlay_dir: Option<PathBuf>,
    pub metrics_listen: Option<SocketAddr>,
}

impl MonitorSettings {
    /// Defaults of a profile
    pub fn preset(profile: Profile) -> Self {
        match profile {
            Profile::Crash => Self {
                profile,
                source: SourceSettings {
                    file: None,
                    device: None,
                    ..SourceSettings::default()
                },
                model: ModelSettings {
                    path: PathBuf::from("models/crash_model.onnx"),
                    policy: OutputPolicy::BinarySigmoid,
                    labels: vec!["CRASH".into(), "NORMAL".into()],
                    safe_labels: vec!["NORMAL".into()],
                    caution_labels: Vec::new(),
                    ..ModelSettings::default()
                },
                drowsiness: DrowsinessSettings {
                    enabled: false,
                    ..DrowsinessSettings::default()
                },
                sampling: SamplingSettings { interval_ms: 500 },
                session: SessionSettings {
                    mode: SessionMode::Worker,
                    pace_playback: true,
                    display_width: None,
                    display_height: None,
                },
                output: OutputSettings::default(),
                logging: LoggingSettings::default(),
                metrics: MetricsSettings { listen: None },
            },
            Profile::Behavior => Self {
                profile,
                source: SourceSettings {
                    file: None,
                    device: Some(0),
                    ..SourceSettings::default()
                },
                model: ModelSettings {
                    path: PathBuf::from("models/driver_behavior.onnx"),
                    policy: OutputPolicy::Argmax,
                    labels: vec![
                        "Distracted/Other".into(),
                        "Safe Driving".into(),
                        "Talking on Phone".into(),
                        "Texting".into(),
                        "Turning".into(),
                    ],
                    safe_labels: vec!["Safe Driving".into()],
                    caution_labels: vec!["Turning".into()],
                    ..ModelSettings::default()
                },
                drowsiness: DrowsinessSettings {
                    enabled: true,
                    ..DrowsinessSettings::default()
                },
                sampling: SamplingSettings { interval_ms: 100 },
                session: SessionSettings {
                    mode: SessionMode::Inline,
                    pace_playback: true,
                    display_width: Some(800),
                    display_height: Some(600),
                },
                output: OutputSettings::default(),
                logging: LoggingSettings::default(),
                metrics: MetricsSettings { listen: None },
            },
        }
    }

    /// Load from `config_file`, the process environment and `overrides`
    pub fn load(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self, SettingsError> {
        Self::load_with_env(config_file, environment(), overrides)
    }

    /// Load with an explicit environment source
    pub fn load_with_env(
        config_file: Option<&Path>,
        env: Environment,
        overrides: &Overrides,
    ) -> Result<Self, SettingsError> {
        // The profile picks the preset, so resolve it before layering
        let layered = file_and_env(Config::builder(), config_file, env.clone()).build()?;
        let profile = match overrides.profile {
            Some(profile) => profile,
            None => match layered.get::<Profile>("profile") {
                Ok(profile) => profile,
                Err(ConfigError::NotFound(_)) => Profile::default(),
                Err(e) => return Err(e.into()),
            },
        };
        debug!("Using {} profile preset", profile.as_str());

        let builder = Config::builder().add_source(Config::try_from(&Self::preset(profile))?);
        let builder = file_and_env(builder, config_file, env);
        let builder = apply_overrides(builder.set_override("profile", profile.as_str())?, overrides)?;

        let settings: MonitorSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        info!(
            "Settings loaded: {} profile, model {}, {}ms interval",
            settings.profile.as_str(),
            settings.model.path.display(),
            settings.sampling.interval_ms
        );
        Ok(settings)
    }

    /// Range and consistency checks; every failure is fatal
    pub fn validate(&self) -> Result<(), SettingsError> {
        let model = &self.model;
        LabelMap::new(model.labels.iter().cloned())
            .map_err(|e| SettingsError::Invalid(format!("model.labels: {}", e)))?;
        if model.policy == OutputPolicy::BinarySigmoid && model.labels.len() != 2 {
            return Err(SettingsError::Invalid(format!(
                "model.labels: binary_sigmoid needs exactly 2 labels, got {}",
                model.labels.len()
            )));
        }
        if model.input_width == 0 || model.input_height == 0 {
            return Err(SettingsError::Invalid("model input size must be non-zero".into()));
        }
        if model.channels != 1 && model.channels != 3 {
            return Err(SettingsError::Invalid(format!(
                "model.channels must be 1 or 3, got {}",
                model.channels
            )));
        }

        if self.sampling.interval_ms < MIN_INTERVAL.as_millis() as u64 {
            warn!(
                "sampling.interval_ms {} is below the {}ms floor and will be clamped",
                self.sampling.interval_ms,
                MIN_INTERVAL.as_millis()
            );
        }

        let drowsiness = &self.drowsiness;
        if !(drowsiness.ear_threshold > 0.0 && drowsiness.ear_threshold < 1.0) {
            return Err(SettingsError::Invalid(format!(
                "drowsiness.ear_threshold must be in (0, 1), got {}",
                drowsiness.ear_threshold
            )));
        }
        if drowsiness.consecutive_frames == 0 {
            return Err(SettingsError::Invalid(
                "drowsiness.consecutive_frames must be at least 1".into(),
            ));
        }
        if !(drowsiness.face_confidence > 0.0 && drowsiness.face_confidence <= 1.0) {
            return Err(SettingsError::Invalid(format!(
                "drowsiness.face_confidence must be in (0, 1], got {}",
                drowsiness.face_confidence
            )));
        }
        if drowsiness.enabled && drowsiness.face_model.is_none() {
            return Err(SettingsError::Invalid(
                "drowsiness.enabled requires drowsiness.face_model".into(),
            ));
        }
        if drowsiness.enabled && drowsiness.landmark_model.is_none() {
            return Err(SettingsError::Invalid(
                "drowsiness.enabled requires drowsiness.landmark_model".into(),
            ));
        }

        if self.source.fps == 0 {
            return Err(SettingsError::Invalid("source.fps must be non-zero".into()));
        }
        match (self.session.display_width, self.session.display_height) {
            (Some(0), _) | (_, Some(0)) => {
                return Err(SettingsError::Invalid("display size must be non-zero".into()))
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(SettingsError::Invalid(
                    "session.display_width and session.display_height must be set together".into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    /// Source to open; `file` wins over `device`
    pub fn selector(&self) -> Result<SourceSelector, SettingsError> {
        match (&self.source.file, self.source.device) {
            (Some(path), _) => Ok(SourceSelector::File(path.clone())),
            (None, Some(index)) => Ok(SourceSelector::Device(index)),
            (None, None) => Err(SettingsError::Invalid(
                "no video source: set source.file (--source) or source.device (--device)".into(),
            )),
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            width: self.source.width,
            height: self.source.height,
            fps: self.source.fps,
            buffer_count: self.source.buffer_count,
        }
    }

    pub fn tensor_shape(&self) -> TensorShape {
        TensorShape::new(
            self.model.input_height,
            self.model.input_width,
            self.model.channels,
            self.model.layout,
        )
    }

    pub fn dms_config(&self) -> DmsConfig {
        let drowsiness = &self.drowsiness;
        DmsConfig {
            ear_threshold: drowsiness.ear_threshold,
            consecutive_frames: drowsiness.consecutive_frames,
            face_model_path: drowsiness
                .face_model
                .as_ref()
                .map(|path| path.display().to_string()),
            face_confidence: drowsiness.face_confidence,
            landmark_model_path: drowsiness
                .landmark_model
                .as_ref()
                .map(|path| path.display().to_string()),
            landmark_input_size: drowsiness.landmark_input_size,
            ..DmsConfig::default()
        }
    }

    pub fn severity_map(&self) -> SeverityMap {
        let map = SeverityMap::new(Severity::Danger);
        let map = self
            .model
            .safe_labels
            .iter()
            .fold(map, |map, label| map.with(label.as_str(), Severity::Safe));
        self.model
            .caution_labels
            .iter()
            .fold(map, |map, label| map.with(label.as_str(), Severity::Caution))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.sampling.interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.session.mode,
            interval: self.interval(),
            display_size: self.session.display_width.zip(self.session.display_height),
            pace_playback: self.session.pace_playback,
            overlay_dir: self.output.overlay_dir.clone(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::preset(Profile::default())
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        let camera = CameraConfig::default();
        Self {
            file: None,
            device: None,
            fps: camera.fps,
            width: camera.width,
            height: camera.height,
            buffer_count: camera.buffer_count,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("model.onnx"),
            input_width: 224,
            input_height: 224,
            channels: 3,
            layout: TensorLayout::Nhwc,
            normalization: Normalization::Unit,
            channel_order: ChannelOrder::Bgr,
            resize_filter: ResizeFilter::Bilinear,
            policy: OutputPolicy::Argmax,
            labels: Vec::new(),
            safe_labels: Vec::new(),
            caution_labels: Vec::new(),
        }
    }
}

impl Default for DrowsinessSettings {
    fn default() -> Self {
        let dms = DmsConfig::default();
        Self {
            enabled: false,
            ear_threshold: dms.ear_threshold,
            consecutive_frames: dms.consecutive_frames,
            face_model: Some(PathBuf::from("models/face_detector.onnx")),
            face_confidence: dms.face_confidence,
            landmark_model: Some(PathBuf::from("models/face_landmarks_68.onnx")),
            landmark_input_size: dms.landmark_input_size,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            log_file: None,
            log_format: LogFormat::Text,
            overlay_dir: None,
            retained_lines: DEFAULT_RETAINED_LINES,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("model.labels")
        .with_list_parse_key("model.safe_labels")
        .with_list_parse_key("model.caution_labels")
}

fn file_and_env(
    builder: ConfigBuilder<DefaultState>,
    config_file: Option<&Path>,
    env: Environment,
) -> ConfigBuilder<DefaultState> {
    let builder = match config_file {
        Some(path) => builder.add_source(File::from(path).required(true)),
        None => builder,
    };
    builder.add_source(env)
}

fn apply_overrides(
    mut builder: ConfigBuilder<DefaultState>,
    overrides: &Overrides,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if let Some(path) = &overrides.source {
        builder = builder.set_override("source.file", path.display().to_string())?;
    }
    if let Some(index) = overrides.device {
        builder = builder.set_override("source.device", index as u64)?;
    }
    if let Some(interval_ms) = overrides.interval_ms {
        builder = builder.set_override("sampling.interval_ms", interval_ms)?;
    }
    if let Some(path) = &overrides.model {
        builder = builder.set_override("model.path", path.display().to_string())?;
    }
    if let Some(path) = &overrides.face_model {
        builder = builder.set_override("drowsiness.face_model", path.display().to_string())?;
    }
    if let Some(path) = &overrides.landmark_model {
        builder = builder.set_override("drowsiness.landmark_model", path.display().to_string())?;
    }
    if overrides.no_drowsiness {
        builder = builder.set_override("drowsiness.enabled", false)?;
    }
    if let Some(mode) = overrides.mode {
        let mode = match mode {
            SessionMode::Inline => "inline",
            SessionMode::Worker => "worker",
        };
        builder = builder.set_override("session.mode", mode)?;
    }
    if let Some(path) = &overrides.log_file {
        builder = builder.set_override("output.log_file", path.display().to_string())?;
    }
    if let Some(path) = &overrides.overlay_dir {
        builder = builder.set_override("output.overlay_dir", path.display().to_string())?;
    }
    if let Some(addr) = overrides.metrics_listen {
        builder = builder.set_override("metrics.listen", addr.to_string())?;
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    fn write_toml(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_crash_preset() {
        let settings = MonitorSettings::load_with_env(None, env(&[]), &Overrides::default()).unwrap();
        assert_eq!(settings.profile, Profile::Crash);
        assert_eq!(settings.model.labels, vec!["CRASH", "NORMAL"]);
        assert_eq!(settings.model.policy, OutputPolicy::BinarySigmoid);
        assert_eq!(settings.sampling.interval_ms, 500);
        assert!(!settings.drowsiness.enabled);
        assert!(settings.selector().is_err());
    }

    #[test]
    fn test_behavior_preset() {
        let overrides = Overrides {
            profile: Some(Profile::Behavior),
            ..Default::default()
        };
        let settings = MonitorSettings::load_with_env(None, env(&[]), &overrides).unwrap();
        assert_eq!(settings.model.labels.len(), 5);
        assert_eq!(settings.model.labels[1], "Safe Driving");
        assert_eq!(settings.sampling.interval_ms, 100);
        assert!(settings.drowsiness.enabled);
        assert_eq!(settings.selector().unwrap(), SourceSelector::Device(0));
        assert_eq!(settings.session_config().display_size, Some((800, 600)));

        let severities = settings.severity_map();
        assert_eq!(severities.severity_of(Some("Turning")), Severity::Caution);
        assert_eq!(severities.severity_of(Some("Texting")), Severity::Danger);
    }

    #[test]
    fn test_layer_priority() {
        let (_dir, path) = write_toml(
            r#"
profile = "behavior"

[sampling]
interval_ms = 300

[drowsiness]
ear_threshold = 0.2
"#,
        );
        let overrides = Overrides {
            interval_ms: Some(700),
            source: Some(PathBuf::from("clips/run1")),
            ..Default::default()
        };
        let settings = MonitorSettings::load_with_env(
            Some(&path),
            env(&[("DRIVER_MONITOR_DROWSINESS__CONSECUTIVE_FRAMES", "12")]),
            &overrides,
        )
        .unwrap();

        assert_eq!(settings.profile, Profile::Behavior);
        assert_eq!(settings.sampling.interval_ms, 700);
        assert!((settings.drowsiness.ear_threshold - 0.2).abs() < 1e-6);
        assert_eq!(settings.drowsiness.consecutive_frames, 12);
        // File source wins over the preset device
        assert_eq!(
            settings.selector().unwrap(),
            SourceSelector::File(PathBuf::from("clips/run1"))
        );
    }

    #[test]
    fn test_env_labels_list() {
        let settings = MonitorSettings::load_with_env(
            None,
            env(&[
                ("DRIVER_MONITOR_MODEL__POLICY", "argmax"),
                ("DRIVER_MONITOR_MODEL__LABELS", "left,right,straight"),
            ]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(settings.model.labels, vec!["left", "right", "straight"]);
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        let (_dir, path) = write_toml("[model]\nlabels = [\"a\", \"a\"]\n");
        let result = MonitorSettings::load_with_env(Some(&path), env(&[]), &Overrides::default());
        assert!(matches!(result, Err(SettingsError::Invalid(_))));

        let (_dir, path) = write_toml("[drowsiness]\near_threshold = 1.5\n");
        let result = MonitorSettings::load_with_env(Some(&path), env(&[]), &Overrides::default());
        assert!(matches!(result, Err(SettingsError::Invalid(_))));

        let mut settings = MonitorSettings::default();
        settings.session.display_width = Some(640);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = MonitorSettings::load_with_env(
            Some(Path::new("/no/such/monitor.toml")),
            env(&[]),
            &Overrides::default(),
        );
        assert!(matches!(result, Err(SettingsError::Load(_))));
    }

    #[test]
    fn test_drowsiness_needs_face_model() {
        let mut settings = MonitorSettings::preset(Profile::Behavior);
        assert!(settings.validate().is_ok());
        let dms = settings.dms_config();
        assert_eq!(dms.face_model_path.as_deref(), Some("models/face_detector.onnx"));
        assert_eq!(dms.face_input_width, DmsConfig::default().face_input_width);

        settings.drowsiness.face_model = None;
        assert!(settings.validate().is_err());
        settings.drowsiness.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_retained_lines_from_file() {
        let (_dir, path) = write_toml("[output]\nretained_lines = 50\n");
        let settings =
            MonitorSettings::load_with_env(Some(&path), env(&[]), &Overrides::default()).unwrap();
        assert_eq!(settings.output.retained_lines, 50);
        assert_eq!(MonitorSettings::default().output.retained_lines, DEFAULT_RETAINED_LINES);
    }

    #[test]
    fn test_short_interval_is_accepted_for_clamping() {
        let overrides = Overrides {
            interval_ms: Some(50),
            ..Default::default()
        };
        let settings = MonitorSettings::load_with_env(None, env(&[]), &overrides).unwrap();
        assert_eq!(settings.interval(), Duration::from_millis(50));
    }
}
