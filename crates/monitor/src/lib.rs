//! Driver Monitor
//!
//! Wires settings, logging and metrics export to a monitoring session.

pub mod cli;
pub mod settings;

pub use settings::{MonitorSettings, Overrides, Profile, SettingsError};

use std::future::Future;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use alerting::{DetectionLog, OverlayRenderer, ResultSink};
use anyhow::{Context, Result};
use camera_capture::open_source;
use dms::DrowsinessMonitor;
use inference_engine::{InferenceEngine, LabelMap, Preprocessor};
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline::{ClassificationStage, MonitorSession, SessionCommand};
use tokio::sync::mpsc;
#[cfg(unix)]
use tokio::task::JoinHandle;
use tracing::info;
#[cfg(unix)]
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins; otherwise `-v` raises the level above `default_level`.
pub fn init_logging(verbose: u8, default_level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match verbose {
            0 => EnvFilter::try_new(default_level)
                .with_context(|| format!("invalid log level '{}'", default_level))?,
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        },
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(true).with_writer(std::io::stderr)))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

/// Serve Prometheus metrics; must run inside the Tokio runtime
pub fn install_metrics(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .with_context(|| format!("failed to start metrics listener on {}", listen))?;
    pipeline::telemetry::describe();
    info!("Serving metrics on http://{}/metrics", listen);
    Ok(())
}

/// Load models and assemble a session; nothing is opened yet
pub fn build_session(settings: &MonitorSettings) -> Result<MonitorSession> {
    let model = &settings.model;
    let engine = InferenceEngine::load(&model.path, settings.tensor_shape())
        .with_context(|| format!("loading classification model {}", model.path.display()))?;
    let labels = LabelMap::new(model.labels.iter().cloned())?;
    let stage = ClassificationStage::new(
        Arc::new(engine),
        Preprocessor::new(model.resize_filter, model.channel_order),
        model.normalization,
        model.policy,
        labels,
    )
    .context("model output does not match the configured labels")?;

    let log = match &settings.output.log_file {
        Some(path) => DetectionLog::with_file(path, settings.output.log_format)?,
        None => DetectionLog::new(),
    };
    let sink: Box<dyn ResultSink> = Box::new(log.with_retention(settings.output.retained_lines));

    if let Some(dir) = &settings.output.overlay_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating overlay directory {}", dir.display()))?;
    }

    let session = MonitorSession::new(
        Arc::new(stage),
        OverlayRenderer::new(settings.severity_map()),
        sink,
        settings.session_config(),
    );

    if !settings.drowsiness.enabled {
        return Ok(session);
    }
    let monitor =
        DrowsinessMonitor::new(&settings.dms_config()).context("loading face detector and landmark models")?;
    Ok(session.with_drowsiness(monitor))
}

/// Commands that bring a running session in line with `settings`.
///
/// Only the sampling interval and the drowsiness thresholds are reloadable;
/// models and the source need a restart.
pub fn reload_commands(settings: &MonitorSettings) -> Vec<SessionCommand> {
    vec![
        SessionCommand::SetInterval(settings.interval()),
        SessionCommand::SetDrowsinessThresholds {
            ear_threshold: settings.drowsiness.ear_threshold,
            consecutive_frames: settings.drowsiness.consecutive_frames,
        },
    ]
}

/// Re-read settings on every SIGHUP and forward the reloadable values.
///
/// A reload that fails validation is logged and the running values stay.
#[cfg(unix)]
pub fn reload_on_hangup(
    config_file: Option<PathBuf>,
    overrides: Overrides,
    commands: mpsc::Sender<SessionCommand>,
) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let settings = match MonitorSettings::load(config_file.as_deref(), &overrides) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Settings reload failed, keeping current values: {:#}", e);
                    continue;
                }
            };
            info!(
                "Settings reloaded: {}ms interval, EAR threshold {}",
                settings.sampling.interval_ms, settings.drowsiness.ear_threshold
            );
            for command in reload_commands(&settings) {
                if commands.send(command).await.is_err() {
                    return;
                }
            }
        }
    }))
}

/// Open the configured source and monitor it until it ends or `shutdown`
/// completes, applying `commands` between frames
pub async fn run<F>(
    settings: &MonitorSettings,
    mut commands: mpsc::Receiver<SessionCommand>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let selector = settings.selector()?;
    let mut session = build_session(settings)?;

    let source = open_source(&selector, &settings.camera_config())
        .with_context(|| format!("opening video source {}", selector))?;
    session.start(source, &selector.to_string())?;

    let frames = session.run_with_commands(shutdown, &mut commands).await?;
    info!("Processed {} frames, last label: {}", frames, session.current_label());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_model_is_reported_with_context() {
        let mut settings = MonitorSettings::default();
        settings.model.path = PathBuf::from("/no/such/model.onnx");
        let err = build_session(&settings).err().unwrap();
        assert!(format!("{:#}", err).contains("loading classification model /no/such/model.onnx"));
    }

    #[tokio::test]
    async fn test_run_requires_a_source() {
        let settings = MonitorSettings::default();
        let (_commands_tx, commands) = mpsc::channel(1);
        let err = run(&settings, commands, std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no video source"));
    }

    #[test]
    fn test_reload_commands_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(
            &path,
            "[sampling]\ninterval_ms = 250\n\n[drowsiness]\near_threshold = 0.2\nconsecutive_frames = 7\n",
        )
        .unwrap();
        let settings = MonitorSettings::load(Some(&path), &Overrides::default()).unwrap();

        assert_eq!(
            reload_commands(&settings),
            vec![
                SessionCommand::SetInterval(std::time::Duration::from_millis(250)),
                SessionCommand::SetDrowsinessThresholds {
                    ear_threshold: 0.2,
                    consecutive_frames: 7,
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_task_ends_with_the_session() {
        let (commands_tx, commands) = mpsc::channel(1);
        let handle = reload_on_hangup(None, Overrides::default(), commands_tx).unwrap();
        drop(commands);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
