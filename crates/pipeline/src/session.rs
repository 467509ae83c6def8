//! Monitoring session

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alerting::{write_png, Overlay, OverlayRenderer, ResultSink};
use camera_capture::{FrameSource, SourceError, VideoFrame};
use dms::{DrowsinessAnalysis, DrowsinessMonitor};
use frame_scheduler::SamplingScheduler;
use inference_engine::Classification;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::results::ResultCell;
use crate::stage::ClassificationStage;
use crate::telemetry::{
    DROWSINESS_ALERTS, FRAMES_READ, FRAMES_UNDECODABLE, INFERENCE_FAILURES, LANDMARK_FAILURES,
};
use crate::worker::InferenceWorker;
use crate::PipelineError;

/// Label shown before the first classification and after a stop
pub const WAITING_LABEL: &str = "Waiting";

/// Where classification runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// In the frame loop; the loop waits for each inference
    #[default]
    Inline,
    /// On a background worker; the frame loop never waits
    Worker,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    /// Sampling interval; clamped to the scheduler floor
    pub interval: Duration,
    /// Frames are resized to this size before analysis
    pub display_size: Option<(u32, u32)>,
    /// Sleep between frames of finite sources at their frame rate
    pub pace_playback: bool,
    /// Write every rendered frame as PNG here
    pub overlay_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Inline,
            interval: frame_scheduler::DEFAULT_INTERVAL,
            display_size: None,
            pace_playback: true,
            overlay_dir: None,
        }
    }
}

/// Reconfiguration applied to a running session between two frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    SetInterval(Duration),
    SetDrowsinessThresholds {
        ear_threshold: f32,
        consecutive_frames: u32,
    },
}

/// Everything produced for one displayed frame
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Frame with the overlay drawn
    pub frame: VideoFrame,
    /// Latest published classification at render time
    pub classification: Option<Classification>,
    pub drowsiness: Option<DrowsinessAnalysis>,
    /// Whether this frame passed the sampling gate
    pub sampled: bool,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Frame(Box<FrameReport>),
    /// Frame could not be decoded and was skipped
    Skipped,
    /// Source exhausted; the session has stopped
    Ended,
}

/// One monitoring session over one frame source.
///
/// Owns the scheduler, the drowsiness state and the output sink; the
/// classification stage and the result cell are shared with the worker.
pub struct MonitorSession {
    config: SessionConfig,
    stage: Arc<ClassificationStage>,
    results: Arc<ResultCell>,
    completed: mpsc::UnboundedReceiver<Classification>,
    scheduler: SamplingScheduler,
    drowsiness: Option<DrowsinessMonitor>,
    renderer: OverlayRenderer,
    sink: Box<dyn ResultSink>,
    source: Option<Box<dyn FrameSource>>,
    worker: Option<InferenceWorker>,
}

impl MonitorSession {
    pub fn new(
        stage: Arc<ClassificationStage>,
        renderer: OverlayRenderer,
        sink: Box<dyn ResultSink>,
        config: SessionConfig,
    ) -> Self {
        let (results, completed) = ResultCell::journaled();
        Self {
            scheduler: SamplingScheduler::new(config.interval),
            config,
            stage,
            results: Arc::new(results),
            completed,
            drowsiness: None,
            renderer,
            sink,
            source: None,
            worker: None,
        }
    }

    /// Run drowsiness analysis on every frame
    pub fn with_drowsiness(mut self, monitor: DrowsinessMonitor) -> Self {
        self.drowsiness = Some(monitor);
        self
    }

    /// Start pulling frames from `source`.
    ///
    /// In worker mode this spawns the worker, so it must be called from
    /// within a Tokio runtime.
    pub fn start(&mut self, source: Box<dyn FrameSource>, description: &str) -> Result<(), PipelineError> {
        if self.source.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let live = source.is_live();
        self.source = Some(source);
        if self.config.mode == SessionMode::Worker {
            self.worker = Some(InferenceWorker::spawn(
                Arc::clone(&self.stage),
                Arc::clone(&self.results),
            ));
        }

        info!(
            "Monitoring {} ({} source, {:?} mode, {}ms interval)",
            description,
            if live { "live" } else { "finite" },
            self.config.mode,
            self.scheduler.interval().as_millis()
        );
        self.note(&format!("Source opened: {}", description));
        Ok(())
    }

    /// Stop the session: release the source, invalidate in-flight results
    /// and reset all per-session state. No-op when not running.
    pub fn stop(&mut self) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        source.release();

        // Results published before the epoch moved still belong to this session
        self.results.advance_epoch();
        self.record_completed();
        if let Some(worker) = self.worker.take() {
            // Detach: the in-flight job finishes and is discarded
            drop(worker.shutdown());
        }
        self.scheduler.reset();
        if let Some(monitor) = self.drowsiness.as_mut() {
            monitor.reset_state();
        }

        info!("Monitoring stopped");
        self.note("Monitoring stopped");
    }

    /// Process one frame now
    pub fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        self.step_at(Instant::now())
    }

    /// Process one frame, evaluating the sampling gate at `now`
    pub fn step_at(&mut self, now: Instant) -> Result<StepOutcome, PipelineError> {
        let source = self.source.as_mut().ok_or(PipelineError::NotRunning)?;

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Video ended");
                self.note("Video ended");
                self.stop();
                return Ok(StepOutcome::Ended);
            }
            Err(SourceError::Decode { sequence, reason }) => {
                warn!("Skipping frame {}: {}", sequence, reason);
                counter!(FRAMES_UNDECODABLE).increment(1);
                return Ok(StepOutcome::Skipped);
            }
            Err(e) => {
                error!("Frame source failed: {}", e);
                self.stop();
                return Err(e.into());
            }
        };
        counter!(FRAMES_READ).increment(1);

        let frame = match self.config.display_size {
            Some((width, height)) if (frame.width, frame.height) != (width, height) => {
                frame.resize(width, height)
            }
            _ => frame,
        };

        let sampled = self.scheduler.should_infer(now);
        if sampled {
            self.sample(&frame)?;
        }

        let drowsiness = self.analyze_drowsiness(&frame)?;
        self.record_completed();

        let classification = self.results.latest();
        let ear_threshold = self
            .drowsiness
            .as_ref()
            .map(|monitor| monitor.debouncer().ear_threshold())
            .unwrap_or_default();
        let rendered = self.renderer.render(
            &frame,
            &Overlay {
                classification: classification.as_ref(),
                drowsiness: drowsiness.as_ref(),
                ear_threshold,
            },
        );

        if let Some(dir) = &self.config.overlay_dir {
            if let Err(e) = write_png(&rendered, dir) {
                warn!("Could not write overlay frame: {}", e);
            }
        }

        Ok(StepOutcome::Frame(Box::new(FrameReport {
            frame: rendered,
            classification,
            drowsiness,
            sampled,
        })))
    }

    /// Step until the source ends or `shutdown` completes; returns the number
    /// of frames displayed.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<u64, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let (_commands_tx, mut commands) = mpsc::channel(1);
        self.run_with_commands(shutdown, &mut commands).await
    }

    /// Like [`MonitorSession::run`], applying `commands` between frames
    pub async fn run_with_commands<F>(
        &mut self,
        shutdown: F,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<u64, PipelineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut frames = 0u64;

        while self.is_running() {
            while let Ok(command) = commands.try_recv() {
                self.apply(command);
            }

            let started = Instant::now();
            // Frame reads and inline inference block; keep other tasks moving
            let outcome = match Handle::current().runtime_flavor() {
                RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| self.step()),
                _ => self.step(),
            };
            match outcome? {
                StepOutcome::Frame(_) => frames += 1,
                StepOutcome::Skipped => {}
                StepOutcome::Ended => break,
            }

            let pause = self
                .pacing()
                .map(|interval| interval.saturating_sub(started.elapsed()))
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    self.stop();
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Session displayed {} frames", frames);
        Ok(frames)
    }

    pub fn apply(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetInterval(interval) => {
                self.set_interval(interval);
            }
            SessionCommand::SetDrowsinessThresholds {
                ear_threshold,
                consecutive_frames,
            } => self.set_drowsiness_thresholds(ear_threshold, consecutive_frames),
        }
    }

    /// Change the sampling interval; returns the interval applied
    pub fn set_interval(&mut self, interval: Duration) -> Duration {
        let applied = self.scheduler.set_interval(interval);
        self.note(&format!("Scan interval updated to {} ms", applied.as_millis()));
        applied
    }

    /// Change drowsiness thresholds; the closed-eye counter is kept
    pub fn set_drowsiness_thresholds(&mut self, ear_threshold: f32, consecutive_frames: u32) {
        if let Some(monitor) = self.drowsiness.as_mut() {
            monitor
                .debouncer_mut()
                .set_thresholds(ear_threshold, consecutive_frames);
            info!(
                "Drowsiness thresholds updated: EAR < {:.3} for {} frames",
                ear_threshold, consecutive_frames
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.source.is_some()
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    pub fn interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub fn latest(&self) -> Option<Classification> {
        self.results.latest()
    }

    /// Label to display: the latest classification or [`WAITING_LABEL`]
    pub fn current_label(&self) -> String {
        self.results
            .latest()
            .map(|c| c.label)
            .unwrap_or_else(|| WAITING_LABEL.to_string())
    }

    /// Watch the latest classification
    pub fn subscribe(&self) -> watch::Receiver<Option<Classification>> {
        self.results.subscribe()
    }

    fn pacing(&self) -> Option<Duration> {
        if !self.config.pace_playback {
            return None;
        }
        self.source.as_ref().and_then(|source| source.frame_interval())
    }

    fn sample(&mut self, frame: &VideoFrame) -> Result<(), PipelineError> {
        let epoch = self.results.epoch();
        match &self.worker {
            Some(worker) => {
                worker.submit(frame.clone(), epoch);
            }
            None => match self.stage.classify(frame) {
                Ok(classification) => {
                    self.results.publish(classification, epoch);
                }
                Err(e) if e.is_fatal() => {
                    error!("Inference cannot continue: {}", e);
                    self.stop();
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("Inference failed for frame {}: {}", frame.sequence, e);
                    counter!(INFERENCE_FAILURES).increment(1);
                }
            },
        }
        Ok(())
    }

    fn analyze_drowsiness(
        &mut self,
        frame: &VideoFrame,
    ) -> Result<Option<DrowsinessAnalysis>, PipelineError> {
        let Some(monitor) = self.drowsiness.as_mut() else {
            return Ok(None);
        };

        let was_alerting = monitor.last().is_alerting();
        match monitor.analyze(frame) {
            Ok(analysis) => {
                if analysis.is_alerting() && !was_alerting {
                    counter!(DROWSINESS_ALERTS).increment(1);
                    self.note("DROWSINESS ALERT");
                }
                Ok(Some(analysis))
            }
            Err(e) if e.is_recoverable() => {
                warn!("Drowsiness update skipped for frame {}: {}", frame.sequence, e);
                counter!(LANDMARK_FAILURES).increment(1);
                Ok(Some(monitor.last().clone()))
            }
            Err(e) => {
                error!("Drowsiness analysis cannot continue: {}", e);
                self.stop();
                Err(e.into())
            }
        }
    }

    /// Hand every classification accepted since the last call to the sink,
    /// in publish order
    fn record_completed(&mut self) {
        while let Ok(classification) = self.completed.try_recv() {
            if let Err(e) = self.sink.record(&classification) {
                warn!("Could not record classification: {}", e);
            }
        }
    }

    fn note(&mut self, message: &str) {
        debug!("{}", message);
        if let Err(e) = self.sink.note(message) {
            warn!("Could not record session note: {}", e);
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.release();
        }
    }
}
