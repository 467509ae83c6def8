//! Background inference worker

use std::sync::Arc;

use camera_capture::VideoFrame;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::results::ResultCell;
use crate::stage::ClassificationStage;
use crate::telemetry::{INFERENCE_FAILURES, WORKER_DROPS};

struct Job {
    frame: VideoFrame,
    epoch: u64,
}

/// Runs classifications off the render loop.
///
/// Frames are handed over through a single-slot channel; while the slot is
/// occupied further frames are dropped, never queued. Results go to the shared
/// [`ResultCell`].
pub struct InferenceWorker {
    tx: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

impl InferenceWorker {
    /// Spawn the worker task on the current Tokio runtime
    pub fn spawn(stage: Arc<ClassificationStage>, results: Arc<ResultCell>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run(rx, stage, results));
        info!("Inference worker started");
        Self { tx, handle }
    }

    /// Offer a frame; returns `false` if it was dropped
    pub fn submit(&self, frame: VideoFrame, epoch: u64) -> bool {
        let sequence = frame.sequence;
        match self.tx.try_send(Job { frame, epoch }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Worker busy, dropping frame {}", sequence);
                counter!(WORKER_DROPS).increment(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Worker has exited, dropping frame {}", sequence);
                counter!(WORKER_DROPS).increment(1);
                false
            }
        }
    }

    /// Stop accepting frames. A job already taken finishes in the background;
    /// its result is discarded by the epoch check.
    pub fn shutdown(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

async fn run(mut rx: mpsc::Receiver<Job>, stage: Arc<ClassificationStage>, results: Arc<ResultCell>) {
    while let Some(job) = rx.recv().await {
        let stage = Arc::clone(&stage);
        let sequence = job.frame.sequence;
        let outcome = tokio::task::spawn_blocking(move || stage.classify(&job.frame)).await;

        match outcome {
            Ok(Ok(classification)) => {
                results.publish(classification, job.epoch);
            }
            Ok(Err(e)) => {
                warn!("Inference failed for frame {}: {}", sequence, e);
                counter!(INFERENCE_FAILURES).increment(1);
            }
            Err(e) => {
                error!("Inference task for frame {} panicked: {}", sequence, e);
                counter!(INFERENCE_FAILURES).increment(1);
            }
        }
    }
    info!("Inference worker stopped");
}
