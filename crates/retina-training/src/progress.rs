use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Structured events emitted by the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted { start_epoch: u32, epochs: u32, train_samples: usize, val_samples: usize },
    Resumed { checkpoint: PathBuf, start_epoch: u32 },
    Iteration { epoch: u32, step: usize, total: usize, loss: f64, mean_loss: f64, lr: f64 },
    StepSkipped { epoch: u32, step: usize, scale: f32 },
    EpochFinished { epoch: u32, mean_loss: f64, lr: f64, metrics: Vec<f64> },
    CheckpointSaved { epoch: u32, path: PathBuf },
    RunFinished { epochs_completed: u32 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { start_epoch, epochs, train_samples, val_samples } => {
                info!(start_epoch, epochs, train_samples, val_samples, "training started");
            }
            ProgressEvent::Resumed { checkpoint, start_epoch } => {
                info!(checkpoint = %checkpoint.display(), start_epoch, "resumed from checkpoint");
            }
            ProgressEvent::Iteration { epoch, step, total, loss, mean_loss, lr } => {
                info!(epoch, step, total, loss, mean_loss, lr, "train");
            }
            ProgressEvent::StepSkipped { epoch, step, scale } => {
                warn!(epoch, step, scale, "non-finite gradients, step skipped");
            }
            ProgressEvent::EpochFinished { epoch, mean_loss, lr, metrics } => {
                info!(epoch, mean_loss, lr, ?metrics, "epoch finished");
            }
            ProgressEvent::CheckpointSaved { epoch, path } => {
                info!(epoch, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::RunFinished { epochs_completed } => info!(epochs_completed, "training finished"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
