use crate::error::TrainingResult;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Prefix of per-epoch checkpoint files: `retinanet-model-<epoch>.json`.
pub const CHECKPOINT_PREFIX: &str = "retinanet-model-";
pub const CHECKPOINT_EXTENSION: &str = "json";

/// Filesystem layout of a run's output directory.
///
/// ```text
/// <output_dir>/
///   retinanet-model-<epoch>.json
///   results<YYYYmmdd-HHMMSS>.txt
///   loss_and_lr.csv
///   map.csv
/// ```
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic checkpoint path for a completed epoch.
    #[must_use]
    pub fn checkpoint_path(&self, epoch: u32) -> PathBuf {
        self.root.join(format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXTENSION}"))
    }

    /// Parses the epoch back out of a checkpoint file name.
    #[must_use]
    pub fn checkpoint_epoch(path: &Path) -> Option<u32> {
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
            return None;
        }
        path.file_stem()?.to_str()?.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
    }

    /// Metrics log for a run started at `started_at`.
    #[must_use]
    pub fn results_path(&self, started_at: DateTime<Local>) -> PathBuf {
        self.root.join(format!("results{}.txt", started_at.format("%Y%m%d-%H%M%S")))
    }

    #[must_use]
    pub fn loss_and_lr_report_path(&self) -> PathBuf {
        self.root.join("loss_and_lr.csv")
    }

    #[must_use]
    pub fn map_report_path(&self) -> PathBuf {
        self.root.join("map.csv")
    }

    /// Creates the output directory if it is absent.
    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
