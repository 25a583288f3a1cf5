//! Resumable training state and its on-disk form.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::OutputLayout;
use crate::precision::ScalerState;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Keys a checkpoint must carry to be resumable.
pub const REQUIRED_KEYS: [&str; 4] = ["model", "optimizer", "lr_scheduler", "epoch"];

/// Everything needed to continue a run after the last completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingState {
    pub model: serde_json::Value,
    pub optimizer: serde_json::Value,
    pub lr_scheduler: serde_json::Value,
    /// Last completed epoch.
    pub epoch: u32,
    /// Present only for runs with mixed precision enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<ScalerState>,
}

impl TrainingState {
    /// Epoch a run resumed from this state starts at.
    ///
    /// `None` when `epoch` is the last representable one; `CheckpointManager::load` rejects
    /// such records.
    #[must_use]
    pub fn next_epoch(&self) -> Option<u32> {
        self.epoch.checked_add(1)
    }
}

/// Writes one checkpoint per completed epoch into the output directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    layout: OutputLayout,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    /// Saves `state` under its epoch's deterministic file name.
    pub fn save(&self, state: &TrainingState) -> TrainingResult<PathBuf> {
        let path = self.layout.checkpoint_path(state.epoch);
        Self::save_to(state, &path)?;
        Ok(path)
    }

    /// Writes `state` to `path` atomically.
    ///
    /// The record is written to a temporary file in the same directory, synced, then
    /// renamed over `path`, so readers see either the old file or the complete new one.
    pub fn save_to(state: &TrainingState, path: &Path) -> TrainingResult<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, state)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), epoch = state.epoch, "checkpoint written");
        Ok(())
    }

    /// Reads a checkpoint, rejecting records with missing or unknown top-level keys, an
    /// epoch with no successor, or out-of-range scaler state.
    pub fn load(path: &Path) -> TrainingResult<TrainingState> {
        let bytes = std::fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            TrainingError::MalformedCheckpoint { path: path.to_path_buf(), reason: e.to_string() }
        })?;

        let Some(object) = value.as_object() else {
            return Err(TrainingError::MalformedCheckpoint {
                path: path.to_path_buf(),
                reason: "top-level value is not an object".to_string(),
            });
        };
        if let Some(key) = REQUIRED_KEYS.iter().copied().find(|key| !object.contains_key(*key)) {
            return Err(TrainingError::MissingKey { path: path.to_path_buf(), key });
        }

        let malformed = |reason: String| TrainingError::MalformedCheckpoint { path: path.to_path_buf(), reason };
        let state: TrainingState = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        if state.next_epoch().is_none() {
            return Err(malformed(format!("epoch {} has no successor", state.epoch)));
        }
        if let Some(scaler) = &state.scaler {
            scaler.validate().map_err(malformed)?;
        }
        Ok(state)
    }

    /// Highest-epoch checkpoint in the output directory, if any.
    pub fn latest(&self) -> TrainingResult<Option<PathBuf>> {
        let entries = match std::fs::read_dir(self.layout.root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<(u32, PathBuf)> = None;
        for entry in entries {
            let path = entry?.path();
            if let Some(epoch) = OutputLayout::checkpoint_epoch(&path) {
                if best.as_ref().is_none_or(|(e, _)| epoch > *e) {
                    best = Some((epoch, path));
                }
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}
