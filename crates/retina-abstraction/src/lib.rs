//! Collaborator abstraction layer for Retina.
//!
//! The training core never looks inside a detector, a dataset or an evaluator. This module
//! defines the traits and types it uses to talk to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Represents an error raised by a model, dataset or evaluator collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// A sample could not be indexed or collated.
    #[error("Dataset Error: {0}")]
    DatasetError(String),

    /// The forward pass failed (e.g., malformed batch, shape mismatch).
    #[error("Forward Error: {0}")]
    ForwardError(String),

    /// Backpropagation failed or was requested without a preceding forward pass.
    #[error("Backward Error: {0}")]
    BackwardError(String),

    /// A state dictionary could not be produced or restored.
    #[error("State Error: {0}")]
    StateError(String),

    /// The evaluator could not score the predictions.
    #[error("Evaluation Error: {0}")]
    EvaluationError(String),

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

/// Result type alias for collaborator calls.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Named scalar loss components returned by a training forward pass.
///
/// Ordered by name so that logs and sums are reproducible.
pub type LossMap = BTreeMap<String, f32>;

/// Sums all loss components into the scalar that is optimized.
#[must_use]
pub fn total_loss(losses: &LossMap) -> f32 {
    losses.values().sum()
}

/// Flat parameter storage with a gradient buffer of the same length.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Parameters {
    /// Trainable values.
    pub values: Vec<f32>,
    /// Accumulated gradients, one per value.
    #[serde(skip)]
    pub grads: Vec<f32>,
}

impl Parameters {
    /// Creates a parameter set with zeroed gradients.
    #[must_use]
    pub fn new(values: Vec<f32>) -> Self {
        let grads = vec![0.0; values.len()];
        Self { values, grads }
    }

    /// Number of scalar parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when the model has no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resets every gradient to zero.
    pub fn zero_grad(&mut self) {
        self.grads.clear();
        self.grads.resize(self.values.len(), 0.0);
    }

    /// Multiplies every gradient by `factor`.
    pub fn scale_grads(&mut self, factor: f32) {
        for grad in &mut self.grads {
            *grad *= factor;
        }
    }

    /// Returns false if any gradient is NaN or infinite.
    #[must_use]
    pub fn grads_are_finite(&self) -> bool {
        self.grads.iter().all(|g| g.is_finite())
    }
}

/// A dataset the training loop can batch without decoding inputs.
///
/// Implementations must be shareable across the collation worker pool.
pub trait DetectionDataset: Send + Sync {
    /// The collated batch handed to the model.
    type Batch: Send + 'static;

    /// Total number of samples.
    fn len(&self) -> usize;

    /// Returns true when the dataset has no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `(height, width)` of a sample without materializing it.
    ///
    /// # Errors
    /// Returns a `ModelError` if the index is out of range or the metadata is unreadable.
    fn height_and_width(&self, index: usize) -> ModelResult<(u32, u32)>;

    /// Loads and collates the given samples, in order, into one batch.
    ///
    /// # Errors
    /// Returns a `ModelError` if any sample cannot be loaded.
    fn collate(&self, indices: &[usize]) -> ModelResult<Self::Batch>;
}

/// A trainable detection model.
pub trait DetectionModel {
    /// Batch type produced by the paired dataset.
    type Batch;
    /// Per-sample prediction produced in evaluation mode.
    type Prediction;

    /// Training-mode forward pass returning named loss components.
    ///
    /// # Errors
    /// Returns a `ModelError` if the forward pass fails.
    fn forward_train(&mut self, batch: &Self::Batch) -> ModelResult<LossMap>;

    /// Backpropagates `loss_scale` times the summed loss of the last `forward_train` call,
    /// accumulating into `parameters_mut().grads`.
    ///
    /// # Errors
    /// Returns a `ModelError` if there is no pending forward pass.
    fn backward(&mut self, loss_scale: f32) -> ModelResult<()>;

    /// Evaluation-mode forward pass returning one prediction per sample in the batch.
    ///
    /// # Errors
    /// Returns a `ModelError` if the forward pass fails.
    fn forward_eval(&mut self, batch: &Self::Batch) -> ModelResult<Vec<Self::Prediction>>;

    /// Trainable parameters and their gradients.
    fn parameters(&self) -> &Parameters;

    /// Mutable access for the optimizer.
    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Serializable snapshot of the model weights.
    fn state_dict(&self) -> serde_json::Value {
        serde_json::json!({ "values": self.parameters().values })
    }

    /// Restores weights from a snapshot produced by [`DetectionModel::state_dict`].
    ///
    /// # Errors
    /// Returns `ModelError::StateError` if the snapshot does not match the model.
    fn load_state_dict(&mut self, state: &serde_json::Value) -> ModelResult<()> {
        let restored: Parameters = serde_json::from_value(state.clone())
            .map_err(|e| ModelError::StateError(e.to_string()))?;
        let params = self.parameters_mut();
        if restored.len() != params.len() {
            return Err(ModelError::StateError(format!(
                "expected {} parameters, checkpoint has {}",
                params.len(),
                restored.len()
            )));
        }
        *params = Parameters::new(restored.values);
        Ok(())
    }
}

/// Scores predictions over the held-out set.
pub trait Evaluator {
    /// Prediction type produced by the paired model.
    type Prediction;

    /// Returns a fixed-order metric vector. By convention index 1 is the primary summary
    /// metric (mAP at IoU 0.5).
    ///
    /// # Errors
    /// Returns a `ModelError` if the predictions cannot be scored.
    fn evaluate(&mut self, predictions: &[Self::Prediction]) -> ModelResult<Vec<f64>>;
}
