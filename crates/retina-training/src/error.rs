use retina_abstraction::ModelError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("dataset marker VOCdevkit not found under '{}'", .0.display())]
    MissingDatasetRoot(PathBuf),

    #[error("checkpoint {} is missing required key `{key}`", path.display())]
    MissingKey { path: PathBuf, key: &'static str },

    #[error("malformed checkpoint {}: {reason}", path.display())]
    MalformedCheckpoint { path: PathBuf, reason: String },

    #[error("loss is {total}, stopping training (components: {components})")]
    NonFiniteLoss { total: f32, components: String },

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("data loader error: {0}")]
    Loader(String),

    #[error("metrics log error: {0}")]
    Metrics(String),

    #[error("report error: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
