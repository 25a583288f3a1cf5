//! Retina Training
//!
//! Orchestration for object-detection training runs:
//! - Aspect-ratio grouping and bucket-homogeneous batch sampling
//! - Prefetching batch collation on a bounded worker pool
//! - Loss-scaled mixed-precision steps, SGD and step/warmup learning-rate schedules
//! - Atomic checkpoints, append-only metrics log and curve reports
//! - The epoch loop (`TrainingLoop`) composing all of the above

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod grouping;
pub mod layout;
pub mod loader;
pub mod metrics;
pub mod optim;
pub mod precision;
pub mod progress;
pub mod report;
pub mod sampler;
pub mod scheduler;

pub use checkpoint::{CheckpointManager, TrainingState, REQUIRED_KEYS};
pub use config::{Device, LrScheduleConfig, OptimizerConfig, ScalerConfig, TrainingConfig, WarmupConfig, DATASET_MARKER};
pub use driver::{RunSummary, TrainingLoop};
pub use error::{TrainingError, TrainingResult};
pub use grouping::{create_aspect_ratio_groups, effective_group_factor, group_dataset};
pub use layout::OutputLayout;
pub use loader::PrefetchLoader;
pub use metrics::{MetricsLogger, MetricsRecord};
pub use optim::{Optimizer, Sgd, SgdState};
pub use precision::{GradScaler, MixedPrecision, ScalerState, StepOutcome};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use report::{CsvReporter, History, Reporter};
pub use sampler::{epoch_permutation, GroupedBatchSampler};
pub use scheduler::{LrScheduler, StepLr, StepLrState, Warmup};
