use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directory that must exist under the dataset root.
pub const DATASET_MARKER: &str = "VOCdevkit";

/// Upper bound on the number of collation workers picked automatically.
const MAX_AUTO_WORKERS: usize = 8;

/// Compute device requested for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
    Metal,
}

impl Device {
    /// Falls back to the CPU when the requested accelerator is not available.
    #[must_use]
    pub fn resolve(self, accelerator_available: bool) -> Self {
        match self {
            Self::Cpu => Self::Cpu,
            other if accelerator_available => other,
            _ => Self::Cpu,
        }
    }

    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
            Self::Metal => "metal",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cuda(0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal => f.write_str("metal"),
        }
    }
}

impl FromStr for Device {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            "metal" | "mps" => Ok(Self::Metal),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| TrainingError::InvalidConfig(format!("unknown device: {other}")))?;
                Ok(Self::Cuda(ordinal))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// SGD hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { lr: 0.005, momentum: 0.9, weight_decay: 0.0005 }
    }
}

/// Per-epoch step decay of the learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LrScheduleConfig {
    pub step_size: u32,
    pub gamma: f64,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self { step_size: 3, gamma: 0.33 }
    }
}

/// Linear learning-rate warmup applied during the first epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub max_iters: usize,
    pub factor: f64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self { enabled: true, max_iters: 1000, factor: 1.0 / 1000.0 }
    }
}

/// Dynamic loss-scaling policy for mixed precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScalerConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
    pub max_scale: f32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            max_scale: 16_777_216.0,
        }
    }
}

/// Immutable configuration for one training run.
///
/// Built once (CLI flags over an optional TOML file), validated, then handed to each
/// component's constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub device: Device,
    /// Root directory containing `VOCdevkit`.
    pub data_path: PathBuf,
    pub num_classes: usize,
    pub output_dir: PathBuf,
    /// Checkpoint to resume from.
    pub resume: Option<PathBuf>,
    pub start_epoch: u32,
    /// Total number of epochs (exclusive end of the epoch range).
    pub epochs: u32,
    pub batch_size: usize,
    /// `>= 0` groups samples into `2^k` aspect-ratio buckets, negative disables grouping.
    pub aspect_ratio_group_factor: i32,
    /// Enable loss-scaled mixed precision.
    pub amp: bool,
    pub seed: Option<u64>,
    /// Emit an iteration event every `print_freq` steps.
    pub print_freq: usize,
    /// Collation workers; derived from the batch size when unset.
    pub workers: Option<usize>,
    pub optimizer: OptimizerConfig,
    pub lr_schedule: LrScheduleConfig,
    pub warmup: WarmupConfig,
    pub scaler: ScalerConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            data_path: PathBuf::from("/data"),
            num_classes: 20,
            output_dir: PathBuf::from("./save_weights"),
            resume: None,
            start_epoch: 0,
            epochs: 15,
            batch_size: 4,
            aspect_ratio_group_factor: 3,
            amp: false,
            seed: None,
            print_freq: 50,
            workers: None,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LrScheduleConfig::default(),
            warmup: WarmupConfig::default(),
            scaler: ScalerConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> TrainingResult<Self> {
        toml::from_str(content).map_err(|e| TrainingError::InvalidConfig(e.to_string()))
    }

    /// Loads a TOML config file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| TrainingError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.num_classes == 0 {
            return Err(TrainingError::InvalidConfig("num_classes must be >= 1".to_string()));
        }
        if self.print_freq == 0 {
            return Err(TrainingError::InvalidConfig("print_freq must be >= 1".to_string()));
        }

        let opt = &self.optimizer;
        if !opt.lr.is_finite() || opt.lr <= 0.0 {
            return Err(TrainingError::InvalidConfig("optimizer.lr must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&opt.momentum) {
            return Err(TrainingError::InvalidConfig("optimizer.momentum must be in [0, 1)".to_string()));
        }
        if !opt.weight_decay.is_finite() || opt.weight_decay < 0.0 {
            return Err(TrainingError::InvalidConfig("optimizer.weight_decay must be >= 0".to_string()));
        }

        if self.lr_schedule.step_size == 0 {
            return Err(TrainingError::InvalidConfig("lr_schedule.step_size must be >= 1".to_string()));
        }
        if !(self.lr_schedule.gamma > 0.0 && self.lr_schedule.gamma <= 1.0) {
            return Err(TrainingError::InvalidConfig("lr_schedule.gamma must be in (0, 1]".to_string()));
        }

        if !(self.warmup.factor > 0.0 && self.warmup.factor <= 1.0) {
            return Err(TrainingError::InvalidConfig("warmup.factor must be in (0, 1]".to_string()));
        }

        let sc = &self.scaler;
        if !sc.init_scale.is_finite() || sc.init_scale <= 0.0 {
            return Err(TrainingError::InvalidConfig("scaler.init_scale must be > 0".to_string()));
        }
        if sc.growth_factor <= 1.0 {
            return Err(TrainingError::InvalidConfig("scaler.growth_factor must be > 1".to_string()));
        }
        if !(sc.backoff_factor > 0.0 && sc.backoff_factor < 1.0) {
            return Err(TrainingError::InvalidConfig("scaler.backoff_factor must be in (0, 1)".to_string()));
        }
        if sc.growth_interval == 0 {
            return Err(TrainingError::InvalidConfig("scaler.growth_interval must be >= 1".to_string()));
        }
        if sc.max_scale < sc.init_scale {
            return Err(TrainingError::InvalidConfig("scaler.max_scale must be >= scaler.init_scale".to_string()));
        }
        Ok(())
    }

    /// Fails unless `data_path/VOCdevkit` exists.
    pub fn require_dataset_root(&self) -> TrainingResult<()> {
        if self.data_path.join(DATASET_MARKER).is_dir() {
            Ok(())
        } else {
            Err(TrainingError::MissingDatasetRoot(self.data_path.clone()))
        }
    }

    /// Grouping factor `k`, or `None` when aspect-ratio grouping is disabled.
    #[must_use]
    pub fn grouping_factor(&self) -> Option<u32> {
        u32::try_from(self.aspect_ratio_group_factor).ok()
    }

    /// Number of collation workers: `min(cpus, batch_size if > 1 else 0, 8)` unless configured.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if let Some(workers) = self.workers {
            return workers;
        }
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let per_batch = if self.batch_size > 1 { self.batch_size } else { 0 };
        cpus.min(per_batch).min(MAX_AUTO_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = TrainingConfig { batch_size: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_group_factor_disables_grouping() {
        let config = TrainingConfig { aspect_ratio_group_factor: -1, ..Default::default() };
        assert_eq!(config.grouping_factor(), None);
        let config = TrainingConfig { aspect_ratio_group_factor: 0, ..Default::default() };
        assert_eq!(config.grouping_factor(), Some(0));
    }

    #[test]
    fn test_worker_count_zero_for_unit_batches() {
        let config = TrainingConfig { batch_size: 1, ..Default::default() };
        assert_eq!(config.worker_count(), 0);
        let config = TrainingConfig { batch_size: 64, ..Default::default() };
        assert!(config.worker_count() <= MAX_AUTO_WORKERS);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = TrainingConfig::from_toml_str(
            r#"
            epochs = 2
            device = "cpu"
            amp = true

            [scaler]
            growth_interval = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.epochs, 2);
        assert_eq!(config.device, Device::Cpu);
        assert!(config.amp);
        assert_eq!(config.scaler.growth_interval, 10);
        assert_eq!(config.batch_size, 4);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(TrainingConfig::from_toml_str("epoch = 3").is_err());
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(0).resolve(false), Device::Cpu);
        assert_eq!(Device::Cuda(0).to_string(), "cuda:0");
    }

    #[test]
    fn test_missing_dataset_root() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = TrainingConfig { data_path: temp.path().to_path_buf(), ..Default::default() };
        assert!(matches!(config.require_dataset_root(), Err(TrainingError::MissingDatasetRoot(_))));
        std::fs::create_dir_all(temp.path().join(DATASET_MARKER)).unwrap();
        config.require_dataset_root().unwrap();
    }
}
