use crate::config::{LrScheduleConfig, OptimizerConfig, WarmupConfig};
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};

/// Per-epoch learning-rate schedule.
pub trait LrScheduler: Send {
    /// Rate for the current epoch.
    fn lr(&self) -> f64;

    /// Advances by one epoch.
    fn step(&mut self);

    fn state_dict(&self) -> TrainingResult<serde_json::Value>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainingResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepLrState {
    pub base_lr: f64,
    pub step_size: u32,
    pub gamma: f64,
    /// Number of completed `step` calls.
    pub last_epoch: u32,
}

/// Decays the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    state: StepLrState,
}

impl StepLr {
    #[must_use]
    pub fn new(optimizer: &OptimizerConfig, schedule: &LrScheduleConfig) -> Self {
        Self {
            state: StepLrState {
                base_lr: optimizer.lr,
                step_size: schedule.step_size.max(1),
                gamma: schedule.gamma,
                last_epoch: 0,
            },
        }
    }

    #[must_use]
    pub fn state(&self) -> &StepLrState {
        &self.state
    }
}

impl LrScheduler for StepLr {
    fn lr(&self) -> f64 {
        let decays = self.state.last_epoch / self.state.step_size.max(1);
        self.state.base_lr * self.state.gamma.powi(decays as i32)
    }

    fn step(&mut self) {
        self.state.last_epoch += 1;
    }

    fn state_dict(&self) -> TrainingResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainingResult<()> {
        self.state = serde_json::from_value(state.clone())?;
        Ok(())
    }
}

/// Linear warmup multiplier for the first iterations of a run.
///
/// For iteration `i < W` the factor is `f * (1 - i / W) + i / W`; from `W` on it is `1`.
/// `W` is capped at one less than the number of batches in the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Warmup {
    iters: usize,
    start_factor: f64,
}

impl Warmup {
    #[must_use]
    pub fn new(config: &WarmupConfig, batches_per_epoch: usize) -> Self {
        Self {
            iters: config.max_iters.min(batches_per_epoch.saturating_sub(1)),
            start_factor: config.factor,
        }
    }

    /// Number of warmup iterations `W`.
    #[must_use]
    pub fn iters(&self) -> usize {
        self.iters
    }

    #[must_use]
    pub fn factor_at(&self, iteration: usize) -> f64 {
        if iteration >= self.iters {
            return 1.0;
        }
        let alpha = iteration as f64 / self.iters as f64;
        self.start_factor * (1.0 - alpha) + alpha
    }
}
