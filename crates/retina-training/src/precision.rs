//! Loss-scaled mixed-precision optimization steps.
//!
//! Reduced-precision gradients underflow easily, so the loss is multiplied by a scale
//! factor before backpropagation and the gradients are divided by it again before the
//! update. A step whose unscaled gradients contain NaN or infinity is skipped and the scale
//! backs off; after `growth_interval` clean steps the scale grows toward `max_scale`.

use crate::config::ScalerConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::optim::Optimizer;
use retina_abstraction::{total_loss, DetectionModel, LossMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted scaler state, stored in checkpoints when mixed precision is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
    pub max_scale: f32,
    /// Consecutive clean steps since the last growth or backoff.
    pub growth_tracker: u32,
}

impl ScalerState {
    /// Checks the same bounds `TrainingConfig::validate` enforces for `scaler.*`.
    pub fn validate(&self) -> Result<(), String> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(format!("scaler.scale must be finite and > 0, got {}", self.scale));
        }
        if !self.growth_factor.is_finite() || self.growth_factor <= 1.0 {
            return Err(format!("scaler.growth_factor must be > 1, got {}", self.growth_factor));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(format!("scaler.backoff_factor must be in (0, 1), got {}", self.backoff_factor));
        }
        if self.growth_interval == 0 {
            return Err("scaler.growth_interval must be >= 1".to_string());
        }
        if self.max_scale.is_nan() || self.max_scale < self.scale {
            return Err(format!("scaler.max_scale {} is below scaler.scale {}", self.max_scale, self.scale));
        }
        Ok(())
    }
}

/// Dynamic loss scaler.
#[derive(Debug, Clone)]
pub struct GradScaler {
    state: ScalerState,
}

impl GradScaler {
    #[must_use]
    pub fn new(config: &ScalerConfig) -> Self {
        Self {
            state: ScalerState {
                scale: config.init_scale,
                growth_factor: config.growth_factor,
                backoff_factor: config.backoff_factor,
                growth_interval: config.growth_interval.max(1),
                max_scale: config.max_scale,
                growth_tracker: 0,
            },
        }
    }

    #[must_use]
    pub fn from_state(mut state: ScalerState) -> Self {
        state.growth_interval = state.growth_interval.max(1);
        Self { state }
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.state.scale
    }

    #[must_use]
    pub fn state(&self) -> &ScalerState {
        &self.state
    }

    /// Adapts the scale after a step. `found_inf` means the step was skipped.
    pub fn update(&mut self, found_inf: bool) {
        let state = &mut self.state;
        if found_inf {
            state.scale = (state.scale * state.backoff_factor).max(f32::MIN_POSITIVE);
            state.growth_tracker = 0;
            return;
        }

        state.growth_tracker += 1;
        if state.growth_tracker >= state.growth_interval {
            state.scale = (state.scale * state.growth_factor).min(state.max_scale);
            state.growth_tracker = 0;
        }
    }
}

/// Result of one optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Unscaled loss components from the forward pass.
    pub losses: LossMap,
    /// Sum of `losses`.
    pub loss: f32,
    /// False when the update was skipped because of non-finite gradients.
    pub applied: bool,
    /// Scale in effect after the step, when mixed precision is enabled.
    pub scale: Option<f32>,
}

/// Runs forward, backward and update, with or without loss scaling.
#[derive(Debug, Clone, Default)]
pub struct MixedPrecision {
    scaler: Option<GradScaler>,
}

impl MixedPrecision {
    /// Pass-through: no scaling, no skipped steps.
    #[must_use]
    pub fn disabled() -> Self {
        Self { scaler: None }
    }

    #[must_use]
    pub fn enabled(config: &ScalerConfig) -> Self {
        Self { scaler: Some(GradScaler::new(config)) }
    }

    #[must_use]
    pub fn new(amp: bool, config: &ScalerConfig) -> Self {
        if amp { Self::enabled(config) } else { Self::disabled() }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.scaler.is_some()
    }

    #[must_use]
    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    /// Snapshot for checkpointing; `None` when disabled.
    #[must_use]
    pub fn state(&self) -> Option<ScalerState> {
        self.scaler.as_ref().map(|s| s.state().clone())
    }

    /// Adopts a checkpointed scaler state.
    ///
    /// A missing state keeps the freshly initialized scaler; a state is ignored when mixed
    /// precision is disabled.
    pub fn restore(&mut self, state: Option<ScalerState>) {
        if let (Some(scaler), Some(state)) = (self.scaler.as_mut(), state) {
            *scaler = GradScaler::from_state(state);
        }
    }

    pub fn step<M>(
        &mut self,
        model: &mut M,
        optimizer: &mut dyn Optimizer,
        batch: &M::Batch,
    ) -> TrainingResult<StepOutcome>
    where
        M: DetectionModel + ?Sized,
    {
        model.parameters_mut().zero_grad();
        let losses = model.forward_train(batch)?;
        let loss = total_loss(&losses);
        if !loss.is_finite() {
            return Err(TrainingError::NonFiniteLoss { total: loss, components: format!("{losses:?}") });
        }

        let Some(scaler) = self.scaler.as_mut() else {
            model.backward(1.0)?;
            optimizer.step(model.parameters_mut());
            return Ok(StepOutcome { losses, loss, applied: true, scale: None });
        };

        let scale = scaler.scale();
        model.backward(scale)?;
        let params = model.parameters_mut();
        params.scale_grads(1.0 / scale);
        let found_inf = !params.grads_are_finite();
        if found_inf {
            debug!(scale, "non-finite gradients, skipping optimizer step");
        } else {
            optimizer.step(params);
        }
        scaler.update(found_inf);

        Ok(StepOutcome { losses, loss, applied: !found_inf, scale: Some(scaler.scale()) })
    }
}
