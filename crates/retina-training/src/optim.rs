use crate::config::OptimizerConfig;
use crate::error::TrainingResult;
use retina_abstraction::Parameters;
use serde::{Deserialize, Serialize};

/// Applies accumulated gradients to parameters.
pub trait Optimizer: Send {
    /// One update from `params.grads`. Gradients are left untouched.
    fn step(&mut self, params: &mut Parameters);

    /// Learning rate used by the next `step`.
    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    fn state_dict(&self) -> TrainingResult<serde_json::Value>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainingResult<()>;
}

/// Serializable SGD state including momentum buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgdState {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    #[serde(default)]
    pub momentum_buffer: Option<Vec<f32>>,
}

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    state: SgdState,
}

impl Sgd {
    #[must_use]
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            state: SgdState {
                lr: config.lr,
                momentum: config.momentum,
                weight_decay: config.weight_decay,
                momentum_buffer: None,
            },
        }
    }

    #[must_use]
    pub fn state(&self) -> &SgdState {
        &self.state
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut Parameters) {
        let lr = self.state.lr as f32;
        let momentum = self.state.momentum as f32;
        let weight_decay = self.state.weight_decay as f32;

        let buffer = if momentum == 0.0 {
            None
        } else {
            // A buffer from a differently-sized model is discarded rather than misapplied.
            if self.state.momentum_buffer.as_ref().is_some_and(|b| b.len() != params.len()) {
                self.state.momentum_buffer = None;
            }
            Some(&mut self.state.momentum_buffer)
        };

        match buffer {
            None => {
                for (value, grad) in params.values.iter_mut().zip(&params.grads) {
                    *value -= lr * (grad + weight_decay * *value);
                }
            }
            Some(slot) => {
                let fresh = slot.is_none();
                let buf = slot.get_or_insert_with(|| vec![0.0; params.values.len()]);
                for ((value, grad), b) in params.values.iter_mut().zip(&params.grads).zip(buf.iter_mut()) {
                    let d_p = grad + weight_decay * *value;
                    *b = if fresh { d_p } else { momentum * *b + d_p };
                    *value -= lr * *b;
                }
            }
        }
    }

    fn lr(&self) -> f64 {
        self.state.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.state.lr = lr;
    }

    fn state_dict(&self) -> TrainingResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainingResult<()> {
        self.state = serde_json::from_value(state.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(momentum: f64, weight_decay: f64) -> OptimizerConfig {
        OptimizerConfig { lr: 0.1, momentum, weight_decay }
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut sgd = Sgd::new(&config(0.0, 0.0));
        let mut params = Parameters::new(vec![1.0, -1.0]);
        params.grads = vec![0.5, -0.5];
        sgd.step(&mut params);
        assert!((params.values[0] - 0.95).abs() < 1e-6);
        assert!((params.values[1] + 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut sgd = Sgd::new(&config(0.9, 0.0));
        let mut params = Parameters::new(vec![0.0]);
        params.grads = vec![1.0];
        sgd.step(&mut params);
        assert!((params.values[0] + 0.1).abs() < 1e-6);
        sgd.step(&mut params);
        // buf = 0.9 * 1 + 1 = 1.9
        assert!((params.values[0] + 0.29).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let mut sgd = Sgd::new(&config(0.0, 0.5));
        let mut params = Parameters::new(vec![2.0]);
        sgd.step(&mut params);
        assert!((params.values[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut sgd = Sgd::new(&config(0.9, 0.0005));
        let mut params = Parameters::new(vec![1.0, 2.0]);
        params.grads = vec![0.1, 0.2];
        sgd.step(&mut params);
        sgd.set_lr(0.02);

        let state = sgd.state_dict().unwrap();
        let mut restored = Sgd::new(&OptimizerConfig::default());
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored.state(), sgd.state());
    }

    #[test]
    fn test_load_state_dict_rejects_garbage() {
        let mut sgd = Sgd::new(&OptimizerConfig::default());
        assert!(sgd.load_state_dict(&serde_json::json!({"lr": "fast"})).is_err());
    }
}
