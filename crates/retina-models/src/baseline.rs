//! Box-prior baseline detector.
//!
//! A deliberately small trainable model: one class logit and one prior box per class.
//! Training fits the logits to the class frequencies (softmax cross-entropy) and each prior
//! to the mean box of its class (squared error in center/size form). At evaluation time
//! every class predicts its prior box scored by its softmax probability.

use crate::boxes::BoundingBox;
use crate::voc::VocBatch;
use retina_abstraction::{DetectionModel, LossMap, ModelError, ModelResult, Parameters};
use serde::{Deserialize, Serialize};

pub const CLASSIFICATION_LOSS: &str = "classification";
pub const BBOX_REGRESSION_LOSS: &str = "bbox_regression";

/// Initial prior: a centered box covering half of each dimension.
const INITIAL_PRIOR: [f32; 4] = [0.5, 0.5, 0.5, 0.5];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Detections for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrediction {
    pub image_id: String,
    pub detections: Vec<Detection>,
}

/// Parameter layout: `num_classes` logits, then `[cx, cy, w, h]` per class.
#[derive(Debug, Clone)]
pub struct BoxPriorDetector {
    num_classes: usize,
    params: Parameters,
    /// Unscaled gradient of the last training forward pass.
    pending_grads: Option<Vec<f32>>,
    score_threshold: f32,
}

impl BoxPriorDetector {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        let mut values = vec![0.0; num_classes];
        for _ in 0..num_classes {
            values.extend_from_slice(&INITIAL_PRIOR);
        }
        Self { num_classes, params: Parameters::new(values), pending_grads: None, score_threshold: 0.0 }
    }

    /// Drops detections scoring below `threshold` at evaluation time.
    #[must_use]
    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn prior_offset(&self, class_id: usize) -> usize {
        self.num_classes + class_id * 4
    }

    fn prior(&self, class_id: usize) -> [f32; 4] {
        let at = self.prior_offset(class_id);
        let v = &self.params.values;
        [v[at], v[at + 1], v[at + 2], v[at + 3]]
    }

    fn class_probabilities(&self) -> Vec<f32> {
        let logits = &self.params.values[..self.num_classes];
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        exp.into_iter().map(|e| e / sum).collect()
    }
}

impl DetectionModel for BoxPriorDetector {
    type Batch = VocBatch;
    type Prediction = ImagePrediction;

    fn forward_train(&mut self, batch: &VocBatch) -> ModelResult<LossMap> {
        let probs = self.class_probabilities();
        let mut grads = vec![0.0; self.params.len()];
        let mut cls_loss = 0.0_f32;
        let mut box_loss = 0.0_f32;

        let objects: Vec<_> = batch.samples.iter().flat_map(|s| &s.objects).collect();
        let n = objects.len().max(1) as f32;
        for object in &objects {
            if object.class_id >= self.num_classes {
                return Err(ModelError::ForwardError(format!(
                    "class id {} outside {} classes",
                    object.class_id, self.num_classes
                )));
            }

            cls_loss -= probs[object.class_id].max(f32::MIN_POSITIVE).ln();
            for (k, p) in probs.iter().enumerate() {
                let target = if k == object.class_id { 1.0 } else { 0.0 };
                grads[k] += (p - target) / n;
            }

            let at = self.prior_offset(object.class_id);
            for (i, (prior, target)) in self.prior(object.class_id).iter().zip(object.bbox.center_size()).enumerate() {
                let diff = prior - target;
                box_loss += 0.5 * diff * diff;
                grads[at + i] += diff / n;
            }
        }

        self.pending_grads = Some(grads);
        Ok(LossMap::from([
            (CLASSIFICATION_LOSS.to_string(), cls_loss / n),
            (BBOX_REGRESSION_LOSS.to_string(), box_loss / n),
        ]))
    }

    fn backward(&mut self, loss_scale: f32) -> ModelResult<()> {
        let grads = self
            .pending_grads
            .take()
            .ok_or_else(|| ModelError::BackwardError("backward called without a training forward pass".to_string()))?;
        for (acc, g) in self.params.grads.iter_mut().zip(grads) {
            *acc += loss_scale * g;
        }
        Ok(())
    }

    fn forward_eval(&mut self, batch: &VocBatch) -> ModelResult<Vec<ImagePrediction>> {
        let probs = self.class_probabilities();
        let detections: Vec<Detection> = probs
            .iter()
            .enumerate()
            .filter(|(_, score)| **score >= self.score_threshold)
            .map(|(class_id, &score)| {
                let [cx, cy, w, h] = self.prior(class_id);
                Detection { class_id, score, bbox: BoundingBox::from_center(cx, cy, w, h) }
            })
            .collect();

        Ok(batch
            .samples
            .iter()
            .map(|s| ImagePrediction { image_id: s.image_id.clone(), detections: detections.clone() })
            .collect())
    }

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voc::{VocObject, VocSample};
    use retina_abstraction::total_loss;

    fn batch(objects: Vec<(usize, BoundingBox)>) -> VocBatch {
        VocBatch {
            samples: vec![VocSample {
                image_id: "img".to_string(),
                height: 100,
                width: 100,
                objects: objects
                    .into_iter()
                    .map(|(class_id, bbox)| VocObject { class_id, bbox, difficult: false })
                    .collect(),
            }],
        }
    }

    fn sgd_step(model: &mut BoxPriorDetector, lr: f32) {
        let params = model.parameters_mut();
        for (v, g) in params.values.iter_mut().zip(&params.grads) {
            *v -= lr * g;
        }
    }

    #[test]
    fn test_losses_and_gradient_scaling() {
        let mut model = BoxPriorDetector::new(3);
        let target = BoundingBox::from_center(0.5, 0.5, 0.5, 0.5);
        let losses = model.forward_train(&batch(vec![(1, target)])).unwrap();
        // Uniform logits over 3 classes.
        assert!((losses[CLASSIFICATION_LOSS] - 3.0_f32.ln()).abs() < 1e-5);
        assert!(losses[BBOX_REGRESSION_LOSS].abs() < 1e-6);

        model.parameters_mut().zero_grad();
        model.backward(8.0).unwrap();
        let g = &model.parameters().grads;
        assert!((g[1] - 8.0 * (1.0 / 3.0 - 1.0)).abs() < 1e-4);
        assert!((g[0] - 8.0 / 3.0).abs() < 1e-4);

        assert!(matches!(model.backward(1.0), Err(ModelError::BackwardError(_))));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = BoxPriorDetector::new(2);
        let data = batch(vec![
            (0, BoundingBox::new(0.1, 0.1, 0.3, 0.5)),
            (0, BoundingBox::new(0.2, 0.1, 0.4, 0.5)),
            (1, BoundingBox::new(0.5, 0.5, 0.9, 0.7)),
        ]);

        let first = total_loss(&model.forward_train(&data).unwrap());
        let mut last = first;
        for _ in 0..200 {
            model.parameters_mut().zero_grad();
            last = total_loss(&model.forward_train(&data).unwrap());
            model.backward(1.0).unwrap();
            sgd_step(&mut model, 0.5);
        }
        assert!(last < first);

        let preds = model.forward_eval(&data).unwrap();
        assert_eq!(preds.len(), 1);
        let best = preds[0].detections.iter().max_by(|a, b| a.score.total_cmp(&b.score)).unwrap();
        assert_eq!(best.class_id, 0);
        assert!(best.bbox.iou(&BoundingBox::new(0.15, 0.1, 0.35, 0.5)) > 0.8);
    }

    #[test]
    fn test_score_threshold_filters_detections() {
        let mut model = BoxPriorDetector::new(4).with_score_threshold(0.3);
        let preds = model.forward_eval(&batch(vec![])).unwrap();
        assert!(preds[0].detections.is_empty());
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut model = BoxPriorDetector::new(2);
        model.parameters_mut().values[0] = 0.75;
        let state = model.state_dict();

        let mut restored = BoxPriorDetector::new(2);
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored.parameters().values, model.parameters().values);
        assert!(BoxPriorDetector::new(3).load_state_dict(&state).is_err());
    }
}
