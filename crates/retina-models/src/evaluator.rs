//! IoU-based detection metrics.
//!
//! Metric vector, in order:
//! 0. mean best IoU of ground-truth objects with same-class detections
//! 1. mAP at IoU 0.5 (primary)
//! 2. mAP at IoU 0.75
//! 3. recall at IoU 0.5
//!
//! Average precision is the area under the all-point interpolated precision/recall curve,
//! as in the VOC 2010+ protocol. Objects marked difficult count neither as misses nor, when
//! matched, as false positives.

use crate::baseline::ImagePrediction;
use crate::boxes::BoundingBox;
use crate::voc::{VocDataset, VocSample};
use retina_abstraction::{Evaluator, ModelError, ModelResult};
use std::collections::HashMap;
use tracing::debug;

pub const METRIC_NAMES: [&str; 4] = ["mean_iou", "map_50", "map_75", "recall_50"];

#[derive(Debug, Clone)]
struct GroundTruth {
    class_id: usize,
    bbox: BoundingBox,
    difficult: bool,
}

#[derive(Debug, Clone)]
pub struct IouEvaluator {
    num_classes: usize,
    ground_truth: HashMap<String, Vec<GroundTruth>>,
}

impl IouEvaluator {
    #[must_use]
    pub fn new(samples: &[VocSample], num_classes: usize) -> Self {
        let ground_truth = samples
            .iter()
            .map(|s| {
                let objects = s
                    .objects
                    .iter()
                    .map(|o| GroundTruth { class_id: o.class_id, bbox: o.bbox, difficult: o.difficult })
                    .collect();
                (s.image_id.clone(), objects)
            })
            .collect();
        Self { num_classes, ground_truth }
    }

    /// Scores against the annotations of `dataset`.
    #[must_use]
    pub fn for_dataset(dataset: &VocDataset, num_classes: usize) -> Self {
        Self::new(dataset.samples(), num_classes)
    }

    fn mean_iou(&self, by_image: &HashMap<&str, &ImagePrediction>) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (image_id, objects) in &self.ground_truth {
            for gt in objects.iter().filter(|g| !g.difficult) {
                let best = by_image
                    .get(image_id.as_str())
                    .into_iter()
                    .flat_map(|p| &p.detections)
                    .filter(|d| d.class_id == gt.class_id)
                    .map(|d| d.bbox.iou(&gt.bbox))
                    .fold(0.0_f32, f32::max);
                total += f64::from(best);
                count += 1;
            }
        }
        if count == 0 { 0.0 } else { total / count as f64 }
    }

    /// Returns `(mAP, recall)` at `threshold`.
    fn map_at(&self, by_image: &HashMap<&str, &ImagePrediction>, threshold: f32) -> (f64, f64) {
        let mut aps = Vec::new();
        let mut matched_total = 0usize;
        let mut positives_total = 0usize;

        for class_id in 0..self.num_classes {
            let positives = self
                .ground_truth
                .values()
                .flatten()
                .filter(|g| g.class_id == class_id && !g.difficult)
                .count();
            if positives == 0 {
                continue;
            }

            let mut detections: Vec<(&str, f32, BoundingBox)> = by_image
                .iter()
                .flat_map(|(image_id, p)| {
                    p.detections
                        .iter()
                        .filter(move |d| d.class_id == class_id)
                        .map(move |d| (*image_id, d.score, d.bbox))
                })
                .collect();
            detections.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

            let mut used: HashMap<&str, Vec<bool>> = HashMap::new();
            let mut tp = Vec::with_capacity(detections.len());
            for (image_id, _, bbox) in &detections {
                let gts = self.ground_truth.get(*image_id).map_or(&[][..], Vec::as_slice);
                let flags = used.entry(*image_id).or_insert_with(|| vec![false; gts.len()]);

                let best = gts
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| g.class_id == class_id)
                    .map(|(i, g)| (i, g.bbox.iou(bbox)))
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match best {
                    Some((i, iou)) if iou >= threshold => {
                        if gts[i].difficult {
                            continue;
                        }
                        if flags[i] {
                            tp.push(false);
                        } else {
                            flags[i] = true;
                            tp.push(true);
                        }
                    }
                    _ => tp.push(false),
                }
            }

            let matched = tp.iter().filter(|t| **t).count();
            matched_total += matched;
            positives_total += positives;
            aps.push(average_precision(&tp, positives));
        }

        let map = if aps.is_empty() { 0.0 } else { aps.iter().sum::<f64>() / aps.len() as f64 };
        let recall = if positives_total == 0 { 0.0 } else { matched_total as f64 / positives_total as f64 };
        (map, recall)
    }
}

/// All-point interpolated AP from score-ordered true-positive flags.
fn average_precision(tp: &[bool], positives: usize) -> f64 {
    let mut recall = vec![0.0];
    let mut precision = vec![1.0];
    let mut hits = 0usize;
    for (i, hit) in tp.iter().enumerate() {
        if *hit {
            hits += 1;
        }
        recall.push(hits as f64 / positives as f64);
        precision.push(hits as f64 / (i + 1) as f64);
    }

    // Precision envelope, right to left.
    for i in (0..precision.len().saturating_sub(1)).rev() {
        precision[i] = precision[i].max(precision[i + 1]);
    }

    recall
        .windows(2)
        .zip(precision.iter().skip(1))
        .map(|(r, p)| (r[1] - r[0]) * p)
        .sum()
}

impl Evaluator for IouEvaluator {
    type Prediction = ImagePrediction;

    fn evaluate(&mut self, predictions: &[ImagePrediction]) -> ModelResult<Vec<f64>> {
        let mut by_image = HashMap::with_capacity(predictions.len());
        for prediction in predictions {
            if !self.ground_truth.contains_key(&prediction.image_id) {
                return Err(ModelError::EvaluationError(format!(
                    "prediction for unknown image {}",
                    prediction.image_id
                )));
            }
            by_image.insert(prediction.image_id.as_str(), prediction);
        }

        let mean_iou = self.mean_iou(&by_image);
        let (map_50, recall_50) = self.map_at(&by_image, 0.5);
        let (map_75, _) = self.map_at(&by_image, 0.75);

        debug!(mean_iou, map_50, map_75, recall_50, images = predictions.len(), "evaluation finished");
        Ok(vec![mean_iou, map_50, map_75, recall_50])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Detection;
    use crate::voc::VocObject;

    fn sample(id: &str, objects: Vec<(usize, BoundingBox, bool)>) -> VocSample {
        VocSample {
            image_id: id.to_string(),
            height: 10,
            width: 10,
            objects: objects
                .into_iter()
                .map(|(class_id, bbox, difficult)| VocObject { class_id, bbox, difficult })
                .collect(),
        }
    }

    fn prediction(id: &str, detections: Vec<(usize, f32, BoundingBox)>) -> ImagePrediction {
        ImagePrediction {
            image_id: id.to_string(),
            detections: detections
                .into_iter()
                .map(|(class_id, score, bbox)| Detection { class_id, score, bbox })
                .collect(),
        }
    }

    fn unit() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 0.5, 0.5)
    }

    #[test]
    fn test_perfect_predictions() {
        let samples = vec![sample("a", vec![(0, unit(), false)]), sample("b", vec![(1, unit(), false)])];
        let mut evaluator = IouEvaluator::new(&samples, 2);
        let metrics = evaluator
            .evaluate(&[prediction("a", vec![(0, 0.9, unit())]), prediction("b", vec![(1, 0.8, unit())])])
            .unwrap();
        assert_eq!(metrics.len(), METRIC_NAMES.len());
        for m in metrics {
            assert!((m - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_duplicate_and_shifted_detections() {
        let samples = vec![sample("a", vec![(0, unit(), false)])];
        let mut evaluator = IouEvaluator::new(&samples, 1);
        // IoU of the shifted box with the ground truth is 0.6: a hit at 0.5, a miss at 0.75.
        let shifted = BoundingBox::new(0.0, 0.0, 0.5, 0.3);
        let metrics = evaluator
            .evaluate(&[prediction("a", vec![(0, 0.9, shifted), (0, 0.5, shifted)])])
            .unwrap();
        assert!((metrics[0] - 0.6).abs() < 1e-6);
        // First detection hits, the duplicate is a false positive after full recall.
        assert!((metrics[1] - 1.0).abs() < 1e-9);
        assert!(metrics[2].abs() < 1e-9);
        assert!((metrics[3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_false_positive_ranked_first_halves_ap() {
        let samples = vec![sample("a", vec![(0, unit(), false)])];
        let mut evaluator = IouEvaluator::new(&samples, 1);
        let far = BoundingBox::new(0.6, 0.6, 0.9, 0.9);
        let metrics = evaluator.evaluate(&[prediction("a", vec![(0, 0.9, far), (0, 0.5, unit())])]).unwrap();
        assert!((metrics[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_difficult_objects_are_ignored() {
        let samples = vec![sample("a", vec![(0, unit(), false), (0, BoundingBox::new(0.6, 0.6, 0.9, 0.9), true)])];
        let mut evaluator = IouEvaluator::new(&samples, 1);
        let metrics = evaluator
            .evaluate(&[prediction(
                "a",
                vec![(0, 0.9, BoundingBox::new(0.6, 0.6, 0.9, 0.9)), (0, 0.5, unit())],
            )])
            .unwrap();
        assert!((metrics[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_ground_truth_and_unknown_image() {
        let mut evaluator = IouEvaluator::new(&[sample("a", vec![])], 3);
        assert_eq!(evaluator.evaluate(&[prediction("a", vec![])]).unwrap(), vec![0.0; 4]);
        assert!(matches!(
            evaluator.evaluate(&[prediction("zzz", vec![])]),
            Err(ModelError::EvaluationError(_))
        ));
    }
}
