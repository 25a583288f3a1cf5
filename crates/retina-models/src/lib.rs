//! Concrete training collaborators for Retina.
//!
//! - **VocDataset**: Pascal VOC annotation index (sizes and boxes, no image decoding)
//! - **BoxPriorDetector**: per-class box-prior baseline with analytic gradients
//! - **IouEvaluator**: mean IoU, mAP at 0.5 and 0.75, recall at 0.5

pub mod baseline;
pub mod boxes;
pub mod evaluator;
pub mod voc;

pub use baseline::{BoxPriorDetector, Detection, ImagePrediction, BBOX_REGRESSION_LOSS, CLASSIFICATION_LOSS};
pub use boxes::BoundingBox;
pub use evaluator::{IouEvaluator, METRIC_NAMES};
pub use voc::{parse_annotation, Split, VocBatch, VocDataset, VocObject, VocSample, VOC_CLASSES};
