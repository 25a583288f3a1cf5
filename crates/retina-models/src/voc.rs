//! Pascal VOC annotation index.
//!
//! Expects the standard devkit layout under the data root:
//!
//! ```text
//! <root>/VOCdevkit/VOC2012/
//!   ImageSets/Main/{train,val}.txt
//!   Annotations/<image_id>.xml
//! ```
//!
//! Only annotations are read. Sizes come from each file's `<size>` element, so aspect-ratio
//! grouping never touches image data.

use crate::boxes::BoundingBox;
use once_cell::sync::Lazy;
use regex::Regex;
use retina_abstraction::{DetectionDataset, ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEVKIT_DIR: &str = "VOCdevkit";
pub const YEAR_DIR: &str = "VOC2012";

/// The twenty VOC categories; a class id is the position in this list.
pub const VOC_CLASSES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

static SIZE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<size>(.*?)</size>").expect("size regex should be valid"));

static OBJECT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<object>(.*?)</object>").expect("object regex should be valid"));

/// An element with text content only, e.g. `<xmin>48</xmin>`.
static LEAF_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(\w+)>\s*([^<]*?)\s*</(\w+)>").expect("leaf element regex should be valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
}

impl Split {
    #[must_use]
    pub fn list_file(self) -> &'static str {
        match self {
            Self::Train => "train.txt",
            Self::Val => "val.txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocObject {
    pub class_id: usize,
    /// Normalized to the image size.
    pub bbox: BoundingBox,
    pub difficult: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocSample {
    pub image_id: String,
    pub height: u32,
    pub width: u32,
    pub objects: Vec<VocObject>,
}

/// Collated annotations of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct VocBatch {
    pub samples: Vec<VocSample>,
}

/// One split of a VOC devkit, indexed from its annotation files.
#[derive(Debug, Clone)]
pub struct VocDataset {
    year_root: PathBuf,
    split: Split,
    samples: Vec<VocSample>,
}

impl VocDataset {
    /// Reads the split's image list and parses every referenced annotation.
    ///
    /// Objects whose class id is `>= num_classes` are dropped.
    pub fn open(data_root: &Path, split: Split, num_classes: usize) -> ModelResult<Self> {
        let year_root = data_root.join(DEVKIT_DIR).join(YEAR_DIR);
        let list = year_root.join("ImageSets").join("Main").join(split.list_file());
        let ids = std::fs::read_to_string(&list)
            .map_err(|e| ModelError::DatasetError(format!("failed to read {}: {e}", list.display())))?;

        let mut samples = Vec::new();
        for image_id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let path = year_root.join("Annotations").join(format!("{image_id}.xml"));
            let xml = std::fs::read_to_string(&path)
                .map_err(|e| ModelError::DatasetError(format!("failed to read {}: {e}", path.display())))?;
            samples.push(parse_annotation(image_id, &xml, num_classes)?);
        }

        info!(
            split = ?split,
            images = samples.len(),
            objects = samples.iter().map(|s| s.objects.len()).sum::<usize>(),
            "VOC split indexed"
        );
        Ok(Self { year_root, split, samples })
    }

    #[must_use]
    pub fn split(&self) -> Split {
        self.split
    }

    #[must_use]
    pub fn year_root(&self) -> &Path {
        &self.year_root
    }

    #[must_use]
    pub fn samples(&self) -> &[VocSample] {
        &self.samples
    }

    fn sample(&self, index: usize) -> ModelResult<&VocSample> {
        self.samples.get(index).ok_or_else(|| {
            ModelError::DatasetError(format!("sample index {index} out of range ({} samples)", self.samples.len()))
        })
    }
}

impl DetectionDataset for VocDataset {
    type Batch = VocBatch;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn height_and_width(&self, index: usize) -> ModelResult<(u32, u32)> {
        let sample = self.sample(index)?;
        Ok((sample.height, sample.width))
    }

    fn collate(&self, indices: &[usize]) -> ModelResult<VocBatch> {
        let samples = indices
            .iter()
            .map(|&index| self.sample(index).cloned())
            .collect::<ModelResult<Vec<_>>>()?;
        Ok(VocBatch { samples })
    }
}

fn leaf_values(block: &str) -> HashMap<&str, &str> {
    let mut values = HashMap::new();
    for cap in LEAF_ELEMENT.captures_iter(block) {
        let (Some(open), Some(text), Some(close)) = (cap.get(1), cap.get(2), cap.get(3)) else {
            continue;
        };
        if open.as_str() == close.as_str() {
            // The first occurrence wins: an object's own box precedes any part boxes.
            values.entry(open.as_str()).or_insert(text.as_str());
        }
    }
    values
}

fn required<T: std::str::FromStr>(values: &HashMap<&str, &str>, tag: &str, image_id: &str) -> ModelResult<T> {
    let raw = values
        .get(tag)
        .ok_or_else(|| ModelError::DatasetError(format!("{image_id}: missing <{tag}>")))?;
    raw.parse()
        .map_err(|_| ModelError::DatasetError(format!("{image_id}: invalid <{tag}> value {raw:?}")))
}

/// Parses one annotation document.
pub fn parse_annotation(image_id: &str, xml: &str, num_classes: usize) -> ModelResult<VocSample> {
    let size = SIZE_BLOCK
        .captures(xml)
        .and_then(|cap| cap.get(1))
        .ok_or_else(|| ModelError::DatasetError(format!("{image_id}: missing <size>")))?;
    let size = leaf_values(size.as_str());
    let width: u32 = required(&size, "width", image_id)?;
    let height: u32 = required(&size, "height", image_id)?;
    if width == 0 || height == 0 {
        return Err(ModelError::DatasetError(format!("{image_id}: empty image size {width}x{height}")));
    }

    let mut objects = Vec::new();
    for cap in OBJECT_BLOCK.captures_iter(xml) {
        let Some(block) = cap.get(1) else { continue };
        let values = leaf_values(block.as_str());

        let name: String = required(&values, "name", image_id)?;
        let class_id = VOC_CLASSES
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| ModelError::DatasetError(format!("{image_id}: unknown class {name:?}")))?;
        if class_id >= num_classes {
            debug!(image_id, class = %name, num_classes, "object class outside the configured range");
            continue;
        }

        let (w, h) = (width as f32, height as f32);
        let xmin: f32 = required(&values, "xmin", image_id)?;
        let ymin: f32 = required(&values, "ymin", image_id)?;
        let xmax: f32 = required(&values, "xmax", image_id)?;
        let ymax: f32 = required(&values, "ymax", image_id)?;
        let bbox = BoundingBox::new(
            (xmin / w).clamp(0.0, 1.0),
            (ymin / h).clamp(0.0, 1.0),
            (xmax / w).clamp(0.0, 1.0),
            (ymax / h).clamp(0.0, 1.0),
        );
        if bbox.area() <= 0.0 {
            warn!(image_id, class = %name, "skipping degenerate box");
            continue;
        }

        let difficult = values.get("difficult").is_some_and(|v| *v == "1");
        objects.push(VocObject { class_id, bbox, difficult });
    }

    Ok(VocSample { image_id: image_id.to_string(), height, width, objects })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOTATION: &str = r"
<annotation>
    <folder>VOC2012</folder>
    <filename>2008_000008.jpg</filename>
    <size>
        <width>500</width>
        <height>442</height>
        <depth>3</depth>
    </size>
    <object>
        <name>horse</name>
        <difficult>0</difficult>
        <bndbox>
            <xmin>53</xmin>
            <ymin>87</ymin>
            <xmax>471</xmax>
            <ymax>420</ymax>
        </bndbox>
    </object>
    <object>
        <name>person</name>
        <difficult>1</difficult>
        <bndbox>
            <xmin>158</xmin>
            <ymin>44</ymin>
            <xmax>289</xmax>
            <ymax>167</ymax>
        </bndbox>
        <part>
            <name>head</name>
            <bndbox>
                <xmin>169</xmin>
                <ymin>50</ymin>
                <xmax>200</xmax>
                <ymax>80</ymax>
            </bndbox>
        </part>
    </object>
</annotation>";

    #[test]
    fn test_parse_annotation() {
        let sample = parse_annotation("2008_000008", ANNOTATION, 20).unwrap();
        assert_eq!((sample.height, sample.width), (442, 500));
        assert_eq!(sample.objects.len(), 2);

        let horse = &sample.objects[0];
        assert_eq!(horse.class_id, 12);
        assert!(!horse.difficult);
        assert!((horse.bbox.xmin - 53.0 / 500.0).abs() < 1e-6);
        assert!((horse.bbox.ymax - 420.0 / 442.0).abs() < 1e-6);

        let person = &sample.objects[1];
        assert_eq!(person.class_id, 14);
        assert!(person.difficult);
        // The object's box, not the head part's.
        assert!((person.bbox.xmin - 158.0 / 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_classes_outside_range_are_dropped() {
        let sample = parse_annotation("x", ANNOTATION, 13).unwrap();
        assert_eq!(sample.objects.len(), 1);
        assert_eq!(sample.objects[0].class_id, 12);
    }

    #[test]
    fn test_missing_size_and_unknown_class_fail() {
        assert!(parse_annotation("x", "<annotation></annotation>", 20).is_err());

        let unknown = ANNOTATION.replace("<name>horse</name>", "<name>unicorn</name>");
        let err = parse_annotation("x", &unknown, 20).unwrap_err();
        assert!(matches!(err, ModelError::DatasetError(msg) if msg.contains("unicorn")));
    }
}
