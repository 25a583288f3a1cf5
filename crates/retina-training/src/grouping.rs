//! Aspect-ratio bucketing.
//!
//! Samples are ranked by `log2(width / height)` and the ranking is cut into `2^k` quantile
//! bins of near-equal size, so bucket occupancy stays balanced however skewed the ratio
//! distribution is.

use crate::error::TrainingResult;
use retina_abstraction::{DetectionDataset, ModelResult};
use tracing::{debug, warn};

/// Largest grouping factor honoured (`2^16` buckets).
pub const MAX_GROUP_FACTOR: u32 = 16;

/// Clamps `k` so that the number of buckets never exceeds the number of samples.
///
/// With `N` samples at most `floor(log2(N))` is kept, so every bucket receives at least
/// one sample. Empty and single-sample datasets always get a single bucket.
#[must_use]
pub fn effective_group_factor(k: u32, num_samples: usize) -> u32 {
    if num_samples <= 1 {
        return 0;
    }
    let max_k = usize::BITS - 1 - num_samples.leading_zeros();
    k.min(max_k).min(MAX_GROUP_FACTOR)
}

/// Assigns every sample a bucket id in `[0, 2^k)` from its aspect ratio.
///
/// `height_and_width` is queried once per sample. The result is indexed by sample.
pub fn create_aspect_ratio_groups<F>(
    num_samples: usize,
    k: u32,
    mut height_and_width: F,
) -> TrainingResult<Vec<usize>>
where
    F: FnMut(usize) -> ModelResult<(u32, u32)>,
{
    let effective = effective_group_factor(k, num_samples);
    if effective != k {
        warn!(
            requested = k,
            effective,
            num_samples,
            "aspect-ratio group factor clamped to the dataset size"
        );
    }

    let mut ratios = Vec::with_capacity(num_samples);
    for index in 0..num_samples {
        let (height, width) = height_and_width(index)?;
        ratios.push(log_aspect_ratio(height, width));
    }

    let num_groups = 1usize << effective;
    let mut order: Vec<usize> = (0..num_samples).collect();
    order.sort_by(|&a, &b| ratios[a].total_cmp(&ratios[b]).then(a.cmp(&b)));

    let mut group_ids = vec![0; num_samples];
    for (rank, &index) in order.iter().enumerate() {
        group_ids[index] = rank * num_groups / num_samples;
    }

    debug!(num_groups, counts = ?bucket_counts(&group_ids, num_groups), "aspect-ratio groups");
    Ok(group_ids)
}

/// Convenience wrapper reading sizes straight from a dataset.
pub fn group_dataset<D: DetectionDataset + ?Sized>(dataset: &D, k: u32) -> TrainingResult<Vec<usize>> {
    create_aspect_ratio_groups(dataset.len(), k, |index| dataset.height_and_width(index))
}

/// Number of samples per bucket.
#[must_use]
pub fn bucket_counts(group_ids: &[usize], num_groups: usize) -> Vec<usize> {
    let mut counts = vec![0; num_groups];
    for &group in group_ids {
        if group >= counts.len() {
            counts.resize(group + 1, 0);
        }
        counts[group] += 1;
    }
    counts
}

fn log_aspect_ratio(height: u32, width: u32) -> f64 {
    // Degenerate sizes are treated as one pixel so the ratio stays finite.
    let height = f64::from(height.max(1));
    let width = f64::from(width.max(1));
    (width / height).log2()
}
