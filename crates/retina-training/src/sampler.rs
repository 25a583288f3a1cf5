//! Bucket-homogeneous batch sampling.

use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Draws the sample order for one epoch.
///
/// With a seed the order depends only on `(seed, epoch)`, so a resumed run sees the same
/// permutation for the same epoch.
#[must_use]
pub fn epoch_permutation(num_samples: usize, seed: Option<u64>, epoch: u32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_samples).collect();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(epoch))),
        None => StdRng::from_entropy(),
    };
    order.shuffle(&mut rng);
    order
}

enum Phase {
    Main,
    Remainder(std::vec::IntoIter<usize>),
    Done,
}

/// Groups a sample order into batches whose members share a bucket.
///
/// Indices are buffered per bucket and a buffer is emitted as soon as it holds
/// `batch_size` indices. Once the order is exhausted the leftovers of all buckets are
/// pooled, longest buffer first, and re-chunked; only those final batches may mix buckets.
/// Every index of the order is emitted exactly once.
///
/// The sampler is single-use: build a new one from a fresh permutation each epoch.
pub struct GroupedBatchSampler {
    order: std::vec::IntoIter<usize>,
    group_ids: Arc<[usize]>,
    batch_size: usize,
    buffers: Vec<Vec<usize>>,
    phase: Phase,
    num_batches: usize,
}

impl GroupedBatchSampler {
    pub fn new(
        order: impl IntoIterator<Item = usize>,
        group_ids: Arc<[usize]>,
        batch_size: usize,
    ) -> TrainingResult<Self> {
        if batch_size == 0 {
            return Err(TrainingError::InvalidConfig(
                "batch_size should be a positive integer, got 0".to_string(),
            ));
        }

        let order: Vec<usize> = order.into_iter().collect();
        let num_groups = group_ids.iter().max().map_or(0, |&g| g + 1);
        let mut counts = vec![0usize; num_groups];
        for &index in &order {
            let group = *group_ids.get(index).ok_or_else(|| {
                TrainingError::InvalidConfig(format!(
                    "sample index {index} has no group id ({} known)",
                    group_ids.len()
                ))
            })?;
            counts[group] += 1;
        }

        let full: usize = counts.iter().map(|c| c / batch_size).sum();
        let leftover: usize = counts.iter().map(|c| c % batch_size).sum();
        let num_batches = full + leftover.div_ceil(batch_size);

        Ok(Self {
            order: order.into_iter(),
            group_ids,
            batch_size,
            buffers: vec![Vec::with_capacity(batch_size); num_groups],
            phase: Phase::Main,
            num_batches,
        })
    }

    /// Plain shuffled batching: every index falls in one bucket, so batches are
    /// consecutive chunks of the order.
    pub fn ungrouped(order: Vec<usize>, batch_size: usize) -> TrainingResult<Self> {
        let group_ids: Arc<[usize]> = vec![0; order.iter().max().map_or(0, |&m| m + 1)].into();
        Self::new(order, group_ids, batch_size)
    }

    /// Exact number of batches this sampler will emit in total.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// True once the pooled remainder phase has started; batches returned from then on
    /// may mix buckets.
    #[must_use]
    pub fn in_remainder(&self) -> bool {
        !matches!(self.phase, Phase::Main)
    }

    fn start_remainder(&mut self) -> std::vec::IntoIter<usize> {
        let mut leftovers: Vec<Vec<usize>> =
            self.buffers.drain(..).filter(|buffer| !buffer.is_empty()).collect();
        // Stable sort keeps bucket order among equal lengths.
        leftovers.sort_by(|a, b| b.len().cmp(&a.len()));
        leftovers.into_iter().flatten().collect::<Vec<_>>().into_iter()
    }
}

impl Iterator for GroupedBatchSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Main => {
                    if let Some(index) = self.order.next() {
                        let group = self.group_ids[index];
                        let buffer = &mut self.buffers[group];
                        buffer.push(index);
                        if buffer.len() == self.batch_size {
                            return Some(std::mem::replace(
                                buffer,
                                Vec::with_capacity(self.batch_size),
                            ));
                        }
                    } else {
                        let pooled = self.start_remainder();
                        self.phase = Phase::Remainder(pooled);
                    }
                }
                Phase::Remainder(ref mut pooled) => {
                    let batch: Vec<usize> = pooled.take(self.batch_size).collect();
                    if batch.is_empty() {
                        self.phase = Phase::Done;
                        return None;
                    }
                    return Some(batch);
                }
                Phase::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn drain(mut sampler: GroupedBatchSampler) -> Vec<(Vec<usize>, bool)> {
        let mut out = Vec::new();
        while let Some(batch) = sampler.next() {
            out.push((batch, sampler.in_remainder()));
        }
        out
    }

    fn assert_partition(batches: &[(Vec<usize>, bool)], n: usize) {
        let mut seen = HashSet::new();
        for (batch, _) in batches {
            for &index in batch {
                assert!(seen.insert(index), "index {index} emitted twice");
            }
        }
        assert_eq!(seen.len(), n);
        assert!(seen.iter().all(|&i| i < n));
    }

    #[test]
    fn test_ten_samples_two_buckets_batch_four() {
        let group_ids: Arc<[usize]> = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1].into();
        let order: Vec<usize> = (0..10).collect();
        let sampler = GroupedBatchSampler::new(order, group_ids.clone(), 4).unwrap();
        assert_eq!(sampler.num_batches(), 3);

        let batches = drain(sampler);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], (vec![0, 1, 2, 3], false));
        assert_eq!(batches[1], (vec![5, 6, 7, 8], false));
        // One leftover per bucket, pooled into a final short batch.
        assert_eq!(batches[2], (vec![4, 9], true));
        assert_partition(&batches, 10);
    }

    #[test]
    fn test_main_phase_batches_are_homogeneous() {
        let group_ids: Arc<[usize]> = (0..103).map(|i| (i * 31) % 5).collect::<Vec<usize>>().into();
        for seed in 0..8 {
            let order = epoch_permutation(103, Some(seed), 0);
            let sampler = GroupedBatchSampler::new(order, group_ids.clone(), 6).unwrap();
            let expected = sampler.num_batches();
            let batches = drain(sampler);
            assert_eq!(batches.len(), expected);
            assert_partition(&batches, 103);
            for (batch, remainder) in &batches {
                assert!(batch.len() <= 6);
                if !remainder {
                    assert_eq!(batch.len(), 6);
                    let group = group_ids[batch[0]];
                    assert!(batch.iter().all(|&i| group_ids[i] == group));
                }
            }
        }
    }

    #[test]
    fn test_remainder_pools_longest_buffers_first() {
        // Bucket 0 leaves 1 index, bucket 1 leaves 3, bucket 2 leaves 2.
        let group_ids: Arc<[usize]> = vec![0, 1, 1, 1, 2, 2].into();
        let order: Vec<usize> = (0..6).collect();
        let batches: Vec<Vec<usize>> =
            GroupedBatchSampler::new(order, group_ids, 4).unwrap().collect();
        assert_eq!(batches, vec![vec![1, 2, 3, 4], vec![5, 0]]);
    }

    #[test]
    fn test_unit_batch_size_yields_singletons() {
        let group_ids: Arc<[usize]> = vec![0, 1, 0, 1].into();
        let sampler = GroupedBatchSampler::new(vec![3, 1, 0, 2], group_ids, 1).unwrap();
        assert_eq!(sampler.batch_size(), 1);
        let batches: Vec<Vec<usize>> = sampler.collect();
        assert_eq!(batches, vec![vec![3], vec![1], vec![0], vec![2]]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let group_ids: Arc<[usize]> = vec![0].into();
        assert!(GroupedBatchSampler::new(vec![0], group_ids, 0).is_err());
    }

    #[test]
    fn test_unknown_index_rejected() {
        let group_ids: Arc<[usize]> = vec![0, 0].into();
        assert!(GroupedBatchSampler::new(vec![0, 5], group_ids, 2).is_err());
    }

    #[test]
    fn test_empty_order() {
        let group_ids: Arc<[usize]> = Vec::new().into();
        let sampler = GroupedBatchSampler::new(Vec::new(), group_ids, 4).unwrap();
        assert_eq!(sampler.num_batches(), 0);
        assert_eq!(sampler.count(), 0);
    }

    #[test]
    fn test_ungrouped_chunks_in_order() {
        let batches: Vec<Vec<usize>> =
            GroupedBatchSampler::ungrouped(vec![4, 2, 0, 1, 3], 2).unwrap().collect();
        assert_eq!(batches, vec![vec![4, 2], vec![0, 1], vec![3]]);
    }

    #[test]
    fn test_seeded_permutation_is_reproducible() {
        let a = epoch_permutation(50, Some(7), 3);
        let b = epoch_permutation(50, Some(7), 3);
        let c = epoch_permutation(50, Some(7), 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }
}
