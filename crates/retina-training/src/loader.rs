//! Prefetching batch collation.
//!
//! Collation runs on tokio's blocking pool, at most `workers` batches at a time, and
//! finished batches wait in a bounded queue. Batches are delivered in sampler order; the
//! driver simply awaits the next one.

use crate::error::{TrainingError, TrainingResult};
use retina_abstraction::{DetectionDataset, ModelResult};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Queued batches per worker.
const PREFETCH_FACTOR: usize = 2;

type BatchIndices = Box<dyn Iterator<Item = Vec<usize>> + Send>;

enum Source<D: DetectionDataset> {
    Inline {
        dataset: Arc<D>,
        batches: BatchIndices,
    },
    Pooled {
        rx: mpsc::Receiver<JoinHandle<ModelResult<D::Batch>>>,
        producer: JoinHandle<()>,
    },
}

pub struct PrefetchLoader<D: DetectionDataset + 'static> {
    source: Source<D>,
}

impl<D: DetectionDataset + 'static> PrefetchLoader<D> {
    /// Starts collating `batches` from `dataset`. With zero workers batches are collated
    /// on demand on the calling task.
    ///
    /// Must be called from within a tokio runtime when `workers > 0`.
    pub fn spawn<I>(dataset: Arc<D>, batches: I, workers: usize) -> Self
    where
        I: Iterator<Item = Vec<usize>> + Send + 'static,
    {
        if workers == 0 {
            return Self { source: Source::Inline { dataset, batches: Box::new(batches) } };
        }

        let (tx, rx) = mpsc::channel(workers * PREFETCH_FACTOR);
        let semaphore = Arc::new(Semaphore::new(workers));
        let producer = tokio::spawn(async move {
            for indices in batches {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let dataset = Arc::clone(&dataset);
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    dataset.collate(&indices)
                });
                if tx.send(handle).await.is_err() {
                    break;
                }
            }
        });

        Self { source: Source::Pooled { rx, producer } }
    }

    /// Sequential single-sample batches over the whole dataset, as used for evaluation.
    pub fn sequential(dataset: Arc<D>, workers: usize) -> Self {
        let len = dataset.len();
        Self::spawn(dataset, (0..len).map(|index| vec![index]), workers)
    }

    /// Waits for the next collated batch. `None` once every batch has been delivered.
    pub async fn next_batch(&mut self) -> Option<TrainingResult<D::Batch>> {
        match &mut self.source {
            Source::Inline { dataset, batches } => {
                let indices = batches.next()?;
                Some(dataset.collate(&indices).map_err(TrainingError::from))
            }
            Source::Pooled { rx, .. } => {
                let handle = rx.recv().await?;
                Some(match handle.await {
                    Ok(result) => result.map_err(TrainingError::from),
                    Err(e) => Err(TrainingError::Loader(format!("collation worker failed: {e}"))),
                })
            }
        }
    }
}

impl<D: DetectionDataset + 'static> Drop for PrefetchLoader<D> {
    fn drop(&mut self) {
        if let Source::Pooled { producer, .. } = &self.source {
            producer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retina_abstraction::ModelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Numbers {
        len: usize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Numbers {
        fn new(len: usize) -> Self {
            Self { len, in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) }
        }
    }

    impl DetectionDataset for Numbers {
        type Batch = Vec<usize>;

        fn len(&self) -> usize {
            self.len
        }

        fn height_and_width(&self, _index: usize) -> ModelResult<(u32, u32)> {
            Ok((1, 1))
        }

        fn collate(&self, indices: &[usize]) -> ModelResult<Vec<usize>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if indices.iter().any(|&i| i >= self.len) {
                return Err(ModelError::DatasetError(format!("index out of range: {indices:?}")));
            }
            Ok(indices.to_vec())
        }
    }

    async fn collect(mut loader: PrefetchLoader<Numbers>) -> Vec<TrainingResult<Vec<usize>>> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch().await {
            out.push(batch);
        }
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pooled_loader_preserves_order_and_bounds_workers() {
        let dataset = Arc::new(Numbers::new(40));
        let batches: Vec<Vec<usize>> = (0..40).collect::<Vec<_>>().chunks(3).map(<[usize]>::to_vec).collect();
        let expected = batches.clone();

        let loader = PrefetchLoader::spawn(Arc::clone(&dataset), batches.into_iter(), 3);
        let got: Vec<Vec<usize>> = collect(loader).await.into_iter().map(Result::unwrap).collect();

        assert_eq!(got, expected);
        assert!(dataset.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_inline_loader_without_workers() {
        let dataset = Arc::new(Numbers::new(3));
        let got = collect(PrefetchLoader::sequential(dataset, 0)).await;
        let got: Vec<Vec<usize>> = got.into_iter().map(Result::unwrap).collect();
        assert_eq!(got, vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_collation_error_is_surfaced() {
        let dataset = Arc::new(Numbers::new(2));
        let batches = vec![vec![0], vec![7]];
        let got = collect(PrefetchLoader::spawn(dataset, batches.into_iter(), 1)).await;
        assert!(got[0].is_ok());
        assert!(matches!(got[1], Err(TrainingError::Model(ModelError::DatasetError(_)))));
    }
}
