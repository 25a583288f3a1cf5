//! Epoch loop tying sampling, optimization, evaluation and persistence together.

use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::grouping::group_dataset;
use crate::layout::OutputLayout;
use crate::loader::PrefetchLoader;
use crate::metrics::{MetricsLogger, MetricsRecord};
use crate::optim::{Optimizer, Sgd};
use crate::precision::MixedPrecision;
use crate::progress::{ProgressEvent, ProgressSink, TracingProgressSink};
use crate::report::{History, Reporter};
use crate::sampler::{epoch_permutation, GroupedBatchSampler};
use crate::scheduler::{LrScheduler, StepLr, Warmup};
use chrono::Local;
use retina_abstraction::{DetectionDataset, DetectionModel, Evaluator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What a finished run leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_epoch: u32,
    pub epochs_completed: u32,
    pub last_checkpoint: Option<PathBuf>,
    pub results_path: PathBuf,
    pub history: History,
}

struct EpochStats {
    mean_loss: f64,
    lr: f64,
}

/// Runs epochs `[start_epoch, epochs)` over a model and its datasets.
///
/// Each epoch trains over grouped batches (with a linear warmup during epoch 0), steps the
/// learning-rate schedule, evaluates on the validation set, appends a metrics line and
/// writes a checkpoint. Any model, evaluator or I/O error aborts the run; checkpoints of
/// completed epochs remain on disk.
pub struct TrainingLoop<M, D, E>
where
    D: DetectionDataset + 'static,
    M: DetectionModel<Batch = D::Batch>,
    E: Evaluator<Prediction = M::Prediction>,
{
    config: TrainingConfig,
    model: M,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    precision: MixedPrecision,
    train_set: Arc<D>,
    val_set: Arc<D>,
    group_ids: Option<Arc<[usize]>>,
    evaluator: E,
    checkpoints: CheckpointManager,
    metrics: MetricsLogger,
    progress: Arc<dyn ProgressSink>,
    reporter: Option<Box<dyn Reporter>>,
    start_epoch: u32,
    resumed_from: Option<PathBuf>,
}

impl<M, D, E> TrainingLoop<M, D, E>
where
    D: DetectionDataset + 'static,
    M: DetectionModel<Batch = D::Batch>,
    E: Evaluator<Prediction = M::Prediction>,
{
    /// Validates `config`, prepares the output directory, computes aspect-ratio groups and
    /// adopts the checkpoint named by `config.resume`.
    ///
    /// A checkpoint is adopted completely or not at all: on any resume error no loop is
    /// returned.
    pub fn new(config: TrainingConfig, model: M, train_set: Arc<D>, val_set: Arc<D>, evaluator: E) -> TrainingResult<Self> {
        config.validate()?;

        let layout = OutputLayout::new(config.output_dir.clone());
        layout.ensure_dirs()?;

        let group_ids: Option<Arc<[usize]>> = match config.grouping_factor() {
            Some(k) => Some(Arc::from(group_dataset(train_set.as_ref(), k)?)),
            None => None,
        };

        let mut driver = Self {
            optimizer: Box::new(Sgd::new(&config.optimizer)),
            scheduler: Box::new(StepLr::new(&config.optimizer, &config.lr_schedule)),
            precision: MixedPrecision::new(config.amp, &config.scaler),
            checkpoints: CheckpointManager::new(layout.clone()),
            metrics: MetricsLogger::new(layout.results_path(Local::now())),
            progress: Arc::new(TracingProgressSink),
            reporter: None,
            start_epoch: config.start_epoch,
            resumed_from: None,
            group_ids,
            model,
            train_set,
            val_set,
            evaluator,
            config,
        };

        if let Some(path) = driver.config.resume.clone() {
            driver.resume(&path)?;
        }
        Ok(driver)
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// First epoch the next `run` trains.
    #[must_use]
    pub fn start_epoch(&self) -> u32 {
        self.start_epoch
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[must_use]
    pub fn precision(&self) -> &MixedPrecision {
        &self.precision
    }

    #[must_use]
    pub fn results_path(&self) -> &Path {
        self.metrics.path()
    }

    fn resume(&mut self, path: &Path) -> TrainingResult<()> {
        let state = CheckpointManager::load(path)?;
        let start_epoch = state.next_epoch().ok_or_else(|| TrainingError::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: format!("epoch {} has no successor", state.epoch),
        })?;
        self.model.load_state_dict(&state.model)?;
        self.optimizer.load_state_dict(&state.optimizer)?;
        self.scheduler.load_state_dict(&state.lr_scheduler)?;
        self.precision.restore(state.scaler.clone());
        self.start_epoch = start_epoch;
        self.resumed_from = Some(path.to_path_buf());

        info!(
            checkpoint = %path.display(),
            start_epoch = self.start_epoch,
            scaler_restored = state.scaler.is_some() && self.precision.is_enabled(),
            "checkpoint adopted"
        );
        Ok(())
    }

    /// Trains every remaining epoch, then hands the collected curves to the reporter.
    pub async fn run(&mut self) -> TrainingResult<RunSummary> {
        let start_epoch = self.start_epoch;
        let end_epoch = self.config.epochs;

        if let Some(checkpoint) = self.resumed_from.clone() {
            self.progress.on_event(ProgressEvent::Resumed { checkpoint, start_epoch });
        }
        self.progress.on_event(ProgressEvent::RunStarted {
            start_epoch,
            epochs: end_epoch,
            train_samples: self.train_set.len(),
            val_samples: self.val_set.len(),
        });

        let mut history = History::default();
        let mut last_checkpoint = None;
        for epoch in start_epoch..end_epoch {
            let stats = self.train_epoch(epoch).await?;
            self.scheduler.step();

            let metrics = self.evaluate().await?;
            let record = MetricsRecord { epoch, metrics, mean_loss: stats.mean_loss, learning_rate: stats.lr };
            self.metrics.append(&record)?;
            history.push(record.mean_loss, record.learning_rate, record.primary_metric());
            self.progress.on_event(ProgressEvent::EpochFinished {
                epoch,
                mean_loss: record.mean_loss,
                lr: record.learning_rate,
                metrics: record.metrics,
            });

            let path = self.checkpoints.save(&self.snapshot(epoch)?)?;
            self.progress.on_event(ProgressEvent::CheckpointSaved { epoch, path: path.clone() });
            last_checkpoint = Some(path);
            self.start_epoch = epoch + 1;
        }

        if let Some(reporter) = self.reporter.as_deref() {
            history.report(reporter)?;
        }

        let epochs_completed = end_epoch.saturating_sub(start_epoch);
        self.progress.on_event(ProgressEvent::RunFinished { epochs_completed });
        Ok(RunSummary {
            start_epoch,
            epochs_completed,
            last_checkpoint,
            results_path: self.metrics.path().to_path_buf(),
            history,
        })
    }

    fn snapshot(&self, epoch: u32) -> TrainingResult<TrainingState> {
        Ok(TrainingState {
            model: self.model.state_dict(),
            optimizer: self.optimizer.state_dict()?,
            lr_scheduler: self.scheduler.state_dict()?,
            epoch,
            scaler: self.precision.state(),
        })
    }

    fn sampler(&self, epoch: u32) -> TrainingResult<GroupedBatchSampler> {
        let order = epoch_permutation(self.train_set.len(), self.config.seed, epoch);
        match &self.group_ids {
            Some(group_ids) => GroupedBatchSampler::new(order, Arc::clone(group_ids), self.config.batch_size),
            None => GroupedBatchSampler::ungrouped(order, self.config.batch_size),
        }
    }

    async fn train_epoch(&mut self, epoch: u32) -> TrainingResult<EpochStats> {
        let sampler = self.sampler(epoch)?;
        let total = sampler.num_batches();
        let warmup = (epoch == 0 && self.config.warmup.enabled).then(|| Warmup::new(&self.config.warmup, total));
        debug!(epoch, batches = total, batch_size = sampler.batch_size(), warmup_iters = ?warmup.map(|w| w.iters()), "epoch started");

        let base_lr = self.scheduler.lr();
        self.optimizer.set_lr(base_lr);

        let mut loader = PrefetchLoader::spawn(Arc::clone(&self.train_set), sampler, self.config.worker_count());
        let mut mean_loss = 0.0_f64;
        let mut step = 0usize;
        while let Some(batch) = loader.next_batch().await {
            let batch = batch?;
            if let Some(warmup) = warmup {
                self.optimizer.set_lr(base_lr * warmup.factor_at(step));
            }

            let outcome = self.precision.step(&mut self.model, self.optimizer.as_mut(), &batch)?;
            let loss = f64::from(outcome.loss);
            mean_loss = (mean_loss * step as f64 + loss) / (step + 1) as f64;

            if !outcome.applied {
                self.progress.on_event(ProgressEvent::StepSkipped {
                    epoch,
                    step,
                    scale: outcome.scale.unwrap_or(1.0),
                });
            }
            if step % self.config.print_freq == 0 || step + 1 == total {
                self.progress.on_event(ProgressEvent::Iteration {
                    epoch,
                    step,
                    total,
                    loss,
                    mean_loss,
                    lr: self.optimizer.lr(),
                });
            }
            step += 1;
        }

        Ok(EpochStats { mean_loss, lr: self.optimizer.lr() })
    }

    async fn evaluate(&mut self) -> TrainingResult<Vec<f64>> {
        let mut loader = PrefetchLoader::sequential(Arc::clone(&self.val_set), self.config.worker_count());
        let mut predictions = Vec::with_capacity(self.val_set.len());
        while let Some(batch) = loader.next_batch().await {
            predictions.extend(self.model.forward_eval(&batch?)?);
        }
        Ok(self.evaluator.evaluate(&predictions)?)
    }
}
