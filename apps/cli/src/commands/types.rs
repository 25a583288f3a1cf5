//! Command type definitions shared between main.rs and tests.

use clap::Args;
use retina_training::Device;
use std::path::PathBuf;

/// Flags of `retina train`. Every flag left unset keeps the config-file value.
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// TOML config file (defaults to ./retina.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Training device (cpu, cuda, cuda:N, metal)
    #[arg(long)]
    pub device: Option<Device>,

    /// Dataset root containing VOCdevkit
    #[arg(long)]
    pub data_path: Option<PathBuf>,

    /// Number of object classes
    #[arg(long)]
    pub num_classes: Option<usize>,

    /// Directory for checkpoints, the results log and reports
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// First epoch (ignored when resuming)
    #[arg(long)]
    pub start_epoch: Option<u32>,

    /// Total number of epochs to train
    #[arg(long)]
    pub epochs: Option<u32>,

    /// Images per batch
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Aspect-ratio grouping factor k (2^k buckets); negative disables grouping
    #[arg(long, allow_negative_numbers = true)]
    pub aspect_ratio_group_factor: Option<i32>,

    /// Enable loss-scaled mixed precision
    #[arg(long)]
    pub amp: bool,

    /// Seed for the per-epoch sample order
    #[arg(long)]
    pub seed: Option<u64>,

    /// Collation workers (0 collates on the training task)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Print progress every N iterations
    #[arg(long)]
    pub print_freq: Option<usize>,

    /// Output the run summary as JSON
    #[arg(long)]
    pub json: bool,
}
