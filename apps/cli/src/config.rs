//! Training configuration loading and merging.

use crate::commands::types::TrainArgs;
use anyhow::{Context, Result};
use retina_training::TrainingConfig;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is absent.
pub const LOCAL_CONFIG_FILE: &str = "retina.toml";

/// Load and merge the training configuration.
///
/// Configuration precedence:
/// 1. CLI arguments
/// 2. Config file (`--config`, else ./retina.toml)
/// 3. Defaults
pub fn load_config(args: &TrainArgs) -> Result<TrainingConfig> {
    let file = args.config.clone().or_else(|| {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        local.is_file().then_some(local)
    });

    let mut config = match file {
        Some(path) => load_file(&path)?,
        None => TrainingConfig::default(),
    };
    apply_args(&mut config, args);
    Ok(config)
}

fn load_file(path: &Path) -> Result<TrainingConfig> {
    TrainingConfig::load_from_file(path)
        .with_context(|| format!("Failed to load config file {}", path.display()))
}

/// Overlays every flag that was given on top of `config`.
pub fn apply_args(config: &mut TrainingConfig, args: &TrainArgs) {
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(path) = &args.data_path {
        config.data_path.clone_from(path);
    }
    if let Some(n) = args.num_classes {
        config.num_classes = n;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    if args.resume.is_some() {
        config.resume.clone_from(&args.resume);
    }
    if let Some(epoch) = args.start_epoch {
        config.start_epoch = epoch;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(b) = args.batch_size {
        config.batch_size = b;
    }
    if let Some(k) = args.aspect_ratio_group_factor {
        config.aspect_ratio_group_factor = k;
    }
    if args.amp {
        config.amp = true;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    if let Some(freq) = args.print_freq {
        config.print_freq = freq;
    }
}
