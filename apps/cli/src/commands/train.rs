//! Training command implementation.

use crate::commands::types::TrainArgs;
use crate::config;
use anyhow::{Context, Result};
use colored::Colorize;
use retina_models::{BoxPriorDetector, IouEvaluator, Split, VocDataset, METRIC_NAMES};
use retina_training::{CsvReporter, OutputLayout, RunSummary, TrainingLoop};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn execute(args: TrainArgs) -> Result<()> {
    let mut config = config::load_config(&args)?;
    config.validate().context("Invalid training configuration")?;
    config.require_dataset_root()?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create output directory {}", config.output_dir.display()))?;

    // Only CPU kernels are available in this build.
    let device = config.device.resolve(false);
    if device != config.device {
        warn!(requested = %config.device, using = %device, "requested device unavailable, falling back");
    }
    config.device = device;
    info!(device = %config.device, data_path = %config.data_path.display(), "using device");

    let num_classes = config.num_classes;
    let train_set = Arc::new(
        VocDataset::open(&config.data_path, Split::Train, num_classes).context("Failed to index training split")?,
    );
    let val_set = Arc::new(
        VocDataset::open(&config.data_path, Split::Val, num_classes).context("Failed to index validation split")?,
    );
    let evaluator = IouEvaluator::for_dataset(&val_set, num_classes);
    let model = BoxPriorDetector::new(num_classes);
    let reporter = CsvReporter::new(OutputLayout::new(config.output_dir.clone()));

    let mut driver = TrainingLoop::new(config, model, train_set, val_set, evaluator)?.with_reporter(Box::new(reporter));
    let summary = driver.run().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?);
        return Ok(());
    }

    print_summary(&summary);
    Ok(())
}

fn summary_json(summary: &RunSummary) -> serde_json::Value {
    json!({
        "start_epoch": summary.start_epoch,
        "epochs_completed": summary.epochs_completed,
        "last_checkpoint": summary.last_checkpoint,
        "results": summary.results_path,
        "train_loss": summary.history.train_loss,
        "learning_rate": summary.history.learning_rate,
        "val_map": summary.history.val_map,
    })
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Epochs:  {} (from {})", summary.epochs_completed, summary.start_epoch);
    println!("  Results: {}", summary.results_path.display().to_string().dimmed());
    match &summary.last_checkpoint {
        Some(path) => println!("  Latest:  {}", path.display().to_string().cyan()),
        None => println!("  {}", "No epochs left to train; nothing was written.".dimmed()),
    }
    if let (Some(loss), Some(map)) = (summary.history.train_loss.last(), summary.history.val_map.last()) {
        println!("  Final:   loss {loss:.4}  {} {map:.4}", METRIC_NAMES[1]);
    }
    println!();
}
