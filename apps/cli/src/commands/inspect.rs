//! Checkpoint inspection.

use anyhow::{Context, Result};
use colored::Colorize;
use retina_training::CheckpointManager;
use serde_json::json;
use std::path::PathBuf;

pub fn execute(checkpoint: PathBuf, json_output: bool) -> Result<()> {
    let state = CheckpointManager::load(&checkpoint)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    let parameters = state.model.get("values").and_then(serde_json::Value::as_array).map(Vec::len);

    if json_output {
        let out = json!({
            "path": checkpoint,
            "epoch": state.epoch,
            "resume_epoch": state.next_epoch(),
            "parameters": parameters,
            "scaler": state.scaler,
            "lr_scheduler": state.lr_scheduler,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Checkpoint".bold().cyan());
    println!("  Path:         {}", checkpoint.display().to_string().dimmed());
    println!("  Epoch:        {}", state.epoch);
    if let Some(next) = state.next_epoch() {
        println!("  Resumes at:   {next}");
    }
    if let Some(n) = parameters {
        println!("  Parameters:   {n}");
    }
    match &state.scaler {
        Some(scaler) => println!("  Loss scale:   {} (tracker {})", scaler.scale, scaler.growth_tracker),
        None => println!("  Loss scale:   {}", "none".dimmed()),
    }
    println!();
    Ok(())
}
