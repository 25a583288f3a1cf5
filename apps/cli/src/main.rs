//! Retina CLI - Command-line interface for Retina detection training
//!
//! This CLI provides a `retina` command for training a detector on a Pascal VOC
//! devkit and for inspecting the checkpoints a run leaves behind.

mod commands;
mod config;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{inspect, train, TrainArgs};

/// Retina CLI - Object-detection training orchestration
///
/// Trains with aspect-ratio grouped batches, optional loss-scaled mixed
/// precision, per-epoch checkpoints and an append-only results log.
#[derive(Parser, Debug)]
#[command(
    name = "retina",
    author,
    version,
    about = "Retina - Object-detection training orchestration",
    long_about = "Retina trains detection models on Pascal VOC data.\nEvery completed epoch appends a results line and writes a resumable checkpoint."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a detector
    ///
    /// Reads VOCdevkit/VOC2012 under the data path, trains for the requested
    /// epochs and writes checkpoints, the results log and curve reports to the
    /// output directory.
    Train(TrainArgs),

    /// Show what a checkpoint contains
    Inspect {
        /// Checkpoint file
        checkpoint: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Train(train_args) => train::execute(train_args).await?,
        Command::Inspect { checkpoint, json } => inspect::execute(checkpoint, json)?,
    }

    Ok(())
}
