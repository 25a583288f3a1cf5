//! Append-only per-epoch results log.

use crate::error::{TrainingError, TrainingResult};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const LINE_PREFIX: &str = "epoch:";
const FIELD_SEPARATOR: &str = "  ";

/// Statistics of one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub epoch: u32,
    /// Evaluation metrics in evaluator order; index 1 is the primary metric.
    pub metrics: Vec<f64>,
    pub mean_loss: f64,
    pub learning_rate: f64,
}

impl MetricsRecord {
    /// Primary metric (mAP at IoU 0.5), if the evaluator reported one.
    #[must_use]
    pub fn primary_metric(&self) -> Option<f64> {
        self.metrics.get(1).copied()
    }
}

impl fmt::Display for MetricsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<String> = self.metrics.iter().map(|m| format!("{m:.4}")).collect();
        fields.push(format!("{:.4}", self.mean_loss));
        fields.push(format!("{:.6}", self.learning_rate));
        write!(f, "{LINE_PREFIX}{} {}", self.epoch, fields.join(FIELD_SEPARATOR))
    }
}

impl FromStr for MetricsRecord {
    type Err = TrainingError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| TrainingError::Metrics(format!("{reason}: {line:?}"));

        let rest = line.trim().strip_prefix(LINE_PREFIX).ok_or_else(|| malformed("missing epoch prefix"))?;
        let mut tokens = rest.split_whitespace();
        let epoch = tokens
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| malformed("invalid epoch"))?;
        let mut values = tokens
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| malformed("invalid value"))?;

        let (Some(learning_rate), Some(mean_loss)) = (values.pop(), values.pop()) else {
            return Err(malformed("expected mean loss and learning rate"));
        };
        Ok(Self { epoch, metrics: values, mean_loss, learning_rate })
    }
}

/// Appends one line per epoch to a text file. Lines are never rewritten.
#[derive(Debug, Clone)]
pub struct MetricsLogger {
    path: PathBuf,
}

impl MetricsLogger {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record` and flushes it to disk before returning.
    pub fn append(&self, record: &MetricsRecord) -> TrainingResult<()> {
        let context = |e: std::io::Error| TrainingError::Metrics(format!("{}: {e}", self.path.display()));

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(context)?;
        writeln!(file, "{record}").map_err(context)?;
        file.sync_data().map_err(context)?;

        debug!(path = %self.path.display(), epoch = record.epoch, "metrics appended");
        Ok(())
    }

    /// Reads every record in the log, skipping blank lines.
    pub fn read_records(&self) -> TrainingResult<Vec<MetricsRecord>> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| TrainingError::Metrics(format!("{}: {e}", self.path.display())))?;
        contents.lines().filter(|l| !l.trim().is_empty()).map(str::parse).collect()
    }
}
