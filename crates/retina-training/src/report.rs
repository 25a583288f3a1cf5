//! End-of-run curve reports.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::OutputLayout;
use std::path::Path;
use tracing::info;

/// Consumes the per-epoch series collected over a run.
pub trait Reporter: Send + Sync {
    /// Mean training loss and learning rate per epoch. Both series have the same length.
    fn loss_and_lr(&self, losses: &[f64], learning_rates: &[f64]) -> TrainingResult<()>;

    /// Primary evaluation metric per epoch.
    fn map(&self, series: &[f64]) -> TrainingResult<()>;
}

/// Series gathered by the training loop for this process's epochs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub val_map: Vec<f64>,
}

impl History {
    pub fn push(&mut self, mean_loss: f64, learning_rate: f64, primary_metric: Option<f64>) {
        self.train_loss.push(mean_loss);
        self.learning_rate.push(learning_rate);
        if let Some(map) = primary_metric {
            self.val_map.push(map);
        }
    }

    /// Hands each non-empty series to `reporter`; empty series are never reported.
    pub fn report(&self, reporter: &dyn Reporter) -> TrainingResult<()> {
        if !self.train_loss.is_empty() && !self.learning_rate.is_empty() {
            reporter.loss_and_lr(&self.train_loss, &self.learning_rate)?;
        }
        if !self.val_map.is_empty() {
            reporter.map(&self.val_map)?;
        }
        Ok(())
    }
}

/// Writes the series as CSV files next to the checkpoints.
#[derive(Debug, Clone)]
pub struct CsvReporter {
    layout: OutputLayout,
}

impl CsvReporter {
    #[must_use]
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    fn write(path: &Path, header: &[&str], rows: impl Iterator<Item = Vec<String>>) -> TrainingResult<()> {
        let context = |e: csv::Error| TrainingError::Report(format!("{}: {e}", path.display()));

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path).map_err(context)?;
        writer.write_record(header).map_err(context)?;
        for row in rows {
            writer.write_record(&row).map_err(context)?;
        }
        writer.flush()?;

        info!(path = %path.display(), "report written");
        Ok(())
    }
}

impl Reporter for CsvReporter {
    fn loss_and_lr(&self, losses: &[f64], learning_rates: &[f64]) -> TrainingResult<()> {
        let rows = losses
            .iter()
            .zip(learning_rates)
            .enumerate()
            .map(|(epoch, (loss, lr))| vec![epoch.to_string(), format!("{loss:.4}"), format!("{lr:.6}")]);
        Self::write(&self.layout.loss_and_lr_report_path(), &["epoch", "loss", "learning_rate"], rows)
    }

    fn map(&self, series: &[f64]) -> TrainingResult<()> {
        let rows = series
            .iter()
            .enumerate()
            .map(|(epoch, map)| vec![epoch.to_string(), format!("{map:.4}")]);
        Self::write(&self.layout.map_report_path(), &["epoch", "map"], rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Reporter for Recording {
        fn loss_and_lr(&self, losses: &[f64], learning_rates: &[f64]) -> TrainingResult<()> {
            assert_eq!(losses.len(), learning_rates.len());
            self.calls.lock().unwrap().push("loss_and_lr");
            Ok(())
        }

        fn map(&self, _series: &[f64]) -> TrainingResult<()> {
            self.calls.lock().unwrap().push("map");
            Ok(())
        }
    }

    #[test]
    fn test_empty_history_reports_nothing() {
        let reporter = Recording::default();
        History::default().report(&reporter).unwrap();
        assert!(reporter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_map_skipped_without_primary_metric() {
        let reporter = Recording::default();
        let mut history = History::default();
        history.push(0.9, 0.005, None);
        history.report(&reporter).unwrap();
        assert_eq!(*reporter.calls.lock().unwrap(), vec!["loss_and_lr"]);

        history.push(0.8, 0.005, Some(0.3));
        history.report(&reporter).unwrap();
        assert_eq!(*reporter.calls.lock().unwrap(), vec!["loss_and_lr", "loss_and_lr", "map"]);
    }

    #[test]
    fn test_csv_reporter_writes_files() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path().to_path_buf());
        let mut history = History::default();
        history.push(1.5, 0.005, Some(0.25));
        history.push(1.25, 0.00165, Some(0.5));
        history.report(&CsvReporter::new(layout.clone())).unwrap();

        let loss = std::fs::read_to_string(layout.loss_and_lr_report_path()).unwrap();
        assert_eq!(loss, "epoch,loss,learning_rate\n0,1.5000,0.005000\n1,1.2500,0.001650\n");
        let map = std::fs::read_to_string(layout.map_report_path()).unwrap();
        assert_eq!(map, "epoch,map\n0,0.2500\n1,0.5000\n");
    }
}
