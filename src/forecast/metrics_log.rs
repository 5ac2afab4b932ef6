//! Append-only CSV log of every training run's metrics, so degradation can
//! be judged against a rolling baseline instead of a single prior run.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsRow {
    pub trained_at: DateTime<Utc>,
    pub model_name: String,
    pub months_back: u32,
    pub training_rows: u64,
    pub duration_seconds: f64,
    pub mae: f64,
    pub rmse: f64,
    pub r_squared: f64,
    pub ci_coverage: f64,
    pub notes: String,
}

pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, row: &MetricsRow) -> crate::error::CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_exists = self.path.exists();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        writer.serialize(row)?;
        writer.flush()?;
        debug!(path = %self.path.display(), "appended forecast metrics row");
        Ok(())
    }

    pub fn read_all(&self) -> crate::error::CoreResult<Vec<MetricsRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for result in reader.deserialize() {
            rows.push(result?);
        }
        Ok(rows)
    }

    /// Median of the last `n` rows' chosen metric, used as the baseline for
    /// degradation detection. Returns `None` if the log has no rows yet.
    pub fn median_of_last<F: Fn(&MetricsRow) -> f64>(&self, n: usize, metric: F) -> crate::error::CoreResult<Option<f64>> {
        let rows = self.read_all()?;
        if rows.is_empty() {
            return Ok(None);
        }
        let tail = &rows[rows.len().saturating_sub(n)..];
        let mut values: Vec<f64> = tail.iter().map(&metric).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        Ok(Some(median))
    }
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(mae: f64) -> MetricsRow {
        MetricsRow {
            trained_at: Utc::now(),
            model_name: "seasonal_additive".to_string(),
            months_back: 12,
            training_rows: 1000,
            duration_seconds: 1.5,
            mae: mae,
            rmse: mae * 1.3,
            r_squared: 0.8,
            ci_coverage: 0.9,
            notes: String::new(),
        }
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("metrics.csv"));
        log.append(&row(0.02)).unwrap();
        log.append(&row(0.03)).unwrap();
        let rows = log.read_all().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn median_of_last_computes_median_over_tail() {
        let dir = tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("metrics.csv"));
        for mae in [0.01, 0.02, 0.03, 0.10, 0.04] {
            log.append(&row(mae)).unwrap();
        }
        let median = log.median_of_last(3, |r| r.mae).unwrap().unwrap();
        // last 3: 0.03, 0.10, 0.04 -> sorted 0.03, 0.04, 0.10 -> median 0.04
        assert!((median - 0.04).abs() < 1e-9);
    }

    #[test]
    fn median_of_last_on_empty_log_is_none() {
        let dir = tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("metrics.csv"));
        assert!(log.median_of_last(5, |r| r.mae).unwrap().is_none());
    }
}
