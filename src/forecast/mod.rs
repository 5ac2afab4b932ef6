//! C7 — PriceForecaster. A daily/weekly-seasonal additive model trained
//! on REE price history, with chronological holdout metrics, a CSV metrics
//! log for degradation detection, and an atomically-updated artifact
//! pointer so a forecast call never sees a half-written model.

pub mod metrics_log;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::alerts::{AlertSink, Severity as AlertSeverity};
use crate::error::{CoreError, CoreResult};
use crate::timeseries::{Measurement, Row, TagFilter, TimeSeriesStore};
use metrics_log::{MetricsLog, MetricsRow};

const MIN_FORECAST_HOURS: u32 = 1;
const MAX_FORECAST_HOURS: u32 = 168;
const HOURS_PER_DAY: usize = 24;
const DAYS_PER_WEEK: usize = 7;
/// A retrain is judged degraded if MAE doubles or R² halves against the
/// rolling median of the last 5 runs.
const DEGRADATION_MAE_MULTIPLIER: f64 = 2.0;
const DEGRADATION_R2_MULTIPLIER: f64 = 0.5;
const BASELINE_WINDOW: usize = 30;
const MODEL_NAME: &str = "seasonal_additive";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonalModel {
    pub trained_at: DateTime<Utc>,
    /// Grand mean price across the training window.
    pub base_level: f64,
    /// One additive offset per hour-of-day (0..24).
    pub hourly_offsets: [f64; HOURS_PER_DAY],
    /// One additive offset per day-of-week (Mon=0..Sun=6).
    pub weekday_offsets: [f64; DAYS_PER_WEEK],
    pub training_rows: u64,
}

impl SeasonalModel {
    fn predict(&self, timestamp: DateTime<Utc>) -> f64 {
        let hour = timestamp.hour() as usize;
        let weekday = timestamp.weekday().num_days_from_monday() as usize;
        self.base_level + self.hourly_offsets[hour] + self.weekday_offsets[weekday]
    }
}

#[derive(Debug, Clone)]
pub struct ForecastedPoint {
    pub timestamp: DateTime<Utc>,
    pub price_eur_kwh: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub training_rows: u64,
    pub mae: f64,
    pub rmse: f64,
    pub r_squared: f64,
    pub ci_coverage: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ForecasterStatus {
    pub trained_at: Option<DateTime<Utc>>,
    pub training_rows: u64,
    pub last_mae: Option<f64>,
    pub last_r_squared: Option<f64>,
}

pub struct PriceForecaster {
    store: Arc<dyn TimeSeriesStore>,
    alerts: Arc<dyn AlertSink>,
    metrics: MetricsLog,
    artifacts_dir: PathBuf,
    model: RwLock<Option<SeasonalModel>>,
    residual_std: RwLock<f64>,
}

impl PriceForecaster {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        alerts: Arc<dyn AlertSink>,
        artifacts_dir: PathBuf,
        metrics_log_path: PathBuf,
    ) -> Self {
        Self {
            store,
            alerts,
            metrics: MetricsLog::new(metrics_log_path),
            artifacts_dir,
            model: RwLock::new(None),
            residual_std: RwLock::new(0.0),
        }
    }

    /// Trains (or retrains) the model on the last `months_back` months of
    /// REE price history. Splits 80/20 chronologically (not shuffled —
    /// this is a time series) and reports holdout metrics. On success,
    /// atomically swaps the artifact pointer so concurrent `forecast`
    /// calls never observe a partially-written model.
    pub async fn train(&self, months_back: u32) -> CoreResult<TrainReport> {
        let started = std::time::Instant::now();
        let now = Utc::now();
        let start = now - ChronoDuration::days(months_back as i64 * 30);
        let rows = self
            .store
            .query_range(
                Measurement::EnergyPrices,
                &TagFilter::new().with("provider", "ree"),
                start,
                now,
            )
            .await?;

        if rows.len() < HOURS_PER_DAY * 2 {
            return Err(CoreError::ValidationError(format!(
                "not enough training data: {} rows, need at least {}",
                rows.len(),
                HOURS_PER_DAY * 2
            )));
        }

        let split_idx = (rows.len() * 4) / 5;
        let (train_rows, test_rows) = rows.split_at(split_idx);

        let model = fit_seasonal_model(train_rows)?;
        let (mae, rmse, r_squared, residual_std) = evaluate(&model, test_rows);
        let ci_coverage = coverage(&model, test_rows, residual_std);

        let baseline_mae = self.metrics.median_of_last(BASELINE_WINDOW, |r| r.mae)?;
        let baseline_r2 = self.metrics.median_of_last(BASELINE_WINDOW, |r| r.r_squared)?;
        let degraded = match (baseline_mae, baseline_r2) {
            (Some(base_mae), Some(base_r2)) => {
                mae > base_mae * DEGRADATION_MAE_MULTIPLIER || r_squared < base_r2 * DEGRADATION_R2_MULTIPLIER
            }
            _ => false,
        };

        let duration_seconds = started.elapsed().as_secs_f64();
        let notes = if degraded {
            format!("degraded vs baseline (mae={:?}, r2={:?})", baseline_mae, baseline_r2)
        } else {
            String::new()
        };

        self.metrics.append(&MetricsRow {
            trained_at: now,
            model_name: MODEL_NAME.to_string(),
            months_back,
            training_rows: train_rows.len() as u64,
            duration_seconds,
            mae,
            rmse,
            r_squared,
            ci_coverage,
            notes,
        })?;

        // Persisted regardless of `degraded`: a new artifact is always the
        // best model trained so far, and retraining every 6 hours means a
        // refusal to persist leaves an even staler model in place.
        self.write_artifact_pointer(&model).await?;
        *self.model.write().await = Some(model);
        *self.residual_std.write().await = residual_std;
        info!(mae, rmse, r_squared, degraded, "trained forecast model");

        if degraded {
            warn!(mae, r_squared, "forecast model degraded relative to baseline");
            self.alerts
                .send(
                    "prophet_model_degradation",
                    AlertSeverity::Warning,
                    &format!("retrained model MAE={mae:.4} R2={r_squared:.3} vs baseline"),
                )
                .await;
        }

        Ok(TrainReport {
            training_rows: train_rows.len() as u64,
            mae,
            rmse,
            r_squared,
            ci_coverage,
            degraded,
        })
    }

    /// Forecasts `hours` ahead, validated to `[1, 168]` per the weekly
    /// horizon cap.
    pub async fn forecast(&self, hours: u32) -> CoreResult<Vec<ForecastedPoint>> {
        if !(MIN_FORECAST_HOURS..=MAX_FORECAST_HOURS).contains(&hours) {
            return Err(CoreError::ValidationError(format!(
                "forecast horizon {hours} out of range [{MIN_FORECAST_HOURS}, {MAX_FORECAST_HOURS}]"
            )));
        }
        let guard = self.model.read().await;
        let model = guard.as_ref().ok_or(CoreError::ModelUnavailable)?;
        let residual_std = *self.residual_std.read().await;
        let next_hour = next_full_hour(Utc::now());

        Ok((0..hours)
            .map(|h| {
                let timestamp = next_hour + ChronoDuration::hours(h as i64);
                let predicted = model.predict(timestamp);
                ForecastedPoint {
                    timestamp,
                    price_eur_kwh: predicted,
                    lower_bound: predicted - 1.96 * residual_std,
                    upper_bound: predicted + 1.96 * residual_std,
                }
            })
            .collect())
    }

    /// Ensures a model exists and is no more than 6 hours old, retraining
    /// otherwise. Called by the `ensure_forecast_model` job.
    pub async fn ensure_fresh(&self) -> CoreResult<()> {
        let is_stale = match self.model.read().await.as_ref() {
            Some(m) => Utc::now() - m.trained_at > ChronoDuration::hours(6),
            None => true,
        };
        if is_stale {
            self.train(12).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Option<ForecasterStatus> {
        let model = self.model.read().await;
        let last = self.metrics.read_all().ok()?.into_iter().last();
        Some(ForecasterStatus {
            trained_at: model.as_ref().map(|m| m.trained_at),
            training_rows: model.as_ref().map(|m| m.training_rows).unwrap_or(0),
            last_mae: last.as_ref().map(|r| r.mae),
            last_r_squared: last.as_ref().map(|r| r.r_squared),
        })
    }

    /// Writes the model to `prophet_<timestamp>.pkl`, then atomically
    /// updates `prophet_latest.pkl` via rename so a concurrent reader only
    /// ever sees either the old or the fully-written new artifact, never a
    /// partial one.
    async fn write_artifact_pointer(&self, model: &SeasonalModel) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.artifacts_dir).await?;
        let versioned_path = self
            .artifacts_dir
            .join(format!("prophet_{}.pkl", model.trained_at.timestamp()));
        let final_path = self.artifacts_dir.join("prophet_latest.pkl");
        let tmp_path = self.artifacts_dir.join("prophet_latest.pkl.tmp");
        let bytes = serde_json::to_vec(model)?;
        tokio::fs::write(&versioned_path, &bytes).await?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

/// The next hour boundary strictly after `now`, e.g. 14:37 -> 15:00.
fn next_full_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("hour from a valid DateTime is always valid")
        .and_utc();
    truncated + ChronoDuration::hours(1)
}

fn fit_seasonal_model(rows: &[Row]) -> CoreResult<SeasonalModel> {
    let prices: Vec<(DateTime<Utc>, f64)> = rows
        .iter()
        .filter_map(|r| r.fields.get("price_eur_kwh").map(|p| (r.timestamp, *p)))
        .collect();
    if prices.is_empty() {
        return Err(CoreError::ValidationError("no price_eur_kwh field in training rows".to_string()));
    }

    let base_level = prices.iter().map(|(_, p)| p).sum::<f64>() / prices.len() as f64;

    let mut hourly_sums = [0.0_f64; HOURS_PER_DAY];
    let mut hourly_counts = [0_u64; HOURS_PER_DAY];
    let mut weekday_sums = [0.0_f64; DAYS_PER_WEEK];
    let mut weekday_counts = [0_u64; DAYS_PER_WEEK];

    for (ts, price) in &prices {
        let residual = price - base_level;
        let hour = ts.hour() as usize;
        hourly_sums[hour] += residual;
        hourly_counts[hour] += 1;
        let weekday = ts.weekday().num_days_from_monday() as usize;
        weekday_sums[weekday] += residual;
        weekday_counts[weekday] += 1;
    }

    let mut hourly_offsets = [0.0_f64; HOURS_PER_DAY];
    for i in 0..HOURS_PER_DAY {
        if hourly_counts[i] > 0 {
            hourly_offsets[i] = hourly_sums[i] / hourly_counts[i] as f64;
        }
    }
    let mut weekday_offsets = [0.0_f64; DAYS_PER_WEEK];
    for i in 0..DAYS_PER_WEEK {
        if weekday_counts[i] > 0 {
            weekday_offsets[i] = weekday_sums[i] / weekday_counts[i] as f64;
        }
    }

    Ok(SeasonalModel {
        trained_at: Utc::now(),
        base_level,
        hourly_offsets,
        weekday_offsets,
        training_rows: prices.len() as u64,
    })
}

/// Returns `(mae, rmse, r_squared, residual_std)` over the holdout set.
fn evaluate(model: &SeasonalModel, test_rows: &[Row]) -> (f64, f64, f64, f64) {
    let pairs: Vec<(f64, f64)> = test_rows
        .iter()
        .filter_map(|r| r.fields.get("price_eur_kwh").map(|actual| (model.predict(r.timestamp), *actual)))
        .collect();
    if pairs.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let n = pairs.len() as f64;
    let mae = pairs.iter().map(|(p, a)| (p - a).abs()).sum::<f64>() / n;
    let mse = pairs.iter().map(|(p, a)| (p - a).powi(2)).sum::<f64>() / n;
    let rmse = mse.sqrt();

    let actual_mean = pairs.iter().map(|(_, a)| a).sum::<f64>() / n;
    let ss_tot: f64 = pairs.iter().map(|(_, a)| (a - actual_mean).powi(2)).sum();
    let ss_res: f64 = pairs.iter().map(|(p, a)| (a - p).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let residual_std = rmse;
    (mae, rmse, r_squared, residual_std)
}

/// Fraction of holdout points whose actual value fell within the model's
/// 95% interval, i.e. calibration of the reported confidence bounds.
fn coverage(model: &SeasonalModel, test_rows: &[Row], residual_std: f64) -> f64 {
    let pairs: Vec<(f64, f64)> = test_rows
        .iter()
        .filter_map(|r| r.fields.get("price_eur_kwh").map(|actual| (model.predict(r.timestamp), *actual)))
        .collect();
    if pairs.is_empty() {
        return 0.0;
    }
    let within = pairs
        .iter()
        .filter(|(predicted, actual)| {
            let lower = predicted - 1.96 * residual_std;
            let upper = predicted + 1.96 * residual_std;
            *actual >= lower && *actual <= upper
        })
        .count();
    within as f64 / pairs.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RateLimitedAlertSink;
    use crate::timeseries::{InMemoryStore, Point};
    use tempfile::tempdir;

    async fn seeded_store(hours: i64) -> Arc<dyn TimeSeriesStore> {
        let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut points = Vec::new();
        for h in 0..hours {
            let ts = now - ChronoDuration::hours(hours - h);
            let hour_of_day = ts.hour();
            let price = 0.10 + if (10..=13).contains(&hour_of_day) { 0.05 } else { 0.0 };
            points.push(
                Point::new(Measurement::EnergyPrices, ts)
                    .tag("provider", "ree")
                    .tag("data_source", "ree_realtime")
                    .tag("tariff_period", "P2")
                    .field("price_eur_kwh", price),
            );
        }
        store.write_points(points).await.unwrap();
        store
    }

    fn test_forecaster(store: Arc<dyn TimeSeriesStore>, dir: &tempfile::TempDir) -> PriceForecaster {
        let alerts: Arc<dyn AlertSink> = Arc::new(RateLimitedAlertSink::disabled());
        PriceForecaster::new(
            store,
            alerts,
            dir.path().join("models"),
            dir.path().join("metrics.csv"),
        )
    }

    #[tokio::test]
    async fn forecast_before_training_returns_model_unavailable() {
        let dir = tempdir().unwrap();
        let store = seeded_store(0).await;
        let forecaster = test_forecaster(store, &dir);
        let result = forecaster.forecast(24).await;
        assert!(matches!(result, Err(CoreError::ModelUnavailable)));
    }

    #[tokio::test]
    async fn forecast_rejects_out_of_range_horizon() {
        let dir = tempdir().unwrap();
        let store = seeded_store(24 * 60).await;
        let forecaster = test_forecaster(store, &dir);
        forecaster.train(2).await.unwrap();
        assert!(matches!(forecaster.forecast(0).await, Err(CoreError::ValidationError(_))));
        assert!(matches!(forecaster.forecast(169).await, Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn train_on_enough_data_produces_usable_forecast() {
        let dir = tempdir().unwrap();
        let store = seeded_store(24 * 90).await;
        let forecaster = test_forecaster(store, &dir);
        let report = forecaster.train(3).await.unwrap();
        assert!(report.training_rows > 0);
        assert!(!report.degraded);

        let points = forecaster.forecast(48).await.unwrap();
        assert_eq!(points.len(), 48);
        for p in &points {
            assert!(p.lower_bound <= p.price_eur_kwh);
            assert!(p.price_eur_kwh <= p.upper_bound);
        }
    }

    #[tokio::test]
    async fn degraded_retrain_still_persists_new_model() {
        let dir = tempdir().unwrap();
        let store = seeded_store(24 * 90).await;
        let forecaster = test_forecaster(store.clone(), &dir);
        let first = forecaster.train(3).await.unwrap();
        assert!(!first.degraded);

        // Overwrite the same timestamps with wild swings so the retrain's
        // holdout error blows well past 2x the recorded baseline.
        let now = Utc::now();
        let mut spiky = Vec::new();
        for h in 0..(24 * 90) {
            let ts = now - ChronoDuration::hours(24 * 90 - h);
            let price = if h % 2 == 0 { 5.0 } else { -5.0 };
            spiky.push(
                Point::new(Measurement::EnergyPrices, ts)
                    .tag("provider", "ree")
                    .tag("data_source", "ree_realtime")
                    .tag("tariff_period", "P2")
                    .field("price_eur_kwh", price),
            );
        }
        store.write_points(spiky).await.unwrap();

        let second = forecaster.train(3).await.unwrap();
        assert!(second.degraded);

        // A degraded retrain is still the newest model and must be usable.
        let points = forecaster.forecast(6).await.unwrap();
        assert_eq!(points.len(), 6);
    }

    #[tokio::test]
    async fn train_with_too_little_data_is_rejected() {
        let dir = tempdir().unwrap();
        let store = seeded_store(10).await;
        let forecaster = test_forecaster(store, &dir);
        let result = forecaster.train(1).await;
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }
}
