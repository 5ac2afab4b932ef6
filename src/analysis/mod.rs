//! C8 — SIARHistoricalAnalyzer. Pure functions over a large historical
//! agro-climatic dataset (~90k daily records): correlations against a
//! production-efficiency proxy, per-month seasonal stats, percentile
//! thresholds, and forecast contextualization. Every output is cached in
//! memory with a 24-hour TTL since the underlying dataset never changes
//! once loaded.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::CoreResult;

const OPTIMAL_TEMP_MIN: f64 = 15.0;
const OPTIMAL_TEMP_MAX: f64 = 25.0;
const OPTIMAL_HUMIDITY_MIN: f64 = 40.0;
const OPTIMAL_HUMIDITY_MAX: f64 = 70.0;
const TTL: ChronoDuration = ChronoDuration::hours(24);

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalRecord {
    pub date: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Correlations {
    pub temperature_r_squared: f64,
    pub humidity_r_squared: f64,
}

#[derive(Debug, Clone)]
pub struct MonthStats {
    pub month: u32,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub avg_efficiency: f64,
    /// 1 = best average efficiency of the year, 12 = worst. Ties break by
    /// month number.
    pub efficiency_rank: u32,
    pub is_best: bool,
    pub is_worst: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VariableThresholds {
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p90_occurrences: u64,
    pub p95_occurrences: u64,
    pub p99_occurrences: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CriticalThresholds {
    pub temperature: VariableThresholds,
    pub humidity: VariableThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceededThreshold {
    None,
    P90,
    P95,
    P99,
}

impl ExceededThreshold {
    pub fn recommendation(&self) -> &'static str {
        match self {
            ExceededThreshold::None => "optimal",
            ExceededThreshold::P90 => "monitor; consider -10%",
            ExceededThreshold::P95 => "reduce production 15-20%",
            ExceededThreshold::P99 => "halt or shift to night",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastDayContext {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub historical_avg_efficiency: Option<f64>,
    pub exceeded: ExceededThreshold,
    pub recommendation: &'static str,
}

/// `efficiency_score = temp_score*0.6 + humidity_score*0.4`, each
/// sub-score 100 inside the optimal band and decaying linearly outside.
pub fn efficiency_score(temperature: f64, humidity: f64) -> f64 {
    band_score(temperature, OPTIMAL_TEMP_MIN, OPTIMAL_TEMP_MAX) * 0.6
        + band_score(humidity, OPTIMAL_HUMIDITY_MIN, OPTIMAL_HUMIDITY_MAX) * 0.4
}

fn band_score(value: f64, lo: f64, hi: f64) -> f64 {
    if value >= lo && value <= hi {
        return 100.0;
    }
    let distance = if value < lo { lo - value } else { value - hi };
    let band_width = hi - lo;
    (100.0 - (distance / band_width) * 100.0).max(0.0)
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

struct Cache<T> {
    value: T,
    computed_at: DateTime<Utc>,
}

pub struct SiarHistoricalAnalyzer {
    records: Vec<HistoricalRecord>,
    correlations: RwLock<Option<Cache<Correlations>>>,
    seasonal: RwLock<Option<Cache<Vec<MonthStats>>>>,
    thresholds: RwLock<Option<Cache<CriticalThresholds>>>,
}

impl SiarHistoricalAnalyzer {
    pub fn new(records: Vec<HistoricalRecord>) -> Self {
        Self {
            records,
            correlations: RwLock::new(None),
            seasonal: RwLock::new(None),
            thresholds: RwLock::new(None),
        }
    }

    /// Loads historical records from a CSV with `date,temperature,humidity`
    /// columns — the shape the SIAR/datosclima historical ETL emits; this
    /// reads its output rather than performing the ETL itself.
    pub fn load_csv(path: &Path) -> CoreResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            records.push(result?);
        }
        info!(count = records.len(), path = %path.display(), "loaded SIAR historical records");
        Ok(Self::new(records))
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Pearson correlation squared between each variable and the
    /// efficiency-score proxy, cached for 24h.
    pub async fn correlations(&self) -> Correlations {
        if let Some(hit) = fresh(&*self.correlations.read().await) {
            return hit;
        }
        let computed = compute_correlations(&self.records);
        *self.correlations.write().await = Some(Cache {
            value: computed,
            computed_at: Utc::now(),
        });
        computed
    }

    pub async fn seasonal_patterns(&self) -> Vec<MonthStats> {
        if let Some(hit) = fresh(&*self.seasonal.read().await) {
            return hit;
        }
        let computed = compute_seasonal_patterns(&self.records);
        *self.seasonal.write().await = Some(Cache {
            value: computed.clone(),
            computed_at: Utc::now(),
        });
        computed
    }

    pub async fn critical_thresholds(&self) -> CriticalThresholds {
        if let Some(hit) = fresh(&*self.thresholds.read().await) {
            return hit;
        }
        let computed = compute_critical_thresholds(&self.records);
        *self.thresholds.write().await = Some(Cache {
            value: computed.clone(),
            computed_at: Utc::now(),
        });
        computed
    }

    /// For each point in `forecast`, finds historical days within 2°C and
    /// 5% humidity, averages their efficiency score, flags the worst
    /// exceeded percentile threshold, and attaches a recommendation.
    pub async fn contextualize(&self, forecast: &[(DateTime<Utc>, f64, f64)]) -> Vec<ForecastDayContext> {
        let thresholds = self.critical_thresholds().await;
        forecast
            .iter()
            .map(|(timestamp, temperature, humidity)| {
                let analogs: Vec<&HistoricalRecord> = self
                    .records
                    .iter()
                    .filter(|r| (r.temperature - temperature).abs() <= 2.0 && (r.humidity - humidity).abs() <= 5.0)
                    .collect();
                let historical_avg_efficiency = if analogs.is_empty() {
                    None
                } else {
                    Some(
                        analogs.iter().map(|r| efficiency_score(r.temperature, r.humidity)).sum::<f64>()
                            / analogs.len() as f64,
                    )
                };

                let exceeded = worst_exceeded(*temperature, *humidity, &thresholds);
                ForecastDayContext {
                    timestamp: *timestamp,
                    temperature: *temperature,
                    humidity: *humidity,
                    historical_avg_efficiency,
                    exceeded,
                    recommendation: exceeded.recommendation(),
                }
            })
            .collect()
    }
}

fn fresh<T: Clone>(cache: &Option<Cache<T>>) -> Option<T> {
    cache.as_ref().and_then(|c| {
        if Utc::now() - c.computed_at < TTL {
            Some(c.value.clone())
        } else {
            None
        }
    })
}

fn compute_correlations(records: &[HistoricalRecord]) -> Correlations {
    if records.is_empty() {
        return Correlations::default();
    }
    let efficiencies: Vec<f64> = records.iter().map(|r| efficiency_score(r.temperature, r.humidity)).collect();
    let temps: Vec<f64> = records.iter().map(|r| r.temperature).collect();
    let humidities: Vec<f64> = records.iter().map(|r| r.humidity).collect();
    Correlations {
        temperature_r_squared: pearson_r_squared(&temps, &efficiencies),
        humidity_r_squared: pearson_r_squared(&humidities, &efficiencies),
    }
}

fn pearson_r_squared(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let cov: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let var_x: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    let var_y: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    r * r
}

fn compute_seasonal_patterns(records: &[HistoricalRecord]) -> Vec<MonthStats> {
    let mut by_month: BTreeMap<u32, Vec<&HistoricalRecord>> = BTreeMap::new();
    for r in records {
        by_month.entry(r.date.month()).or_default().push(r);
    }
    let mut months: Vec<MonthStats> = by_month
        .into_iter()
        .map(|(month, recs)| {
            let n = recs.len() as f64;
            let avg_temperature = recs.iter().map(|r| r.temperature).sum::<f64>() / n;
            let avg_humidity = recs.iter().map(|r| r.humidity).sum::<f64>() / n;
            let avg_efficiency = recs.iter().map(|r| efficiency_score(r.temperature, r.humidity)).sum::<f64>() / n;
            MonthStats {
                month,
                avg_temperature,
                avg_humidity,
                avg_efficiency,
                efficiency_rank: 0,
                is_best: false,
                is_worst: false,
            }
        })
        .collect();
    rank_by_efficiency(&mut months);
    months
}

/// Ranks months 1 (best average efficiency) through N (worst), ties broken
/// by month number, and flags the single best/worst month.
fn rank_by_efficiency(months: &mut [MonthStats]) {
    if months.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..months.len()).collect();
    order.sort_by(|&a, &b| {
        months[b]
            .avg_efficiency
            .partial_cmp(&months[a].avg_efficiency)
            .unwrap()
            .then(months[a].month.cmp(&months[b].month))
    });
    for (rank, &idx) in order.iter().enumerate() {
        months[idx].efficiency_rank = rank as u32 + 1;
    }
    let best_idx = order[0];
    let worst_idx = *order.last().unwrap();
    months[best_idx].is_best = true;
    months[worst_idx].is_worst = true;
}

fn compute_critical_thresholds(records: &[HistoricalRecord]) -> CriticalThresholds {
    let mut temps: Vec<f64> = records.iter().map(|r| r.temperature).collect();
    let mut humidities: Vec<f64> = records.iter().map(|r| r.humidity).collect();
    temps.sort_by(|a, b| a.partial_cmp(b).unwrap());
    humidities.sort_by(|a, b| a.partial_cmp(b).unwrap());

    CriticalThresholds {
        temperature: variable_thresholds(&temps),
        humidity: variable_thresholds(&humidities),
    }
}

fn variable_thresholds(sorted: &[f64]) -> VariableThresholds {
    let p90 = percentile(sorted, 0.90);
    let p95 = percentile(sorted, 0.95);
    let p99 = percentile(sorted, 0.99);
    VariableThresholds {
        p90,
        p95,
        p99,
        p90_occurrences: sorted.iter().filter(|v| **v > p90).count() as u64,
        p95_occurrences: sorted.iter().filter(|v| **v > p95).count() as u64,
        p99_occurrences: sorted.iter().filter(|v| **v > p99).count() as u64,
    }
}

fn worst_exceeded(temperature: f64, humidity: f64, thresholds: &CriticalThresholds) -> ExceededThreshold {
    if temperature > thresholds.temperature.p99 || humidity > thresholds.humidity.p99 {
        ExceededThreshold::P99
    } else if temperature > thresholds.temperature.p95 || humidity > thresholds.humidity.p95 {
        ExceededThreshold::P95
    } else if temperature > thresholds.temperature.p90 || humidity > thresholds.humidity.p90 {
        ExceededThreshold::P90
    } else {
        ExceededThreshold::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(month: u32, day: u32, temperature: f64, humidity: f64) -> HistoricalRecord {
        HistoricalRecord {
            date: Utc.with_ymd_and_hms(2020, month, day, 12, 0, 0).unwrap(),
            temperature,
            humidity,
        }
    }

    #[test]
    fn efficiency_score_is_100_inside_optimal_band() {
        assert_eq!(efficiency_score(20.0, 55.0), 100.0);
    }

    #[test]
    fn efficiency_score_decays_outside_optimal_band() {
        let score = efficiency_score(35.0, 55.0);
        assert!(score < 100.0);
        assert!(score >= 0.0);
    }

    #[tokio::test]
    async fn seasonal_patterns_groups_by_month() {
        let records = vec![rec(1, 1, 5.0, 80.0), rec(1, 15, 6.0, 82.0), rec(7, 1, 30.0, 30.0)];
        let analyzer = SiarHistoricalAnalyzer::new(records);
        let patterns = analyzer.seasonal_patterns().await;
        assert_eq!(patterns.len(), 2);
        assert!(patterns.iter().any(|m| m.month == 1));
        assert!(patterns.iter().any(|m| m.month == 7));
    }

    #[tokio::test]
    async fn seasonal_patterns_rank_exactly_one_best_and_worst_month() {
        // January sits inside the optimal band (near-100 efficiency);
        // July's heat and low humidity push it well below.
        let records = vec![rec(1, 1, 20.0, 55.0), rec(1, 15, 21.0, 55.0), rec(7, 1, 38.0, 20.0)];
        let analyzer = SiarHistoricalAnalyzer::new(records);
        let patterns = analyzer.seasonal_patterns().await;

        assert_eq!(patterns.iter().filter(|m| m.is_best).count(), 1);
        assert_eq!(patterns.iter().filter(|m| m.is_worst).count(), 1);

        let january = patterns.iter().find(|m| m.month == 1).unwrap();
        let july = patterns.iter().find(|m| m.month == 7).unwrap();
        assert!(january.is_best);
        assert!(july.is_worst);
        assert_eq!(january.efficiency_rank, 1);
        assert!(july.efficiency_rank > january.efficiency_rank);
    }

    #[tokio::test]
    async fn critical_thresholds_are_monotonic() {
        let records: Vec<HistoricalRecord> = (0..100).map(|i| rec(1, 1, i as f64, 50.0)).collect();
        let analyzer = SiarHistoricalAnalyzer::new(records);
        let thresholds = analyzer.critical_thresholds().await;
        assert!(thresholds.temperature.p90 <= thresholds.temperature.p95);
        assert!(thresholds.temperature.p95 <= thresholds.temperature.p99);
    }

    #[tokio::test]
    async fn contextualize_flags_p99_breach_with_halt_recommendation() {
        let mut records: Vec<HistoricalRecord> = (0..100).map(|i| rec(1, 1, 15.0 + (i as f64) * 0.1, 50.0)).collect();
        records.push(rec(6, 1, 45.0, 50.0));
        let analyzer = SiarHistoricalAnalyzer::new(records);
        let forecast = vec![(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(), 45.0, 50.0)];
        let contexts = analyzer.contextualize(&forecast).await;
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].exceeded, ExceededThreshold::P99);
        assert_eq!(contexts[0].recommendation, "halt or shift to night");
    }
}
