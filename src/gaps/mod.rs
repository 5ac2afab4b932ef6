//! C4 — GapDetector. Scans a measurement's timestamps over a window and
//! emits gap descriptors with a severity bucket.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::timeseries::{Measurement, TagFilter, TimeSeriesStore};

/// Hourly cadence for both measurements.
pub const EXPECTED_INTERVAL: ChronoDuration = ChronoDuration::hours(1);
/// A gap is any interval longer than 1.5x the expected cadence.
const GAP_THRESHOLD_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Minor,
    Moderate,
    Critical,
}

impl Severity {
    pub fn from_duration_hours(hours: f64) -> Self {
        if hours <= 2.0 {
            Severity::Minor
        } else if hours <= 12.0 {
            Severity::Moderate
        } else {
            Severity::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub measurement: Measurement,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_hours: f64,
    pub expected_records: u64,
    pub severity: Severity,
}

impl Gap {
    fn new(measurement: Measurement, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let duration_hours = (end_time - start_time).num_seconds() as f64 / 3600.0;
        let expected_records = duration_hours.floor().max(0.0) as u64;
        Self {
            measurement,
            start_time,
            end_time,
            duration_hours,
            expected_records,
            severity: Severity::from_duration_hours(duration_hours),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GapSummary {
    pub ree_gap_hours: f64,
    pub weather_gap_hours: f64,
    pub last_ree_ts: Option<DateTime<Utc>>,
    pub last_weather_ts: Option<DateTime<Utc>>,
}

pub struct GapDetector {
    store: Arc<dyn TimeSeriesStore>,
}

impl GapDetector {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Scans `measurement` (filtered by `tags`) over `[window_start,
    /// window_end]` and returns one gap descriptor per contiguous gap.
    ///
    /// Edge cases:
    /// - no data at all → a single `critical` gap covering the full window.
    /// - a missing tail (latest point older than `now - expected_interval`)
    ///   → a gap from `latest` to `now`.
    pub async fn detect_gaps(
        &self,
        measurement: Measurement,
        tags: &TagFilter,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> crate::error::CoreResult<Vec<Gap>> {
        let rows = self
            .store
            .query_range(measurement, tags, window_start, window_end)
            .await?;

        if rows.is_empty() {
            debug!(measurement = %measurement, "no data in window, emitting full-window gap");
            return Ok(vec![Gap::new(measurement, window_start, window_end)]);
        }

        let mut timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
        timestamps.sort();
        timestamps.dedup();

        let threshold = ChronoDuration::seconds(
            (EXPECTED_INTERVAL.num_seconds() as f64 * GAP_THRESHOLD_MULTIPLIER) as i64,
        );

        let mut gaps = Vec::new();
        for pair in timestamps.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b - a > threshold {
                gaps.push(Gap::new(measurement, a, b));
            }
        }

        // Missing tail: nothing after the last point up to `now` (bounded
        // by window_end, since detection is always scoped to a window).
        let now = window_end.min(Utc::now());
        if let Some(&last) = timestamps.last() {
            if now - last > threshold {
                gaps.push(Gap::new(measurement, last, now));
            }
        }

        Ok(gaps)
    }

    /// Rolled-up view used by `/gaps/summary`: the current REE and weather
    /// gap size in hours, derived from `CountInRange`-backed detection
    /// (never the advisory status, which can lag).
    pub async fn summary(&self) -> crate::error::CoreResult<GapSummary> {
        let now = Utc::now();
        let window_start = now - ChronoDuration::days(2);

        let ree_tags = TagFilter::new().with("provider", "ree");
        let ree_gaps = self
            .detect_gaps(Measurement::EnergyPrices, &ree_tags, window_start, now)
            .await?;
        let ree_gap_hours = ree_gaps.iter().map(|g| g.duration_hours).fold(0.0, f64::max);
        let last_ree_ts = self
            .store
            .latest_timestamp(Measurement::EnergyPrices, &ree_tags)
            .await?;

        let weather_tags = TagFilter::new();
        let weather_gaps = self
            .detect_gaps(Measurement::WeatherData, &weather_tags, window_start, now)
            .await?;
        let weather_gap_hours = weather_gaps
            .iter()
            .map(|g| g.duration_hours)
            .fold(0.0, f64::max);
        let last_weather_ts = self
            .store
            .latest_timestamp(Measurement::WeatherData, &weather_tags)
            .await?;

        Ok(GapSummary {
            ree_gap_hours,
            weather_gap_hours,
            last_ree_ts,
            last_weather_ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{InMemoryStore, Point};
    use claim::assert_ge;
    use proptest::prelude::*;

    #[tokio::test]
    async fn empty_measurement_yields_single_critical_gap() {
        let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryStore::new());
        let detector = GapDetector::new(store);
        let now = Utc::now();
        let gaps = detector
            .detect_gaps(
                Measurement::EnergyPrices,
                &TagFilter::new(),
                now - ChronoDuration::hours(48),
                now,
            )
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].severity, Severity::Critical);
    }

    proptest! {
        /// Severity is a non-decreasing step function of the gap duration:
        /// widening a gap never demotes its severity.
        #[test]
        fn severity_is_monotonic_in_duration(a in 0.0f64..500.0, extra in 0.0f64..500.0) {
            let b = a + extra;
            let rank = |s: Severity| match s {
                Severity::Minor => 0,
                Severity::Moderate => 1,
                Severity::Critical => 2,
            };
            assert_ge!(rank(Severity::from_duration_hours(b)), rank(Severity::from_duration_hours(a)));
        }

        /// `Gap::new` always derives a non-negative duration and an
        /// `expected_records` count that never overshoots the duration.
        #[test]
        fn gap_new_duration_is_never_negative(hours in 0.0f64..1000.0) {
            let start = Utc::now();
            let end = start + ChronoDuration::milliseconds((hours * 3_600_000.0) as i64);
            let gap = Gap::new(Measurement::EnergyPrices, start, end);
            assert_ge!(gap.duration_hours, 0.0);
            assert_ge!(gap.duration_hours + 1.0, gap.expected_records as f64);
        }
    }

    #[test]
    fn severity_thresholds_are_strictly_ordered() {
        assert_eq!(Severity::from_duration_hours(2.0), Severity::Minor);
        assert_eq!(Severity::from_duration_hours(2.01), Severity::Moderate);
        assert_eq!(Severity::from_duration_hours(12.0), Severity::Moderate);
        assert_eq!(Severity::from_duration_hours(12.01), Severity::Critical);
    }

    #[tokio::test]
    async fn summary_reports_last_timestamp_per_measurement() {
        let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let ree_point = Point::new(Measurement::EnergyPrices, now - ChronoDuration::hours(1))
            .tag("provider", "ree")
            .field("price_eur_kwh", 0.1_f64);
        let weather_point = Point::new(Measurement::WeatherData, now - ChronoDuration::hours(3))
            .tag("data_source", "aemet")
            .field("temperature", 18.0_f64);
        store.write_points(vec![ree_point, weather_point]).await.unwrap();

        let detector = GapDetector::new(store);
        let summary = detector.summary().await.unwrap();
        assert!(summary.last_ree_ts.is_some());
        assert!(summary.last_weather_ts.is_some());
        assert!(summary.last_weather_ts.unwrap() < summary.last_ree_ts.unwrap());
    }

    #[tokio::test]
    async fn moderate_gap_between_two_writes_is_detected() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let early = now - ChronoDuration::hours(10);
        let late = now - ChronoDuration::hours(2);

        let mk = |ts: DateTime<Utc>| {
            Point::new(Measurement::EnergyPrices, ts)
                .tag("provider", "ree")
                .field("price_eur_kwh", 0.1_f64)
        };
        store.write_points(vec![mk(early), mk(late)]).await.unwrap();

        let store_dyn: Arc<dyn TimeSeriesStore> = store;
        let detector = GapDetector::new(store_dyn);
        let gaps = detector
            .detect_gaps(
                Measurement::EnergyPrices,
                &TagFilter::new().with("provider", "ree"),
                now - ChronoDuration::hours(24),
                now,
            )
            .await
            .unwrap();

        let between = gaps
            .iter()
            .find(|g| g.start_time == early && g.end_time == late)
            .expect("gap between the two writes");
        assert_eq!(between.severity, Severity::Moderate);
        assert!(between.duration_hours > 1.5 * 1.0);
        assert!(between.start_time < between.end_time);
    }

    #[tokio::test]
    async fn missing_tail_is_reported_as_a_gap_to_now() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let stale = now - ChronoDuration::hours(20);
        let point = Point::new(Measurement::WeatherData, stale)
            .tag("data_source", "aemet")
            .field("temperature", 18.0_f64);
        store.write_points(vec![point]).await.unwrap();

        let store_dyn: Arc<dyn TimeSeriesStore> = store;
        let detector = GapDetector::new(store_dyn);
        let gaps = detector
            .detect_gaps(
                Measurement::WeatherData,
                &TagFilter::new(),
                now - ChronoDuration::hours(24),
                now,
            )
            .await
            .unwrap();
        let tail_gap = gaps.iter().find(|g| g.end_time == now).unwrap();
        assert_eq!(tail_gap.start_time, stale);
    }
}
