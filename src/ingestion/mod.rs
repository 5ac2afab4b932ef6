//! C3 — IngestionOrchestrator. Drives the 5-minute REE and weather
//! ingestion cycles: fetch from the live clients, normalize to `Point`s,
//! write through the store, and report per-cycle stats.

use chrono::{DateTime, Timelike, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alerts::{AlertSink, Severity as AlertSeverity};
use crate::clients::{AemetClient, OpenWeatherClient, ReeClient};
use crate::error::CoreResult;
use crate::timeseries::{Measurement, Point, TimeSeriesStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeatherSource {
    Aemet,
    OpenWeatherMap,
}

impl WeatherSource {
    fn tag(&self) -> &'static str {
        match self {
            WeatherSource::Aemet => "aemet",
            WeatherSource::OpenWeatherMap => "openweathermap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleStats {
    pub records_written: u64,
    pub success_rate: f64,
    pub source_used: Option<&'static str>,
    pub latency_ms: u64,
}

impl CycleStats {
    fn failed() -> Self {
        Self {
            records_written: 0,
            success_rate: 0.0,
            source_used: None,
            latency_ms: 0,
        }
    }

    fn ok(records_written: u64, source_used: &'static str, latency_ms: u64) -> Self {
        Self {
            records_written,
            success_rate: if records_written > 0 { 1.0 } else { 0.0 },
            source_used: Some(source_used),
            latency_ms,
        }
    }
}

/// Tracks consecutive failures per topic so the orchestrator can alert
/// after 3 in a row within an hour, instead of on every single failure.
struct FailureTracker {
    recent: VecDeque<DateTime<Utc>>,
}

impl FailureTracker {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
        }
    }

    /// Returns true the first time 3 failures land inside the trailing hour.
    fn record_failure(&mut self) -> bool {
        let now = Utc::now();
        self.recent.push_back(now);
        while let Some(&front) = self.recent.front() {
            if now - front > chrono::Duration::hours(1) {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len() == 3
    }

    fn record_success(&mut self) {
        self.recent.clear();
    }
}

pub struct IngestionOrchestrator {
    store: Arc<dyn TimeSeriesStore>,
    ree: Arc<ReeClient>,
    aemet: Arc<AemetClient>,
    openweather: Arc<OpenWeatherClient>,
    alerts: Arc<dyn AlertSink>,
    ree_failures: Mutex<FailureTracker>,
    weather_failures: Mutex<FailureTracker>,
}

impl IngestionOrchestrator {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        ree: Arc<ReeClient>,
        aemet: Arc<AemetClient>,
        openweather: Arc<OpenWeatherClient>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            ree,
            aemet,
            openweather,
            alerts,
            ree_failures: Mutex::new(FailureTracker::new()),
            weather_failures: Mutex::new(FailureTracker::new()),
        }
    }

    /// Fetches today's REE prices and writes any hours not already present.
    /// Scheduled every 5 minutes; REE only republishes the current day, so
    /// each cycle effectively just fills in newly-published hours.
    pub async fn ingest_ree(&self) -> CycleStats {
        let started = std::time::Instant::now();
        let today = Utc::now().date_naive();
        let result: CoreResult<u64> = async {
            let records = self.ree.fetch_prices(today, today).await?;
            let points: Vec<Point> = records
                .into_iter()
                .map(|r| {
                    Point::new(Measurement::EnergyPrices, r.timestamp)
                        .tag("provider", "ree")
                        .tag("data_source", "ree_realtime")
                        .tag("tariff_period", r.tariff_period)
                        .field("price_eur_kwh", r.price_eur_kwh)
                        .field_opt("demand_mw", r.demand_mw)
                })
                .collect();
            let n = points.len() as u64;
            self.store.write_points(points).await?;
            Ok(n)
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(n) => {
                self.ree_failures.lock().await.record_success();
                info!(records = n, latency_ms, "ingested REE prices");
                CycleStats::ok(n, "ree", latency_ms)
            }
            Err(e) => {
                error!(error = %e, "REE ingestion cycle failed");
                let tripped = self.ree_failures.lock().await.record_failure();
                if tripped {
                    self.alerts
                        .send(
                            "ree_ingestion_failure",
                            AlertSeverity::Warning,
                            "REE ingestion failed 3 times within the last hour",
                        )
                        .await;
                }
                CycleStats::failed()
            }
        }
    }

    /// Hybrid weather ingestion: AEMET is authoritative for the 00:00-08:00
    /// UTC window (their convencional-observation cadence lines up with the
    /// overnight/morning shift the factory cares about); OpenWeatherMap is
    /// preferred the rest of the day. Whichever source fails, the other is
    /// tried and the written points are tagged with the source actually
    /// used, not the one originally preferred.
    pub async fn ingest_weather_hybrid(&self) -> CycleStats {
        let started = std::time::Instant::now();
        let preferred = preferred_weather_source(Utc::now());

        let primary = self.fetch_weather_from(&preferred).await;
        let (points, source_used) = match primary {
            Ok(points) => (points, preferred.clone()),
            Err(primary_err) => {
                warn!(
                    source = preferred.tag(),
                    error = %primary_err,
                    "preferred weather source failed, falling back"
                );
                let fallback = other_source(&preferred);
                match self.fetch_weather_from(&fallback).await {
                    Ok(points) => (points, fallback),
                    Err(fallback_err) => {
                        error!(
                            primary = %primary_err,
                            fallback = %fallback_err,
                            "both weather sources failed this cycle"
                        );
                        let tripped = self.weather_failures.lock().await.record_failure();
                        if tripped {
                            self.alerts
                                .send(
                                    "weather_ingestion_failure",
                                    AlertSeverity::Warning,
                                    "weather ingestion failed 3 times within the last hour",
                                )
                                .await;
                        }
                        let latency_ms = started.elapsed().as_millis() as u64;
                        return CycleStats {
                            records_written: 0,
                            success_rate: 0.0,
                            source_used: None,
                            latency_ms,
                        };
                    }
                }
            }
        };

        self.weather_failures.lock().await.record_success();
        let n = points.len() as u64;
        if let Err(e) = self.store.write_points(points).await {
            error!(error = %e, "failed to write weather points after successful fetch");
            return CycleStats::failed();
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        info!(records = n, source = source_used.tag(), latency_ms, "ingested weather data");
        CycleStats::ok(n, source_used.tag(), latency_ms)
    }

    async fn fetch_weather_from(&self, source: &WeatherSource) -> CoreResult<Vec<Point>> {
        match source {
            WeatherSource::Aemet => {
                let obs = self.aemet.fetch_current_observation().await?;
                Ok(obs
                    .into_iter()
                    .map(|o| {
                        Point::new(Measurement::WeatherData, o.timestamp)
                            .tag("station_id", o.station_id)
                            .tag("station_name", o.station_name)
                            .tag("province", o.province)
                            .tag("data_source", "aemet")
                            .tag("data_type", "observed")
                            .field_opt("temperature", o.temperature)
                            .field_opt("humidity", o.humidity)
                            .field_opt("pressure", o.pressure)
                            .field_opt("wind_speed", o.wind_speed)
                            .field_opt("wind_direction", o.wind_direction)
                            .field_opt("precipitation", o.precipitation)
                    })
                    .collect())
            }
            WeatherSource::OpenWeatherMap => {
                let obs = self.openweather.fetch_current().await?;
                Ok(vec![Point::new(Measurement::WeatherData, obs.timestamp)
                    .tag("data_source", "openweathermap")
                    .tag("data_type", "observed")
                    .field("temperature", obs.temperature)
                    .field("humidity", obs.humidity)
                    .field("pressure", obs.pressure)
                    .field("wind_speed", obs.wind_speed)
                    .field("wind_direction", obs.wind_direction)])
            }
        }
    }

    /// Manual trigger for an arbitrary historical day, used by the
    /// operator-facing "ingest this specific day again" workflow; shares
    /// the same normalization path as the scheduled cycle.
    pub async fn ingest_manual(&self, day: chrono::NaiveDate) -> CoreResult<u64> {
        let records = self.ree.fetch_prices(day, day).await?;
        let points: Vec<Point> = records
            .into_iter()
            .map(|r| {
                Point::new(Measurement::EnergyPrices, r.timestamp)
                    .tag("provider", "ree")
                    .tag("data_source", "ree_manual")
                    .tag("tariff_period", r.tariff_period)
                    .field("price_eur_kwh", r.price_eur_kwh)
                    .field_opt("demand_mw", r.demand_mw)
            })
            .collect();
        let n = points.len() as u64;
        self.store.write_points(points).await?;
        Ok(n)
    }
}

fn preferred_weather_source(now: DateTime<Utc>) -> WeatherSource {
    if now.hour() < 8 {
        WeatherSource::Aemet
    } else {
        WeatherSource::OpenWeatherMap
    }
}

fn other_source(source: &WeatherSource) -> WeatherSource {
    match source {
        WeatherSource::Aemet => WeatherSource::OpenWeatherMap,
        WeatherSource::OpenWeatherMap => WeatherSource::Aemet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn preferred_source_switches_at_8am_utc() {
        let midnight = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2026, 1, 1, 7, 59, 0).unwrap();
        let afternoon = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 1, 1, 20, 0, 0).unwrap();

        assert_eq!(preferred_weather_source(midnight), WeatherSource::Aemet);
        assert_eq!(preferred_weather_source(morning), WeatherSource::Aemet);
        assert_eq!(preferred_weather_source(afternoon), WeatherSource::OpenWeatherMap);
        assert_eq!(preferred_weather_source(evening), WeatherSource::OpenWeatherMap);
    }

    #[test]
    fn other_source_is_the_complement() {
        assert_eq!(other_source(&WeatherSource::Aemet), WeatherSource::OpenWeatherMap);
        assert_eq!(other_source(&WeatherSource::OpenWeatherMap), WeatherSource::Aemet);
    }

    #[tokio::test]
    async fn failure_tracker_trips_on_third_failure_within_window() {
        let mut tracker = FailureTracker::new();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[tokio::test]
    async fn failure_tracker_resets_on_success() {
        let mut tracker = FailureTracker::new();
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        assert!(!tracker.record_failure());
    }

}
