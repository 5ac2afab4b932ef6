//! Wires every component together from loaded configuration: clients,
//! store, alert sink, and the orchestrator/backfill/forecast/analysis/
//! optimizer layers built on top of them. `main.rs` constructs one of
//! these at startup and hands it to the scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use crate::alerts::{AlertSink, RateLimitedAlertSink};
use crate::analysis::SiarHistoricalAnalyzer;
use crate::backfill::BackfillEngine;
use crate::clients::{AemetClient, OpenWeatherClient, ReeClient};
use crate::config::Config;
use crate::forecast::PriceForecaster;
use crate::gaps::GapDetector;
use crate::ingestion::IngestionOrchestrator;
use crate::optimizer::HourlyOptimizer;
use crate::timeseries::{InMemoryStore, TimeSeriesStore};

pub struct Container {
    pub store: Arc<dyn TimeSeriesStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub ree: Arc<ReeClient>,
    pub aemet: Arc<AemetClient>,
    pub openweather: Arc<OpenWeatherClient>,
    pub gap_detector: Arc<GapDetector>,
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub backfill: Arc<BackfillEngine>,
    pub forecaster: Arc<PriceForecaster>,
    pub analyzer: Arc<SiarHistoricalAnalyzer>,
    pub optimizer: Arc<HourlyOptimizer>,
}

impl Container {
    /// Builds every component from `config`. The time-series store is
    /// always the in-memory implementation for now — swapping in a real
    /// backing store only requires a new `TimeSeriesStore` impl, not a
    /// change here.
    pub fn build(config: &Config, state_dir: PathBuf) -> Self {
        let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryStore::new());

        let alerts: Arc<dyn AlertSink> = Arc::new(RateLimitedAlertSink::new(
            config.alerts.enabled,
            config.alerts.channel_token.clone(),
            config.alerts.target_id.clone(),
        ));

        let ree = Arc::new(ReeClient::new(&config.ree));
        let aemet = Arc::new(AemetClient::new(&config.aemet, state_dir.join("aemet_token")));
        let openweather = Arc::new(OpenWeatherClient::new(&config.openweather));

        let gap_detector = Arc::new(GapDetector::new(store.clone()));

        let orchestrator = Arc::new(IngestionOrchestrator::new(
            store.clone(),
            ree.clone(),
            aemet.clone(),
            openweather.clone(),
            alerts.clone(),
        ));

        let backfill = Arc::new(BackfillEngine::new(
            store.clone(),
            gap_detector.clone(),
            ree.clone(),
            aemet.clone(),
            alerts.clone(),
        ));

        let forecaster = Arc::new(PriceForecaster::new(
            store.clone(),
            alerts.clone(),
            PathBuf::from(&config.model.artifacts_dir),
            PathBuf::from(&config.model.metrics_log_path),
        ));

        let siar_csv = state_dir.join("siar_historical.csv");
        let analyzer = Arc::new(
            SiarHistoricalAnalyzer::load_csv(&siar_csv).unwrap_or_else(|_| SiarHistoricalAnalyzer::new(Vec::new())),
        );

        let optimizer = Arc::new(HourlyOptimizer::new(store.clone(), forecaster.clone(), analyzer.clone()));

        Self {
            store,
            alerts,
            ree,
            aemet,
            openweather,
            gap_detector,
            orchestrator,
            backfill,
            forecaster,
            analyzer,
            optimizer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AemetConfig, AlertsConfig, InfluxConfig, ModelConfig, OpenWeatherConfig, ReeConfig};

    fn test_config() -> Config {
        Config {
            auth_enabled: false,
            admin_allow_list: Vec::new(),
            forecasting_enabled_after_train: true,
            ree: ReeConfig {
                base_url: "http://localhost:1".to_string(),
                timeout_secs: 1,
            },
            aemet: AemetConfig {
                base_url: "http://localhost:1".to_string(),
                api_key: Some("key".to_string()),
                timeout_secs: 1,
                station_id: "5279X".to_string(),
            },
            openweather: OpenWeatherConfig {
                base_url: "http://localhost:1".to_string(),
                api_key: None,
                timeout_secs: 1,
                lat: 38.0,
                lon: -3.6,
            },
            influx: InfluxConfig {
                url: "http://localhost:8086".to_string(),
                org: String::new(),
                bucket: "energy_data".to_string(),
                token: None,
            },
            alerts: AlertsConfig {
                enabled: false,
                channel_token: None,
                target_id: None,
            },
            model: ModelConfig {
                artifacts_dir: "models/forecasting".to_string(),
                metrics_log_path: "models/metrics_history.csv".to_string(),
                train_months_back: 12,
            },
        }
    }

    #[test]
    fn container_builds_from_config_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::build(&test_config(), dir.path().to_path_buf());
        assert_eq!(container.analyzer.record_count(), 0);
    }
}
