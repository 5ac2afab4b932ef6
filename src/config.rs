//! Process configuration, layered environment-over-defaults the way
//! `jsprague84-weathrs` wires up its `config` crate `Settings`.

use serde::Deserialize;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReeConfig {
    #[serde(default = "default_ree_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ree_base_url() -> String {
    "https://api.esios.ree.es".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AemetConfig {
    #[serde(default = "default_aemet_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_aemet_station")]
    pub station_id: String,
}

fn default_aemet_base_url() -> String {
    "https://opendata.aemet.es/opendata".to_string()
}

fn default_aemet_station() -> String {
    "5279X".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenWeatherConfig {
    #[serde(default = "default_owm_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
}

fn default_owm_base_url() -> String {
    "https://api.openweathermap.org/data/2.5".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub token: Option<String>,
}

fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_bucket() -> String {
    "energy_data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,
    pub channel_token: Option<String>,
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_models_dir")]
    pub artifacts_dir: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_log_path: String,
    #[serde(default = "default_months_back")]
    pub train_months_back: u32,
}

fn default_models_dir() -> String {
    "models/forecasting".to_string()
}

fn default_metrics_path() -> String {
    "models/metrics_history.csv".to_string()
}

fn default_months_back() -> u32 {
    12
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_false")]
    pub auth_enabled: bool,
    #[serde(default)]
    pub admin_allow_list: Vec<String>,
    #[serde(default = "default_true")]
    pub forecasting_enabled_after_train: bool,

    pub ree: ReeConfig,
    pub aemet: AemetConfig,
    pub openweather: OpenWeatherConfig,
    pub influx: InfluxConfig,
    pub alerts: AlertsConfig,
    pub model: ModelConfig,
}

impl Config {
    /// Loads configuration from environment variables, with safe defaults
    /// for everything that isn't a credential. Prefixes follow the
    /// `SECTION__FIELD` convention the `config` crate expects (e.g.
    /// `AEMET__API_KEY`, `INFLUX__TOKEN`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("ree.base_url", default_ree_base_url())?
            .set_default("ree.timeout_secs", default_timeout_secs() as i64)?
            .set_default("aemet.base_url", default_aemet_base_url())?
            .set_default("aemet.station_id", default_aemet_station())?
            .set_default("aemet.timeout_secs", default_timeout_secs() as i64)?
            .set_default("openweather.base_url", default_owm_base_url())?
            .set_default("openweather.timeout_secs", default_timeout_secs() as i64)?
            .set_default("openweather.lat", 38.0952)?
            .set_default("openweather.lon", -3.6419)?
            .set_default("influx.url", default_influx_url())?
            .set_default("influx.bucket", default_bucket())?
            .set_default("influx.org", "")?
            .set_default("alerts.enabled", false)?
            .set_default("model.artifacts_dir", default_models_dir())?
            .set_default("model.metrics_log_path", default_metrics_path())?
            .set_default("model.train_months_back", default_months_back() as i64)?
            .set_default("auth_enabled", false)?
            .set_default("forecasting_enabled_after_train", true)?
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

pub fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
