//! OpenWeatherMap client. Fetches current conditions and the 3-hour-step
//! 5-day forecast; ingestion only ever writes `current`, the forecast is
//! surfaced for diagnostics. Shares the same retry/rate-limit contract as
//! the REE and AEMET clients.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::common::{retry_fixed_delay, RateLimiter};
use crate::config::OpenWeatherConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentWeather {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    pressure: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Debug, Deserialize)]
struct OwmCurrentResponse {
    dt: i64,
    main: OwmMain,
    wind: OwmWind,
}

#[derive(Debug, Deserialize)]
struct OwmForecastElem {
    dt: i64,
    main: OwmMain,
}

#[derive(Debug, Deserialize)]
struct OwmForecastResponse {
    list: Vec<OwmForecastElem>,
}

pub struct OpenWeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    lat: f64,
    lon: f64,
    limiter: RateLimiter,
}

impl OpenWeatherClient {
    pub fn new(config: &OpenWeatherConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            lat: config.lat,
            lon: config.lon,
            // OpenWeatherMap's free-tier cap is 60 req/min.
            limiter: RateLimiter::new("openweathermap", 60, Duration::from_secs(60)),
        }
    }

    pub async fn fetch_current(&self) -> CoreResult<CurrentWeather> {
        let url = self.url("weather");
        let resp: OwmCurrentResponse = retry_fixed_delay("openweathermap", 3, Duration::from_secs(1), || {
            self.get_json(&url)
        })
        .await?;
        let timestamp = Utc
            .timestamp_opt(resp.dt, 0)
            .single()
            .ok_or_else(|| CoreError::ValidationError("invalid OWM timestamp".to_string()))?;
        info!(timestamp = %timestamp, "fetched OpenWeatherMap current observation");
        Ok(CurrentWeather {
            timestamp,
            temperature: resp.main.temp,
            humidity: resp.main.humidity,
            pressure: resp.main.pressure,
            wind_speed: resp.wind.speed,
            wind_direction: resp.wind.deg,
        })
    }

    /// 3-hour-step forecast, used only for diagnostics; never written to
    /// the store by the ingestion path.
    pub async fn fetch_forecast(&self) -> CoreResult<Vec<ForecastPoint>> {
        let url = self.url("forecast");
        let resp: OwmForecastResponse = retry_fixed_delay("openweathermap", 3, Duration::from_secs(1), || {
            self.get_json(&url)
        })
        .await?;
        Ok(resp
            .list
            .into_iter()
            .filter_map(|e| {
                let timestamp = Utc.timestamp_opt(e.dt, 0).single()?;
                Some(ForecastPoint {
                    timestamp,
                    temperature: e.main.temp,
                    humidity: e.main.humidity,
                })
            })
            .collect())
    }

    /// `units=metric` keeps `temperature` in Celsius, matching AEMET and
    /// the `weather_data` measurement's field semantics — OpenWeatherMap
    /// defaults to Kelvin otherwise, which would silently poison any
    /// correlation or threshold computed across both weather sources.
    fn url(&self, path: &str) -> String {
        if cfg!(feature = "use_remote_api") {
            format!(
                "{}/{}?lat={}&lon={}&units=metric&appid={}",
                self.base_url,
                path,
                self.lat,
                self.lon,
                self.api_key.as_deref().unwrap_or("")
            )
        } else {
            format!("{}/{}?lat={}&lon={}&units=metric", self.base_url, path, self.lat, self.lon)
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> CoreResult<T> {
        self.limiter.acquire().await;
        debug!(url, "fetching OpenWeatherMap data");

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream {
                source_name: "openweathermap",
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::TransientUpstream {
                source_name: "openweathermap",
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(CoreError::ValidationError(format!(
                "OpenWeatherMap returned {status} for {url}"
            )));
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_current_parses_mock_response() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "dt": 1_729_670_400_i64,
            "main": {"temp": 295.1, "pressure": 1012.0, "humidity": 48.0},
            "wind": {"speed": 3.2, "deg": 180.0}
        });
        let _m = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let config = OpenWeatherConfig {
            base_url: server.url(),
            api_key: None,
            timeout_secs: 5,
            lat: 38.09,
            lon: -3.64,
        };
        let client = OpenWeatherClient::new(&config);
        let obs = client.fetch_current().await.unwrap();
        assert_eq!(obs.temperature, 295.1);
        assert_eq!(obs.wind_direction, 180.0);
    }

    #[tokio::test]
    async fn fetch_current_retries_on_server_error_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "dt": 1_729_670_400_i64,
            "main": {"temp": 290.0, "pressure": 1000.0, "humidity": 60.0},
            "wind": {"speed": 1.0, "deg": 90.0}
        });
        let _m1 = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let config = OpenWeatherConfig {
            base_url: server.url(),
            api_key: None,
            timeout_secs: 5,
            lat: 0.0,
            lon: 0.0,
        };
        let client = OpenWeatherClient::new(&config);
        let obs = client.fetch_current().await.unwrap();
        assert_eq!(obs.temperature, 290.0);
    }
}
