//! REE (Red Eléctrica de España) spot-price client. Fetches hourly PVPC
//! prices for a date range, no auth required. Ranges longer than one day
//! are split into daily chunks, since REE's API only accepts single-day
//! windows reliably.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::common::{retry_fixed_delay, RateLimiter};
use crate::config::ReeConfig;
use crate::error::{CoreError, CoreResult};

/// One hourly PVPC record as normalized by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub timestamp: DateTime<Utc>,
    pub price_eur_kwh: f64,
    pub tariff_period: &'static str,
    pub demand_mw: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReeDayResponse {
    #[serde(rename = "PVPC")]
    pvpc: Vec<ReeHourEntry>,
}

#[derive(Debug, Deserialize)]
struct ReeHourEntry {
    #[serde(rename = "Dia")]
    day: String,
    #[serde(rename = "Hora")]
    hour: String,
    #[serde(rename = "PCB")]
    price_cent_kwh: String,
    #[serde(rename = "DEMANDA")]
    demand_mw: Option<String>,
}

/// Valley/peak tariff period for a given local hour, per the standard
/// six-period PVPC calendar (P1 peak .. P6 deep valley). Simplified to a
/// fixed day-of-week-independent table since the exact calendar rules are
/// out of scope for this client; callers needing the full regulatory
/// calendar should treat this as an approximation.
pub fn tariff_period_for_hour(hour: u32) -> &'static str {
    match hour {
        0..=7 => "P6",
        8..=9 => "P4",
        10..=13 => "P3",
        14..=17 => "P2",
        18..=21 => "P1",
        _ => "P2",
    }
}

pub struct ReeClient {
    http: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

impl ReeClient {
    pub fn new(config: &ReeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: config.base_url.clone(),
            // 30 req / 1 min keeps us well under REE's public rate limit.
            limiter: RateLimiter::new("ree", 30, Duration::from_secs(60)),
        }
    }

    /// Fetches hourly PVPC prices for `[start_date, end_date]` inclusive,
    /// splitting into one request per day for ranges longer than a
    /// single day.
    pub async fn fetch_prices(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> CoreResult<Vec<PriceRecord>> {
        if start_date > end_date {
            return Err(CoreError::ValidationError(format!(
                "start_date {start_date} is after end_date {end_date}"
            )));
        }

        let mut all = Vec::new();
        let mut day = start_date;
        while day <= end_date {
            let mut records = self.fetch_day(day).await?;
            all.append(&mut records);
            day += ChronoDuration::days(1);
        }
        Ok(all)
    }

    async fn fetch_day(&self, day: NaiveDate) -> CoreResult<Vec<PriceRecord>> {
        let url = format!("{}/PVPC/{}", self.base_url, day.format("%Y/%m/%d"));
        retry_fixed_delay(
            "ree",
            3,
            // REE's documented 429 cooldown is 60-120s fixed; we pick the
            // low end and let the caller's own cadence absorb the rest.
            Duration::from_secs(60),
            || self.fetch_day_once(&url, day),
        )
        .await
    }

    async fn fetch_day_once(&self, url: &str, day: NaiveDate) -> CoreResult<Vec<PriceRecord>> {
        self.limiter.acquire().await;
        debug!(url, "fetching REE prices");

        let resp = self.http.get(url).send().await.map_err(|e| {
            CoreError::TransientUpstream {
                source_name: "ree",
                message: e.to_string(),
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(CoreError::TransientUpstream {
                source_name: "ree",
                message: "rate limited (429)".to_string(),
            });
        }
        if status.is_server_error() {
            return Err(CoreError::TransientUpstream {
                source_name: "ree",
                message: format!("server error {status}"),
            });
        }
        if !status.is_success() {
            return Err(CoreError::ValidationError(format!(
                "REE returned {status} for {url}"
            )));
        }

        let body: ReeDayResponse = resp.json().await?;
        let mut out = Vec::with_capacity(body.pvpc.len());
        for entry in body.pvpc {
            let Some(record) = parse_entry(&entry, day) else {
                continue;
            };
            out.push(record);
        }
        info!(day = %day, count = out.len(), "fetched REE hourly prices");
        Ok(out)
    }
}

fn parse_entry(entry: &ReeHourEntry, fallback_day: NaiveDate) -> Option<PriceRecord> {
    let hour: u32 = entry.hour.split('-').next()?.trim().parse().ok()?;
    let date = NaiveDate::parse_from_str(&entry.day, "%d/%m/%Y").unwrap_or(fallback_day);
    let naive = date.and_hms_opt(hour, 0, 0)?;
    let timestamp = Utc.from_utc_datetime(&naive);

    let price_cent_kwh: f64 = entry
        .price_cent_kwh
        .replace(',', ".")
        .trim()
        .parse()
        .ok()?;
    let demand_mw = entry
        .demand_mw
        .as_ref()
        .and_then(|d| d.replace(',', ".").trim().parse::<f64>().ok());

    Some(PriceRecord {
        timestamp,
        price_eur_kwh: price_cent_kwh / 100.0,
        tariff_period: tariff_period_for_hour(hour),
        demand_mw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tariff_period_buckets_cover_all_hours() {
        for h in 0..24 {
            assert!(!tariff_period_for_hour(h).is_empty());
        }
        assert_eq!(tariff_period_for_hour(3), "P6");
        assert_eq!(tariff_period_for_hour(19), "P1");
    }

    #[test]
    fn parse_entry_converts_cents_to_euros_and_comma_decimals() {
        let entry = ReeHourEntry {
            day: "23/10/2025".to_string(),
            hour: "14-15".to_string(),
            price_cent_kwh: "18,542".to_string(),
            demand_mw: Some("24500,3".to_string()),
        };
        let record = parse_entry(&entry, NaiveDate::from_ymd_opt(2025, 10, 23).unwrap()).unwrap();
        assert!((record.price_eur_kwh - 0.18542).abs() < 1e-9);
        assert_eq!(record.tariff_period, "P2");
        assert!((record.demand_mw.unwrap() - 24500.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fetch_prices_rejects_inverted_range() {
        let config = ReeConfig {
            base_url: "http://localhost:1".to_string(),
            timeout_secs: 1,
        };
        let client = ReeClient::new(&config);
        let start = NaiveDate::from_ymd_opt(2025, 10, 23).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 10, 20).unwrap();
        let result = client.fetch_prices(start, end).await;
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }
}
