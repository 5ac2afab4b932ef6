//! The canonical time-series point abstraction. Every writer (ingestion,
//! backfill) speaks Points; only `store` knows the storage dialect.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Bounded set of measurement names. Adding a third measurement means
/// adding a variant here, not threading a new string through every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    EnergyPrices,
    WeatherData,
}

impl Measurement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::EnergyPrices => "energy_prices",
            Measurement::WeatherData => "weather_data",
        }
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single time-series point: a measurement, a timestamp, low-cardinality
/// tags, and numeric fields. Every field is `f64` — integers are coerced at
/// construction so field types stay consistent across every writer
/// internal to this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: Measurement,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
}

impl Point {
    pub fn new(measurement: Measurement, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement,
            timestamp,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Inserts a numeric field. Accepts anything convertible to `f64` so
    /// integer-valued upstream payloads (e.g. humidity percentages) are
    /// coerced to float at the write boundary, per the type-consistency
    /// invariant.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<f64>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_opt(self, key: impl Into<String>, value: Option<impl Into<f64>>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// The tags that together with the measurement and timestamp make up a
    /// point's full identity for overwrite/idempotence purposes.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TagFilter(pub BTreeMap<String, String>);

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_coerces_integer_like_values_to_float() {
        let p = Point::new(Measurement::WeatherData, Utc::now())
            .tag("station_id", "5279X")
            .field("humidity", 62_i32 as f64);
        assert_eq!(p.fields["humidity"], 62.0);
    }

    #[test]
    fn tag_filter_requires_all_tags_to_match() {
        let mut tags = BTreeMap::new();
        tags.insert("provider".to_string(), "ree".to_string());
        tags.insert("tariff_period".to_string(), "P3".to_string());

        let filter = TagFilter::new().with("provider", "ree");
        assert!(filter.matches(&tags));

        let filter2 = TagFilter::new().with("provider", "aemet");
        assert!(!filter2.matches(&tags));
    }
}
