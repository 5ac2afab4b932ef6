pub mod aemet;
pub mod common;
pub mod openweather;
pub mod ree;

pub use aemet::AemetClient;
pub use openweather::OpenWeatherClient;
pub use ree::{tariff_period_for_hour, ReeClient};

/// Capability markers so the orchestrator and backfill engine can compose
/// by interface rather than by concrete client type: `ReeClient`,
/// `AemetClient`, and `OpenWeatherClient` each satisfy one or more of
/// these.
pub trait PriceSource: Send + Sync {}
pub trait CurrentWeatherSource: Send + Sync {}
pub trait HistoricalWeatherSource: Send + Sync {}

impl PriceSource for ReeClient {}
impl CurrentWeatherSource for AemetClient {}
impl HistoricalWeatherSource for AemetClient {}
impl CurrentWeatherSource for OpenWeatherClient {}
