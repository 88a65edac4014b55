//! Weather data sources.
//!
//! Every provider hands back the same hourly [`WeatherRecord`] rows, sorted
//! ascending by timestamp, so the pipeline never cares where weather came
//! from. Fetch failures are typed: the caller decides whether "no new data"
//! is fatal (an explicit fetch command) or survivable (a scheduled refresh).

pub mod openmeteo;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One hour of weather, the exact shape the feature builder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub timestamp: i64,
    pub ghi_wm2: f64,
    pub cloud_cover_pct: u8,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub humidity_pct: u8,
    /// None when the stored row predates diffuse-radiation support; the
    /// dataset assembler estimates the value from GHI and cloud cover.
    pub dhi_wm2: Option<f64>,
    pub dni_wm2: f64,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("weather request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("weather API returned status {status}")]
    Status { status: u16 },

    #[error("weather response did not match the expected schema: {0}")]
    Schema(String),

    #[error("weather fetch gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("unknown weather source '{0}' (available: open-meteo)")]
    UnknownSource(String),
}

/// A provider of hourly weather rows for one fixed location.
#[async_trait]
pub trait WeatherSource: Send + Sync + std::fmt::Debug {
    /// Stable identifier, used as the source tag in forecast history.
    fn name(&self) -> &'static str;

    /// Hourly forecast starting at the current hour.
    async fn fetch_forecast(&self, hours: usize) -> Result<Vec<WeatherRecord>, SourceError>;

    /// Every hour of the current local day, observed hours included.
    async fn fetch_today(&self) -> Result<Vec<WeatherRecord>, SourceError>;

    /// Archive rows covering the whole days `start..=end`.
    async fn fetch_historical(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<WeatherRecord>, SourceError>;

    /// Days this source can serve historically.
    fn available_range(&self) -> (NaiveDate, NaiveDate);
}

/// Look up a provider by its CLI name.
pub fn create_source(
    name: &str,
    latitude: f64,
    longitude: f64,
    timezone: Tz,
) -> Result<Box<dyn WeatherSource>, SourceError> {
    match name {
        "open-meteo" => Ok(Box::new(openmeteo::OpenMeteo::new(
            latitude, longitude, timezone,
        ))),
        other => Err(SourceError::UnknownSource(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_source_known_and_unknown() {
        let source = create_source("open-meteo", 51.83, 7.28, chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(source.name(), "open-meteo");

        let err = create_source("noaa", 51.83, 7.28, chrono_tz::UTC).unwrap_err();
        assert!(matches!(err, SourceError::UnknownSource(name) if name == "noaa"));
    }
}
