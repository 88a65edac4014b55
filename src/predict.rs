//! Production Forecasting
//!
//! Runs a trained pipeline over forecast weather rows and post-processes the
//! raw regression output into physical hourly watts. Post-processing order
//! matters: clamp negatives to zero first, then force night hours (sun below
//! the horizon) to exactly zero, then cast to integer watts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::features::build_features;
use crate::model::{ModelError, Pipeline};
use crate::sources::WeatherRecord;

/// One forecast hour, carrying the weather inputs it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub timestamp: i64,
    pub production_w: i64,
    pub ghi_wm2: f64,
    pub cloud_cover_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub generated_at: DateTime<Utc>,
    pub model_version: String,
    pub hours: Vec<HourlyForecast>,
    /// Sum of hourly watts over 1000, rounded to two decimals. Each hourly
    /// power value counts as constant across its hour, so W and Wh coincide.
    pub total_kwh: f64,
}

impl Forecast {
    fn empty(model_version: &str) -> Self {
        Self {
            generated_at: Utc::now(),
            model_version: model_version.to_string(),
            hours: Vec::new(),
            total_kwh: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }

    /// Hour with the highest predicted production, earliest wins ties.
    pub fn peak(&self) -> Option<&HourlyForecast> {
        self.hours.iter().max_by_key(|h| (h.production_w, -h.timestamp))
    }
}

/// Forecast hourly production for the given weather rows, preserving input
/// order. Empty weather input is a valid condition (provider outage, no
/// rows for the requested window) and yields an empty forecast.
pub fn predict(
    pipeline: &Pipeline,
    model_version: &str,
    weather: &[WeatherRecord],
    latitude: f64,
    longitude: f64,
) -> Result<Forecast, ModelError> {
    if weather.is_empty() {
        return Ok(Forecast::empty(model_version));
    }

    let features = build_features(weather, latitude, longitude);
    let raw = pipeline.predict(&features)?;

    let mut hours = Vec::with_capacity(weather.len());
    for ((record, row), value) in weather.iter().zip(&features).zip(raw) {
        let clamped = value.max(0.0);
        // The night floor overrides the model: the sun being down is
        // authoritative no matter what the regressor thinks.
        let watts = if row.sun_elevation < 0.0 { 0.0 } else { clamped };

        hours.push(HourlyForecast {
            timestamp: record.timestamp,
            production_w: watts as i64,
            ghi_wm2: record.ghi_wm2,
            cloud_cover_pct: record.cloud_cover_pct,
        });
    }

    let total_wh: i64 = hours.iter().map(|h| h.production_w).sum();
    let total_kwh = (total_wh as f64 / 1000.0 * 100.0).round() / 100.0;

    Ok(Forecast {
        generated_at: Utc::now(),
        model_version: model_version.to_string(),
        hours,
        total_kwh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_COUNT;
    use crate::model::{BoostCapability, ForestParams, ModelParams, PipelineSpec};

    const LAT: f64 = 51.83;
    const LON: f64 = 7.28;
    const NOON_UTC: i64 = 1_717_243_200; // 2024-06-01 12:00 UTC
    const MIDNIGHT_UTC: i64 = 1_717_200_000; // 2024-06-01 00:00 UTC

    fn record(timestamp: i64, ghi: f64, cloud: u8) -> WeatherRecord {
        WeatherRecord {
            timestamp,
            ghi_wm2: ghi,
            cloud_cover_pct: cloud,
            temperature_c: 18.0,
            wind_speed_ms: 3.0,
            humidity_pct: 55,
            dhi_wm2: Some(ghi * 0.4),
            dni_wm2: ghi * 0.8,
        }
    }

    /// Pipeline trained on a constant target, so every prediction equals
    /// that constant.
    fn constant_pipeline(target: f64) -> Pipeline {
        let rows: Vec<crate::features::FeatureRow> = (0..30)
            .map(|i| {
                let mut array = [0.0; FEATURE_COUNT];
                array[0] = (i % 24) as f64;
                array[3] = f64::from(i) * 30.0;
                crate::features::FeatureRow::from_array(array)
            })
            .collect();
        let targets = vec![target; rows.len()];

        let params = ModelParams::Forest(ForestParams {
            n_estimators: 5,
            ..ForestParams::default()
        });
        PipelineSpec::new(params, &BoostCapability::Available)
            .unwrap()
            .fit(&rows, &targets)
            .unwrap()
    }

    #[test]
    fn test_empty_weather_yields_empty_forecast() {
        let pipeline = constant_pipeline(500.0);
        let forecast = predict(&pipeline, "rf-v1", &[], LAT, LON).unwrap();

        assert!(forecast.is_empty());
        assert_eq!(forecast.total_kwh, 0.0);
        assert_eq!(forecast.model_version, "rf-v1");
        assert!(forecast.peak().is_none());
    }

    #[test]
    fn test_night_hours_are_forced_to_zero() {
        let pipeline = constant_pipeline(800.0);
        let weather = [record(MIDNIGHT_UTC, 0.0, 10)];

        let forecast = predict(&pipeline, "rf-v1", &weather, LAT, LON).unwrap();
        assert_eq!(forecast.hours[0].production_w, 0);
        assert_eq!(forecast.total_kwh, 0.0);
    }

    #[test]
    fn test_negative_predictions_clamp_to_zero_in_daylight() {
        let pipeline = constant_pipeline(-250.0);
        let weather = [record(NOON_UTC, 600.0, 20)];

        let forecast = predict(&pipeline, "rf-v1", &weather, LAT, LON).unwrap();
        assert_eq!(forecast.hours[0].production_w, 0);
    }

    #[test]
    fn test_metadata_and_order_are_preserved() {
        let pipeline = constant_pipeline(1500.0);
        let weather = [
            record(NOON_UTC, 650.0, 15),
            record(NOON_UTC + 3600, 600.0, 35),
        ];

        let forecast = predict(&pipeline, "rf-v1", &weather, LAT, LON).unwrap();

        assert_eq!(forecast.hours.len(), 2);
        assert_eq!(forecast.hours[0].timestamp, NOON_UTC);
        assert_eq!(forecast.hours[1].timestamp, NOON_UTC + 3600);
        assert_eq!(forecast.hours[0].ghi_wm2, 650.0);
        assert_eq!(forecast.hours[1].cloud_cover_pct, 35);
        assert_eq!(forecast.hours[0].production_w, 1500);
        assert_eq!(forecast.total_kwh, 3.0);
    }

    #[test]
    fn test_peak_returns_highest_hour() {
        let pipeline = constant_pipeline(1200.0);
        let weather = [
            record(MIDNIGHT_UTC, 0.0, 0),
            record(NOON_UTC, 700.0, 5),
            record(NOON_UTC + 3600, 680.0, 5),
        ];

        let forecast = predict(&pipeline, "rf-v1", &weather, LAT, LON).unwrap();
        let peak = forecast.peak().unwrap();
        // Daylight hours tie at 1200 W, the earlier one wins
        assert_eq!(peak.timestamp, NOON_UTC);
        assert_eq!(peak.production_w, 1200);
    }
}
