//! Feature Builder
//!
//! Turns an ordered sequence of weather records into the numeric feature
//! table consumed by the regression pipeline. The transform is strictly 1:1
//! and order-preserving: output row i always describes input row i, which is
//! what lets predictions be re-attached to their timestamps by position.
//! Training and inference share this exact code path.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::solar;
use crate::sources::WeatherRecord;

pub const FEATURE_COUNT: usize = 10;

/// Column names, in the exact order produced by [`FeatureRow::as_array`].
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "hour",
    "month",
    "day_of_year",
    "ghi",
    "cloud_cover",
    "temperature",
    "wind_speed",
    "humidity",
    "dhi",
    "sun_elevation",
];

/// One model-ready feature vector, derived from one weather record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRow {
    pub hour: f64,
    pub month: f64,
    pub day_of_year: f64,
    pub ghi: f64,
    pub cloud_cover: f64,
    pub temperature: f64,
    pub wind_speed: f64,
    pub humidity: f64,
    pub dhi: f64,
    pub sun_elevation: f64,
}

impl FeatureRow {
    fn from_record(record: &WeatherRecord, latitude: f64, longitude: f64) -> Self {
        let dt: DateTime<Utc> = DateTime::from_timestamp(record.timestamp, 0).unwrap_or_default();

        Self {
            hour: f64::from(dt.hour()),
            month: f64::from(dt.month()),
            day_of_year: f64::from(dt.ordinal()),
            ghi: finite_or(record.ghi_wm2, 0.0).max(0.0),
            cloud_cover: f64::from(record.cloud_cover_pct).clamp(0.0, 100.0),
            temperature: record.temperature_c,
            wind_speed: finite_or(record.wind_speed_ms, 0.0).max(0.0),
            humidity: f64::from(record.humidity_pct).clamp(0.0, 100.0),
            dhi: finite_or(record.dhi_wm2.unwrap_or(0.0), 0.0).max(0.0),
            sun_elevation: solar::sun_elevation(record.timestamp, latitude, longitude),
        }
    }

    /// Flatten into the column order of [`FEATURE_NAMES`].
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.hour,
            self.month,
            self.day_of_year,
            self.ghi,
            self.cloud_cover,
            self.temperature,
            self.wind_speed,
            self.humidity,
            self.dhi,
            self.sun_elevation,
        ]
    }

    /// Inverse of [`Self::as_array`]: rebuild a row from an ordered array.
    pub fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        Self {
            hour: values[0],
            month: values[1],
            day_of_year: values[2],
            ghi: values[3],
            cloud_cover: values[4],
            temperature: values[5],
            wind_speed: values[6],
            humidity: values[7],
            dhi: values[8],
            sun_elevation: values[9],
        }
    }
}

/// Build one feature row per weather record, preserving input order.
///
/// Never filters or reorders. Missing optional fields fall back to their
/// defaults (wind 0.0, humidity 50, dhi 0.0); NaN values are coerced the
/// same way so a single bad cell cannot poison a fit.
pub fn build_features(
    records: &[WeatherRecord],
    latitude: f64,
    longitude: f64,
) -> Vec<FeatureRow> {
    records
        .iter()
        .map(|record| FeatureRow::from_record(record, latitude, longitude))
        .collect()
}

fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}
