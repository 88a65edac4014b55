//! Model Evaluation
//!
//! Backtests a trained pipeline against one calendar year of actual
//! production, joined with the historical weather that produced it. Using
//! stored weather rather than old forecasts isolates model error from
//! weather-forecast error. Predictions go through the same post-processing
//! as live forecasts, so the backtest measures what the system would really
//! have reported.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{DataError, Dataset};
use crate::model::{ModelError, Pipeline};
use crate::predict::predict;
use crate::training::{daylight_mape, mean_absolute_error, r_squared, root_mean_squared_error};

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Cloud-cover bucket an hour falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkyCondition {
    /// Cloud cover below 25%.
    Clear,
    /// Cloud cover 25% to 75% inclusive.
    PartlyCloudy,
    /// Cloud cover above 75%.
    Overcast,
}

impl SkyCondition {
    pub fn from_cloud_cover(cloud_cover_pct: u8) -> Self {
        match cloud_cover_pct {
            0..=24 => Self::Clear,
            25..=75 => Self::PartlyCloudy,
            _ => Self::Overcast,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::PartlyCloudy => "partly cloudy",
            Self::Overcast => "overcast",
        }
    }
}

/// Error profile of one cloud-cover bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStats {
    pub condition: SkyCondition,
    pub n_hours: usize,
    pub mae_w: f64,
    pub mape_pct: f64,
}

/// Predicted vs. actual energy for one calendar period (month or day).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodEnergy {
    pub label: String,
    pub predicted_kwh: f64,
    pub actual_kwh: f64,
    /// Signed percentage, positive when the model overforecast. None when
    /// the period produced nothing to compare against.
    pub error_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub year: i32,
    pub model_version: String,
    pub n_hours: usize,
    pub mae_w: f64,
    pub rmse_w: f64,
    pub r2: f64,
    pub mape_pct: f64,
    pub persistence_mae_w: f64,
    /// `(1 - MAE_model / MAE_persistence) * 100`. Positive means the model
    /// beats carrying the previous hour forward.
    pub skill_pct: f64,
    pub total_actual_kwh: f64,
    pub total_predicted_kwh: f64,
    pub specific_yield_kwh_per_kwp: Option<f64>,
    pub by_condition: Vec<ConditionStats>,
    pub monthly: Vec<PeriodEnergy>,
    pub daily: Vec<PeriodEnergy>,
}

/// Backtest `pipeline` against `dataset`, which the caller has already
/// restricted to `year`.
pub fn evaluate(
    pipeline: &Pipeline,
    model_version: &str,
    dataset: &Dataset,
    year: i32,
    latitude: f64,
    longitude: f64,
    peak_kwp: Option<f64>,
) -> Result<EvaluationResult, EvaluateError> {
    if dataset.is_empty() {
        return Err(DataError::EmptyYear { year }.into());
    }

    let weather = dataset.weather_rows();
    let actual = dataset.targets();

    let forecast = predict(pipeline, model_version, &weather, latitude, longitude)?;
    let predicted: Vec<f64> = forecast.hours.iter().map(|h| h.production_w as f64).collect();

    let mae_w = mean_absolute_error(&actual, &predicted);
    let (persistence_mae_w, skill_pct) = persistence_skill(&actual, mae_w);

    let mut by_condition = Vec::with_capacity(3);
    for condition in [
        SkyCondition::Clear,
        SkyCondition::PartlyCloudy,
        SkyCondition::Overcast,
    ] {
        let mut bucket_actual = Vec::new();
        let mut bucket_predicted = Vec::new();
        for (i, record) in weather.iter().enumerate() {
            if SkyCondition::from_cloud_cover(record.cloud_cover_pct) == condition {
                bucket_actual.push(actual[i]);
                bucket_predicted.push(predicted[i]);
            }
        }
        by_condition.push(ConditionStats {
            condition,
            n_hours: bucket_actual.len(),
            mae_w: mean_absolute_error(&bucket_actual, &bucket_predicted),
            mape_pct: daylight_mape(&bucket_actual, &bucket_predicted),
        });
    }

    let monthly = period_energy(&weather, &actual, &predicted, |dt| {
        format!("{:04}-{:02}", dt.year(), dt.month())
    });
    let daily = period_energy(&weather, &actual, &predicted, |dt| {
        format!("{:04}-{:02}-{:02}", dt.year(), dt.month(), dt.day())
    });

    let total_actual_kwh = actual.iter().sum::<f64>() / 1000.0;
    let total_predicted_kwh = predicted.iter().sum::<f64>() / 1000.0;

    Ok(EvaluationResult {
        year,
        model_version: model_version.to_string(),
        n_hours: actual.len(),
        mae_w,
        rmse_w: root_mean_squared_error(&actual, &predicted),
        r2: r_squared(&actual, &predicted),
        mape_pct: daylight_mape(&actual, &predicted),
        persistence_mae_w,
        skill_pct,
        total_actual_kwh,
        total_predicted_kwh,
        specific_yield_kwh_per_kwp: peak_kwp
            .filter(|kwp| *kwp > 0.0)
            .map(|kwp| total_actual_kwh / kwp),
        by_condition,
        monthly,
        daily,
    })
}

/// Persistence baseline: forecast every hour as the previous hour's actual.
/// Constant actuals make the baseline degenerate, in which case both values
/// pin to zero rather than dividing by zero.
fn persistence_skill(actual: &[f64], model_mae: f64) -> (f64, f64) {
    if actual.len() < 2 {
        return (0.0, 0.0);
    }
    let persistence_mae = actual
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .sum::<f64>()
        / (actual.len() - 1) as f64;

    if persistence_mae < 1e-10 {
        return (persistence_mae, 0.0);
    }
    (persistence_mae, (1.0 - model_mae / persistence_mae) * 100.0)
}

fn period_energy(
    weather: &[crate::sources::WeatherRecord],
    actual: &[f64],
    predicted: &[f64],
    label_of: impl Fn(&DateTime<Utc>) -> String,
) -> Vec<PeriodEnergy> {
    let mut totals: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (i, record) in weather.iter().enumerate() {
        let dt = DateTime::from_timestamp(record.timestamp, 0).unwrap_or_default();
        let entry = totals.entry(label_of(&dt)).or_insert((0.0, 0.0));
        entry.0 += predicted[i];
        entry.1 += actual[i];
    }

    totals
        .into_iter()
        .map(|(label, (predicted_wh, actual_wh))| {
            let predicted_kwh = predicted_wh / 1000.0;
            let actual_kwh = actual_wh / 1000.0;
            let error_pct = if actual_kwh > 0.0 {
                Some((predicted_kwh - actual_kwh) / actual_kwh * 100.0)
            } else {
                None
            };
            PeriodEnergy {
                label,
                predicted_kwh,
                actual_kwh,
                error_pct,
            }
        })
        .collect()
}
