//! Model Training
//!
//! Splits an assembled dataset chronologically, fits a pipeline on the first
//! 80% and reports hold-out accuracy on the remaining 20%. The split is
//! positional: rows are already in ascending time order, so index order is
//! time order and the model is never evaluated on hours it trained on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{DataError, Dataset, MIN_TRAIN_ROWS, TRAIN_FRACTION};
use crate::features::build_features;
use crate::model::{BoostCapability, ModelError, ModelKind, ModelParams, Pipeline, PipelineSpec};

/// Actual production at or below this level is excluded from MAPE, which
/// would otherwise explode on night and dawn hours where actuals are near
/// zero watts.
pub const MAPE_THRESHOLD_W: f64 = 100.0;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub params: ModelParams,
    pub latitude: f64,
    pub longitude: f64,
    pub since_year: Option<i32>,
    pub until_year: Option<i32>,
}

/// Hold-out accuracy and provenance of one training run. Stored inside the
/// model artifact and shown by `pvcast status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub model_type: ModelKind,
    pub n_samples: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub mape_pct: f64,
    pub mae_w: f64,
    pub rmse_w: f64,
    pub r2: f64,
    pub since_year: Option<i32>,
    pub until_year: Option<i32>,
    pub tuned: bool,
    /// Mean cross-validation MAE of the winning trial, when tuning produced
    /// this model.
    pub cv_mae_w: Option<f64>,
}

#[derive(Debug)]
pub struct TrainedModel {
    pub pipeline: Pipeline,
    pub metrics: TrainingMetrics,
}

/// Fit a pipeline on the chronological 80% prefix of `dataset` and measure
/// it on the 20% suffix.
pub fn train(
    dataset: &Dataset,
    options: &TrainOptions,
    boost: &BoostCapability,
) -> Result<TrainedModel, TrainError> {
    dataset.require_at_least(MIN_TRAIN_ROWS)?;

    let spec = PipelineSpec::new(options.params.clone(), boost)?;

    let features = build_features(&dataset.weather_rows(), options.latitude, options.longitude);
    let targets = dataset.targets();

    let (train_samples, _) = dataset.split(TRAIN_FRACTION);
    let n_train = train_samples.len();
    let (x_train, x_test) = features.split_at(n_train);
    let (y_train, y_test) = targets.split_at(n_train);

    let pipeline = spec.fit(x_train, y_train)?;
    let predicted = pipeline.predict(x_test)?;

    let mut metrics = holdout_metrics(spec.kind(), n_train, y_test, &predicted);
    metrics.since_year = options.since_year;
    metrics.until_year = options.until_year;

    Ok(TrainedModel { pipeline, metrics })
}

pub(crate) fn holdout_metrics(
    kind: ModelKind,
    n_train: usize,
    actual: &[f64],
    predicted: &[f64],
) -> TrainingMetrics {
    TrainingMetrics {
        model_type: kind,
        n_samples: n_train + actual.len(),
        n_train,
        n_test: actual.len(),
        mape_pct: daylight_mape(actual, predicted),
        mae_w: mean_absolute_error(actual, predicted),
        rmse_w: root_mean_squared_error(actual, predicted),
        r2: r_squared(actual, predicted),
        since_year: None,
        until_year: None,
        tuned: false,
        cv_mae_w: None,
    }
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

pub fn root_mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mse = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p) * (a - p))
        .sum::<f64>()
        / actual.len() as f64;
    mse.sqrt()
}

/// Coefficient of determination. Constant actuals have no variance to
/// explain, so the value is pinned to 0 instead of dividing by zero.
pub fn r_squared(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
    if ss_tot < 1e-10 {
        return 0.0;
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    1.0 - ss_res / ss_tot
}

/// Mean absolute percentage error over daylight rows only (actual above
/// [`MAPE_THRESHOLD_W`]). Returns 0 when no row qualifies.
pub fn daylight_mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (a, p) in actual.iter().zip(predicted) {
        if *a > MAPE_THRESHOLD_W {
            sum += ((a - p) / a).abs() * 100.0;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
