//! Regression Pipeline
//!
//! A trained pipeline is a standardizer plus one of two tree-ensemble
//! regressors behind the [`Regressor`] enum: a bagged random forest (always
//! compiled in) and a gradient-boosted ensemble (optional `boost` cargo
//! feature). Pipeline construction takes the boost capability as an explicit
//! parameter; availability is probed once at startup, not rediscovered per
//! call site.

#[cfg(feature = "boost")]
pub mod boost;
pub mod capability;
pub mod forest;
pub mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureRow, FEATURE_COUNT};

pub use capability::BoostCapability;

/// Which regressor family a pipeline uses. The short tags ("rf", "xgb")
/// appear in CLI arguments, artifact version strings and metrics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Bagged ensemble of regression trees.
    #[serde(rename = "rf")]
    Rf,
    /// Gradient-boosted ensemble of regression trees.
    #[serde(rename = "xgb")]
    Xgb,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rf => "rf",
            Self::Xgb => "xgb",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rf" => Ok(Self::Rf),
            "xgb" => Ok(Self::Xgb),
            other => Err(format!("unknown model type '{other}' (expected rf or xgb)")),
        }
    }
}

/// Random-forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 15,
            min_samples_split: 2,
            min_samples_leaf: 5,
        }
    }
}

/// Gradient-boosting hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub max_depth: u32,
    pub learning_rate: f64,
    pub min_child_weight: usize,
    pub subsample: f64,
    pub colsample_bytree: f64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.1,
            min_child_weight: 5,
            subsample: 1.0,
            colsample_bytree: 1.0,
        }
    }
}

/// Hyperparameters for either regressor family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelParams {
    Forest(ForestParams),
    Boost(BoostParams),
}

impl ModelParams {
    pub fn default_for(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Rf => Self::Forest(ForestParams::default()),
            ModelKind::Xgb => Self::Boost(BoostParams::default()),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Forest(_) => ModelKind::Rf,
            Self::Boost(_) => ModelKind::Xgb,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no trained model found at {}; run `pvcast train` first", path.display())]
    NotFound { path: PathBuf },

    #[error("gradient-boosted backend {reason}. {remediation}")]
    BoostUnavailable { reason: String, remediation: String },

    #[error("feature/target length mismatch: {features} feature rows, {targets} targets")]
    LengthMismatch { features: usize, targets: usize },

    #[error("cannot fit a pipeline on an empty dataset")]
    EmptyFit,

    #[error("model fit failed: {0}")]
    Fit(String),

    #[error("model prediction failed: {0}")]
    Predict(String),

    #[error("model file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("model artifact could not be decoded: {0}")]
    Decode(#[from] bincode::Error),

    #[error("model artifact version {found} is not supported (expected {expected}); re-train with `pvcast train`")]
    UnsupportedVersion { found: String, expected: String },

    #[error("boosted model bytes could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-column z-score standardizer.
///
/// Tree ensembles are scale-invariant, but the standardizer is part of the
/// persisted pipeline contract, so trained artifacts stay comparable across
/// regressor families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &[[f64; FEATURE_COUNT]]) -> Self {
        let n = x.len().max(1) as f64;
        let mut means = vec![0.0; FEATURE_COUNT];
        let mut stds = vec![0.0; FEATURE_COUNT];

        for row in x {
            for (mean, value) in means.iter_mut().zip(row) {
                *mean += value;
            }
        }
        for mean in &mut means {
            *mean /= n;
        }

        for row in x {
            for (i, value) in row.iter().enumerate() {
                let diff = value - means[i];
                stds[i] += diff * diff;
            }
        }
        for std in &mut stds {
            *std = (*std / n).sqrt();
        }

        Self { means, stds }
    }

    /// Transform one row. Columns with (near) zero variance map to 0.
    pub fn transform(&self, row: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut out = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            if self.stds[i] > 1e-10 {
                out[i] = (row[i] - self.means[i]) / self.stds[i];
            }
        }
        out
    }

    pub fn transform_all(&self, x: &[[f64; FEATURE_COUNT]]) -> Vec<[f64; FEATURE_COUNT]> {
        x.iter().map(|row| self.transform(row)).collect()
    }
}

/// Fitted regressor, tagged by family.
#[derive(Debug)]
pub enum Regressor {
    Forest(forest::ForestModel),
    #[cfg(feature = "boost")]
    Boost(boost::BoostModel),
}

impl Regressor {
    fn fit(
        params: &ModelParams,
        x: &[[f64; FEATURE_COUNT]],
        y: &[f64],
    ) -> Result<Self, ModelError> {
        match params {
            ModelParams::Forest(p) => Ok(Self::Forest(forest::ForestModel::fit(p, x, y)?)),
            ModelParams::Boost(p) => {
                #[cfg(feature = "boost")]
                {
                    Ok(Self::Boost(boost::BoostModel::fit(p, x, y)?))
                }
                #[cfg(not(feature = "boost"))]
                {
                    let _ = p;
                    Err(BoostCapability::NotInstalled.to_error())
                }
            }
        }
    }

    fn predict(&self, x: &[[f64; FEATURE_COUNT]]) -> Result<Vec<f64>, ModelError> {
        match self {
            Self::Forest(model) => model.predict(x),
            #[cfg(feature = "boost")]
            Self::Boost(model) => model.predict(x),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Forest(_) => ModelKind::Rf,
            #[cfg(feature = "boost")]
            Self::Boost(_) => ModelKind::Xgb,
        }
    }
}

/// Validated, untrained pipeline: hyperparameters plus the capability gate.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    params: ModelParams,
}

impl PipelineSpec {
    /// Check the requested family against the probed capability. A boosted
    /// pipeline on a build without the backend fails here, before any data
    /// is loaded.
    pub fn new(params: ModelParams, boost: &BoostCapability) -> Result<Self, ModelError> {
        if params.kind() == ModelKind::Xgb {
            boost.require()?;
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn kind(&self) -> ModelKind {
        self.params.kind()
    }

    /// Fit standardizer and regressor on the given rows.
    pub fn fit(&self, features: &[FeatureRow], targets: &[f64]) -> Result<Pipeline, ModelError> {
        if features.is_empty() {
            return Err(ModelError::EmptyFit);
        }
        if features.len() != targets.len() {
            return Err(ModelError::LengthMismatch {
                features: features.len(),
                targets: targets.len(),
            });
        }

        let raw: Vec<[f64; FEATURE_COUNT]> = features.iter().map(FeatureRow::as_array).collect();
        let scaler = StandardScaler::fit(&raw);
        let scaled = scaler.transform_all(&raw);
        let regressor = Regressor::fit(&self.params, &scaled, targets)?;

        Ok(Pipeline {
            scaler,
            regressor,
            params: self.params.clone(),
        })
    }
}

/// Fitted standardizer + regressor.
#[derive(Debug)]
pub struct Pipeline {
    pub scaler: StandardScaler,
    pub regressor: Regressor,
    pub params: ModelParams,
}

impl Pipeline {
    /// Raw (unclamped) predictions, one per feature row, in input order.
    pub fn predict(&self, features: &[FeatureRow]) -> Result<Vec<f64>, ModelError> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<[f64; FEATURE_COUNT]> = features.iter().map(FeatureRow::as_array).collect();
        let scaled = self.scaler.transform_all(&raw);
        self.regressor.predict(&scaled)
    }

    pub fn kind(&self) -> ModelKind {
        self.regressor.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_round_trip() {
        assert_eq!("rf".parse::<ModelKind>().unwrap(), ModelKind::Rf);
        assert_eq!("xgb".parse::<ModelKind>().unwrap(), ModelKind::Xgb);
        assert!("gbm".parse::<ModelKind>().is_err());
        assert_eq!(ModelKind::Rf.to_string(), "rf");
    }

    #[test]
    fn test_default_forest_params() {
        let params = ForestParams::default();
        assert_eq!(params.n_estimators, 100);
        assert_eq!(params.max_depth, 15);
        assert_eq!(params.min_samples_leaf, 5);
    }

    #[test]
    fn test_default_boost_params() {
        let params = BoostParams::default();
        assert_eq!(params.n_estimators, 100);
        assert_eq!(params.max_depth, 6);
        assert!((params.learning_rate - 0.1).abs() < 1e-12);
        assert_eq!(params.min_child_weight, 5);
    }

    #[test]
    fn test_scaler_zero_variance_column_maps_to_zero() {
        let mut rows = Vec::new();
        for i in 0..4 {
            let mut row = [1.0; FEATURE_COUNT];
            row[0] = f64::from(i);
            rows.push(row);
        }

        let scaler = StandardScaler::fit(&rows);
        let transformed = scaler.transform(&rows[2]);

        // Column 0 varies, the rest are constant
        assert!(transformed[0].abs() > 0.0);
        for value in &transformed[1..] {
            assert_eq!(*value, 0.0);
        }
    }

    #[test]
    fn test_scaler_standardizes_to_zero_mean() {
        let rows: Vec<[f64; FEATURE_COUNT]> = (0..10)
            .map(|i| {
                let mut row = [0.0; FEATURE_COUNT];
                for (j, cell) in row.iter_mut().enumerate() {
                    *cell = f64::from(i) * (j as f64 + 1.0);
                }
                row
            })
            .collect();

        let scaler = StandardScaler::fit(&rows);
        let scaled = scaler.transform_all(&rows);

        for col in 0..FEATURE_COUNT {
            let mean: f64 = scaled.iter().map(|r| r[col]).sum::<f64>() / rows.len() as f64;
            assert!(mean.abs() < 1e-9, "column {col} mean {mean}");
        }
    }

    #[test]
    fn test_boost_spec_requires_capability() {
        let err = PipelineSpec::new(
            ModelParams::default_for(ModelKind::Xgb),
            &BoostCapability::NotInstalled,
        )
        .unwrap_err();

        assert!(matches!(err, ModelError::BoostUnavailable { .. }));

        let spec = PipelineSpec::new(
            ModelParams::default_for(ModelKind::Rf),
            &BoostCapability::NotInstalled,
        );
        assert!(spec.is_ok());
    }
}
