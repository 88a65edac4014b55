//! Bagged random-forest regressor backed by smartcore.

use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::features::FEATURE_COUNT;
use crate::model::{ForestParams, ModelError};

/// Fixed seed so repeated fits on the same rows produce the same ensemble.
const FOREST_SEED: u64 = 42;

#[derive(Debug, Serialize, Deserialize)]
pub struct ForestModel {
    inner: RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>,
}

impl ForestModel {
    pub fn fit(
        params: &ForestParams,
        x: &[[f64; FEATURE_COUNT]],
        y: &[f64],
    ) -> Result<Self, ModelError> {
        let matrix = to_matrix(x);
        let targets = y.to_vec();

        let smartcore_params = RandomForestRegressorParameters {
            max_depth: Some(params.max_depth),
            min_samples_leaf: params.min_samples_leaf,
            min_samples_split: params.min_samples_split,
            n_trees: params.n_estimators,
            m: None,
            keep_samples: false,
            seed: FOREST_SEED,
        };

        let inner = RandomForestRegressor::fit(&matrix, &targets, smartcore_params)
            .map_err(|e| ModelError::Fit(format!("random forest fit failed: {e:?}")))?;

        Ok(Self { inner })
    }

    pub fn predict(&self, x: &[[f64; FEATURE_COUNT]]) -> Result<Vec<f64>, ModelError> {
        let matrix = to_matrix(x);
        self.inner
            .predict(&matrix)
            .map_err(|e| ModelError::Predict(format!("random forest predict failed: {e:?}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(bincode::serialize(&self.inner)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let inner = bincode::deserialize(bytes)?;
        Ok(Self { inner })
    }
}

fn to_matrix(x: &[[f64; FEATURE_COUNT]]) -> DenseMatrix<f64> {
    let mut flat = Vec::with_capacity(x.len() * FEATURE_COUNT);
    for row in x {
        flat.extend_from_slice(row);
    }
    DenseMatrix::new(x.len(), FEATURE_COUNT, flat, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rows whose target is a noiseless linear function of two columns.
    fn linear_rows(n: usize) -> (Vec<[f64; FEATURE_COUNT]>, Vec<f64>) {
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = [0.0; FEATURE_COUNT];
            row[0] = (i % 24) as f64;
            row[3] = (i * 7 % 900) as f64;
            x.push(row);
            y.push(row[3] * 2.0 + row[0] * 10.0);
        }
        (x, y)
    }

    #[test]
    fn test_fit_and_predict_shapes() {
        let (x, y) = linear_rows(60);
        let model = ForestModel::fit(&ForestParams::default(), &x, &y).unwrap();

        let preds = model.predict(&x[..5]).unwrap();
        assert_eq!(preds.len(), 5);
        for p in &preds {
            assert!(p.is_finite());
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (x, y) = linear_rows(50);
        let params = ForestParams {
            n_estimators: 10,
            ..ForestParams::default()
        };

        let a = ForestModel::fit(&params, &x, &y).unwrap();
        let b = ForestModel::fit(&params, &x, &y).unwrap();

        assert_eq!(a.predict(&x[..8]).unwrap(), b.predict(&x[..8]).unwrap());
    }

    #[test]
    fn test_bytes_round_trip_preserves_predictions() {
        let (x, y) = linear_rows(40);
        let params = ForestParams {
            n_estimators: 5,
            ..ForestParams::default()
        };
        let model = ForestModel::fit(&params, &x, &y).unwrap();
        let expected = model.predict(&x[..6]).unwrap();

        let bytes = model.to_bytes().unwrap();
        let restored = ForestModel::from_bytes(&bytes).unwrap();

        assert_eq!(restored.predict(&x[..6]).unwrap(), expected);
    }
}
