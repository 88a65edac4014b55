//! Gradient-boosted regressor backed by the pure-Rust gbdt crate.
//!
//! Only compiled with the `boost` cargo feature. gbdt trains on f32 rows, so
//! feature values are narrowed on the way in and widened on the way out.

use gbdt::config::Config;
use gbdt::decision_tree::{Data, DataVec, ValueType};
use gbdt::gradient_boost::GBDT;

use crate::features::FEATURE_COUNT;
use crate::model::{BoostParams, ModelError};

pub struct BoostModel {
    inner: GBDT,
}

impl std::fmt::Debug for BoostModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoostModel").finish_non_exhaustive()
    }
}

impl BoostModel {
    pub fn fit(
        params: &BoostParams,
        x: &[[f64; FEATURE_COUNT]],
        y: &[f64],
    ) -> Result<Self, ModelError> {
        let mut config = Config::new();
        config.set_feature_size(FEATURE_COUNT);
        config.set_max_depth(params.max_depth);
        config.set_iterations(params.n_estimators);
        config.set_shrinkage(params.learning_rate as ValueType);
        config.set_min_leaf_size(params.min_child_weight);
        config.set_data_sample_ratio(params.subsample);
        config.set_feature_sample_ratio(params.colsample_bytree);
        config.set_loss("SquaredError");
        config.set_debug(false);

        let mut train: DataVec = x
            .iter()
            .zip(y)
            .map(|(row, target)| {
                Data::new_training_data(narrow(row), 1.0, *target as ValueType, None)
            })
            .collect();

        let mut inner = GBDT::new(&config);
        inner.fit(&mut train);

        Ok(Self { inner })
    }

    pub fn predict(&self, x: &[[f64; FEATURE_COUNT]]) -> Result<Vec<f64>, ModelError> {
        let test: DataVec = x
            .iter()
            .map(|row| Data::new_test_data(narrow(row), None))
            .collect();

        let preds = self.inner.predict(&test);
        if preds.len() != x.len() {
            return Err(ModelError::Predict(format!(
                "boosted ensemble returned {} predictions for {} rows",
                preds.len(),
                x.len()
            )));
        }
        Ok(preds.into_iter().map(f64::from).collect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(&self.inner)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let inner = serde_json::from_slice(bytes).map_err(ModelError::Json)?;
        Ok(Self { inner })
    }
}

fn narrow(row: &[f64; FEATURE_COUNT]) -> Vec<ValueType> {
    row.iter().map(|v| *v as ValueType).collect()
}

/// Minimal fit/predict cycle used by the startup capability probe.
pub(crate) fn smoke_test() -> Result<(), String> {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for i in 0..8 {
        let mut row = [0.0; FEATURE_COUNT];
        row[0] = f64::from(i);
        row[3] = f64::from(i) * 100.0;
        x.push(row);
        y.push(f64::from(i) * 50.0);
    }

    let params = BoostParams {
        n_estimators: 4,
        max_depth: 2,
        ..BoostParams::default()
    };

    let model = BoostModel::fit(&params, &x, &y).map_err(|e| e.to_string())?;
    let preds = model.predict(&x[..2]).map_err(|e| e.to_string())?;
    if preds.iter().all(|p| p.is_finite()) {
        Ok(())
    } else {
        Err("probe fit produced non-finite predictions".to_string())
    }
}
