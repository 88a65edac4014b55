//! Model artifact persistence.
//!
//! A trained pipeline is saved as a single bincode envelope: version tag,
//! hyperparameters, fitted scaler, regressor bytes and training metrics.
//! Forest regressors serialize to bincode, boosted ones to JSON (the format
//! the gbdt crate itself persists), both tucked inside the envelope as raw
//! bytes.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{forest, ModelError, ModelKind, ModelParams, Pipeline, Regressor, StandardScaler};
use crate::training::TrainingMetrics;

const RF_VERSION: &str = "rf-v1";
const XGB_VERSION: &str = "xgb-v1";

fn expected_version(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Rf => RF_VERSION,
        ModelKind::Xgb => XGB_VERSION,
    }
}

#[derive(Serialize, Deserialize)]
struct SavedModel {
    version: String,
    kind: ModelKind,
    params: ModelParams,
    scaler: StandardScaler,
    regressor_bytes: Vec<u8>,
    metrics: TrainingMetrics,
    created_at: DateTime<Utc>,
}

/// Pipeline restored from disk together with its training provenance.
#[derive(Debug)]
pub struct LoadedModel {
    pub pipeline: Pipeline,
    pub metrics: TrainingMetrics,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

pub fn save(path: &Path, pipeline: &Pipeline, metrics: &TrainingMetrics) -> Result<(), ModelError> {
    let (version, regressor_bytes) = match &pipeline.regressor {
        Regressor::Forest(model) => (RF_VERSION, model.to_bytes()?),
        #[cfg(feature = "boost")]
        Regressor::Boost(model) => (XGB_VERSION, model.to_bytes()?),
    };

    let saved = SavedModel {
        version: version.to_string(),
        kind: pipeline.kind(),
        params: pipeline.params.clone(),
        scaler: pipeline.scaler.clone(),
        regressor_bytes,
        metrics: metrics.clone(),
        created_at: Utc::now(),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bincode::serialize(&saved)?)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<LoadedModel, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let bytes = fs::read(path)?;
    let saved: SavedModel = bincode::deserialize(&bytes)?;

    let expected = expected_version(saved.kind);
    if saved.version != expected {
        return Err(ModelError::UnsupportedVersion {
            found: saved.version,
            expected: expected.to_string(),
        });
    }

    let regressor = match saved.kind {
        ModelKind::Rf => Regressor::Forest(forest::ForestModel::from_bytes(&saved.regressor_bytes)?),
        ModelKind::Xgb => {
            #[cfg(feature = "boost")]
            {
                Regressor::Boost(crate::model::boost::BoostModel::from_bytes(
                    &saved.regressor_bytes,
                )?)
            }
            #[cfg(not(feature = "boost"))]
            {
                return Err(crate::model::BoostCapability::NotInstalled.to_error());
            }
        }
    };

    Ok(LoadedModel {
        pipeline: Pipeline {
            scaler: saved.scaler,
            regressor,
            params: saved.params,
        },
        metrics: saved.metrics,
        version: saved.version,
        created_at: saved.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureRow, FEATURE_COUNT};
    use crate::model::{BoostCapability, ForestParams, PipelineSpec};

    fn tiny_pipeline() -> Pipeline {
        let rows: Vec<FeatureRow> = (0..40)
            .map(|i| {
                let mut array = [0.0; FEATURE_COUNT];
                array[0] = (i % 24) as f64;
                array[3] = (i * 13 % 800) as f64;
                FeatureRow::from_array(array)
            })
            .collect();
        let targets: Vec<f64> = rows.iter().map(|r| r.as_array()[3] * 3.0).collect();

        let params = ModelParams::Forest(ForestParams {
            n_estimators: 5,
            ..ForestParams::default()
        });
        PipelineSpec::new(params, &BoostCapability::Available)
            .unwrap()
            .fit(&rows, &targets)
            .unwrap()
    }

    fn tiny_metrics() -> TrainingMetrics {
        TrainingMetrics {
            model_type: ModelKind::Rf,
            n_samples: 40,
            n_train: 32,
            n_test: 8,
            mape_pct: 12.5,
            mae_w: 40.0,
            rmse_w: 55.0,
            r2: 0.91,
            since_year: None,
            until_year: None,
            tuned: false,
            cv_mae_w: None,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let pipeline = tiny_pipeline();
        let rows: Vec<FeatureRow> = (0..6)
            .map(|i| {
                let mut array = [0.0; FEATURE_COUNT];
                array[0] = f64::from(i);
                array[3] = f64::from(i) * 90.0;
                FeatureRow::from_array(array)
            })
            .collect();
        let expected = pipeline.predict(&rows).unwrap();

        save(&path, &pipeline, &tiny_metrics()).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.version, "rf-v1");
        assert_eq!(loaded.metrics.n_samples, 40);
        assert_eq!(loaded.pipeline.kind(), ModelKind::Rf);
        assert_eq!(loaded.pipeline.predict(&rows).unwrap(), expected);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.bin")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound { .. }));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let pipeline = tiny_pipeline();
        save(&path, &pipeline, &tiny_metrics()).unwrap();

        let mut saved: SavedModel = bincode::deserialize(&fs::read(&path).unwrap()).unwrap();
        saved.version = "rf-v0".to_string();
        fs::write(&path, bincode::serialize(&saved).unwrap()).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("model.bin");

        save(&path, &tiny_pipeline(), &tiny_metrics()).unwrap();
        assert!(path.exists());
    }
}
