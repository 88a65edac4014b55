//! Hyperparameter Tuning
//!
//! Searches the per-family hyperparameter space with chronological
//! cross-validation: every fold trains on a prefix of the time axis and
//! validates on the slice right after it, never on shuffled rows. Two
//! strategies share that discipline. Random search burns a fixed trial
//! budget. Sequential search seeds itself with random warmup trials, then
//! perturbs the best configuration found so far, prunes trials whose running
//! fold error falls behind the field, and stops at an optional wall-clock
//! timeout.
//!
//! Scoring is mean fold MAE, minimized. The winning configuration is refit
//! on the 80% chronological prefix and measured on the final 20%, so tuned
//! and plainly trained models report comparable metrics.

use std::ops::Range;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info};

use crate::dataset::{DataError, Dataset, MIN_TUNE_ROWS, TRAIN_FRACTION};
use crate::features::{build_features, FeatureRow};
use crate::model::{
    BoostCapability, BoostParams, ForestParams, ModelError, ModelKind, ModelParams, PipelineSpec,
};
use crate::training::{holdout_metrics, mean_absolute_error, TrainedModel};

/// Sequential search always completes this many unpruned trials before the
/// pruner has enough history to act.
const WARMUP_TRIALS: usize = 5;

/// Fold index from which the pruner may cut a trial short.
const PRUNE_AFTER_FOLDS: usize = 2;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("invalid tuning options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Uniform random sampling for a fixed number of trials.
    Random,
    /// Warmup plus local perturbation of the incumbent, with pruning and an
    /// optional timeout.
    Sequential,
}

#[derive(Debug, Clone)]
pub struct TuneOptions {
    pub kind: ModelKind,
    pub strategy: SearchStrategy,
    pub n_iter: usize,
    pub cv_splits: usize,
    pub timeout: Option<Duration>,
    pub seed: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub since_year: Option<i32>,
    pub until_year: Option<i32>,
}

#[derive(Debug)]
pub struct TuneOutcome {
    pub trained: TrainedModel,
    pub best_params: ModelParams,
    pub best_cv_mae_w: f64,
    pub trials_completed: usize,
    pub trials_pruned: usize,
}

/// One expanding-window fold: train on a chronological prefix, validate on
/// the slice immediately after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Range<usize>,
    pub test: Range<usize>,
}

/// Expanding-window splitter. The first fold trains on `min_train_size`
/// rows; each subsequent fold absorbs the previous validation slice into its
/// training prefix.
#[derive(Debug, Clone, Copy)]
pub struct ExpandingWindow {
    pub n_folds: usize,
    pub min_train_size: usize,
}

impl ExpandingWindow {
    /// Splitter with sklearn-like proportions: the initial training prefix
    /// is one fold-width of the data.
    pub fn with_folds(n_folds: usize, len: usize) -> Self {
        Self {
            n_folds,
            min_train_size: len / (n_folds + 1),
        }
    }

    pub fn split(&self, len: usize) -> Result<Vec<Fold>, TuneError> {
        if self.n_folds == 0 {
            return Err(TuneError::InvalidOptions(
                "cv_splits must be at least 1".to_string(),
            ));
        }
        if self.min_train_size == 0 || len <= self.min_train_size {
            return Err(TuneError::InvalidOptions(format!(
                "{len} rows cannot seed an expanding window of {} folds",
                self.n_folds
            )));
        }
        let test_size = (len - self.min_train_size) / self.n_folds;
        if test_size == 0 {
            return Err(TuneError::InvalidOptions(format!(
                "{len} rows leave no validation slice for {} folds",
                self.n_folds
            )));
        }

        let mut folds = Vec::with_capacity(self.n_folds);
        for i in 0..self.n_folds {
            let train_end = self.min_train_size + i * test_size;
            folds.push(Fold {
                train: 0..train_end,
                test: train_end..train_end + test_size,
            });
        }
        Ok(folds)
    }
}

/// Cross-validated hyperparameter search, then a final refit of the winner.
pub fn tune(
    dataset: &Dataset,
    options: &TuneOptions,
    boost: &BoostCapability,
) -> Result<TuneOutcome, TuneError> {
    dataset.require_at_least(MIN_TUNE_ROWS)?;
    if options.n_iter == 0 {
        return Err(TuneError::InvalidOptions(
            "n_iter must be at least 1".to_string(),
        ));
    }
    // Reject an unavailable backend before burning any CV time.
    PipelineSpec::new(ModelParams::default_for(options.kind), boost)?;

    let features = build_features(&dataset.weather_rows(), options.latitude, options.longitude);
    let targets = dataset.targets();
    let folds = ExpandingWindow::with_folds(options.cv_splits, features.len())
        .split(features.len())?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut search = Search {
        features: &features,
        targets: &targets,
        folds: &folds,
        boost,
        pruner: Pruner::new(folds.len()),
        trials: Vec::new(),
        pruned: 0,
    };

    let started = Instant::now();
    match options.strategy {
        SearchStrategy::Random => {
            for trial in 0..options.n_iter {
                let params = sample(options.kind, &mut rng);
                search.run_trial(trial, params, false)?;
            }
        }
        SearchStrategy::Sequential => {
            for trial in 0..options.n_iter {
                if trial > 0 {
                    if let Some(limit) = options.timeout {
                        if started.elapsed() >= limit {
                            info!(
                                completed = search.trials.len(),
                                pruned = search.pruned,
                                "tuning timeout reached"
                            );
                            break;
                        }
                    }
                }
                let params = match search.best() {
                    Some(best) if trial >= WARMUP_TRIALS => perturb(&best.params, &mut rng),
                    _ => sample(options.kind, &mut rng),
                };
                let allow_pruning = trial >= WARMUP_TRIALS;
                search.run_trial(trial, params, allow_pruning)?;
            }
        }
    }

    let best = search
        .best()
        .cloned()
        .ok_or_else(|| TuneError::InvalidOptions("search completed no trials".to_string()))?;
    let trials_completed = search.trials.len();
    let trials_pruned = search.pruned;

    info!(
        best_cv_mae_w = best.mean_mae,
        trials_completed,
        trials_pruned,
        params = ?best.params,
        "search finished, refitting best configuration"
    );

    // Refit on the 80% prefix and measure on the 20% suffix, the same way
    // plain training does.
    let (train_samples, _) = dataset.split(TRAIN_FRACTION);
    let n_train = train_samples.len();
    let (x_train, x_test) = features.split_at(n_train);
    let (y_train, y_test) = targets.split_at(n_train);

    let spec = PipelineSpec::new(best.params.clone(), boost)?;
    let pipeline = spec.fit(x_train, y_train)?;
    let predicted = pipeline.predict(x_test)?;

    let mut metrics = holdout_metrics(options.kind, n_train, y_test, &predicted);
    metrics.since_year = options.since_year;
    metrics.until_year = options.until_year;
    metrics.tuned = true;
    metrics.cv_mae_w = Some(best.mean_mae);

    Ok(TuneOutcome {
        trained: TrainedModel { pipeline, metrics },
        best_params: best.params,
        best_cv_mae_w: best.mean_mae,
        trials_completed,
        trials_pruned,
    })
}

#[derive(Debug, Clone)]
struct CompletedTrial {
    params: ModelParams,
    mean_mae: f64,
}

struct Search<'a> {
    features: &'a [FeatureRow],
    targets: &'a [f64],
    folds: &'a [Fold],
    boost: &'a BoostCapability,
    pruner: Pruner,
    trials: Vec<CompletedTrial>,
    pruned: usize,
}

impl Search<'_> {
    /// Evaluate one configuration across all folds. A pruned trial records
    /// nothing and does not count as completed.
    fn run_trial(
        &mut self,
        trial: usize,
        params: ModelParams,
        allow_pruning: bool,
    ) -> Result<(), TuneError> {
        let spec = PipelineSpec::new(params.clone(), self.boost)?;
        let mut fold_maes = Vec::with_capacity(self.folds.len());

        for (fold_index, fold) in self.folds.iter().enumerate() {
            let pipeline = spec.fit(
                &self.features[fold.train.clone()],
                &self.targets[fold.train.clone()],
            )?;
            let predicted = pipeline.predict(&self.features[fold.test.clone()])?;
            fold_maes.push(mean_absolute_error(
                &self.targets[fold.test.clone()],
                &predicted,
            ));

            let running_mean = fold_maes.iter().sum::<f64>() / fold_maes.len() as f64;
            if allow_pruning && self.pruner.should_prune(fold_index, running_mean) {
                debug!(trial, fold = fold_index, running_mean, "trial pruned");
                self.pruned += 1;
                return Ok(());
            }
        }

        let mean_mae = fold_maes.iter().sum::<f64>() / fold_maes.len() as f64;
        debug!(trial, mean_mae, params = ?params, "trial completed");
        self.pruner.record(&fold_maes);
        self.trials.push(CompletedTrial { params, mean_mae });
        Ok(())
    }

    fn best(&self) -> Option<&CompletedTrial> {
        self.trials
            .iter()
            .min_by(|a, b| a.mean_mae.total_cmp(&b.mean_mae))
    }
}

/// Median-based pruner. Tracks the running mean error of completed trials
/// at each fold index; a live trial that falls behind the median after
/// [`PRUNE_AFTER_FOLDS`] folds is cut short.
struct Pruner {
    running_means: Vec<Vec<f64>>,
}

impl Pruner {
    fn new(n_folds: usize) -> Self {
        Self {
            running_means: vec![Vec::new(); n_folds],
        }
    }

    fn record(&mut self, fold_maes: &[f64]) {
        let mut sum = 0.0;
        for (i, mae) in fold_maes.iter().enumerate() {
            sum += mae;
            self.running_means[i].push(sum / (i + 1) as f64);
        }
    }

    fn should_prune(&self, fold_index: usize, running_mean: f64) -> bool {
        if fold_index < PRUNE_AFTER_FOLDS {
            return false;
        }
        let seen = &self.running_means[fold_index];
        if seen.len() < WARMUP_TRIALS {
            return false;
        }
        running_mean > median(seen)
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn sample(kind: ModelKind, rng: &mut StdRng) -> ModelParams {
    match kind {
        ModelKind::Rf => ModelParams::Forest(ForestParams {
            n_estimators: rng.gen_range(100..500),
            max_depth: rng.gen_range(5..25),
            min_samples_split: rng.gen_range(2..20),
            min_samples_leaf: rng.gen_range(1..15),
        }),
        ModelKind::Xgb => ModelParams::Boost(BoostParams {
            n_estimators: rng.gen_range(100..500),
            max_depth: rng.gen_range(4..13),
            learning_rate: rng.gen_range(0.01..=0.30),
            min_child_weight: rng.gen_range(1..11),
            subsample: rng.gen_range(0.6..=1.0),
            colsample_bytree: rng.gen_range(0.6..=1.0),
        }),
    }
}

/// Resample each dimension with probability one half, drawing from a window
/// around the incumbent value that spans a quarter of the full range.
fn perturb(best: &ModelParams, rng: &mut StdRng) -> ModelParams {
    match best {
        ModelParams::Forest(p) => ModelParams::Forest(ForestParams {
            n_estimators: jitter_int(rng, p.n_estimators as i64, 100, 500) as usize,
            max_depth: jitter_int(rng, i64::from(p.max_depth), 5, 25) as u16,
            min_samples_split: jitter_int(rng, p.min_samples_split as i64, 2, 20) as usize,
            min_samples_leaf: jitter_int(rng, p.min_samples_leaf as i64, 1, 15) as usize,
        }),
        ModelParams::Boost(p) => ModelParams::Boost(BoostParams {
            n_estimators: jitter_int(rng, p.n_estimators as i64, 100, 500) as usize,
            max_depth: jitter_int(rng, i64::from(p.max_depth), 4, 13) as u32,
            learning_rate: jitter_float(rng, p.learning_rate, 0.01, 0.30),
            min_child_weight: jitter_int(rng, p.min_child_weight as i64, 1, 11) as usize,
            subsample: jitter_float(rng, p.subsample, 0.6, 1.0),
            colsample_bytree: jitter_float(rng, p.colsample_bytree, 0.6, 1.0),
        }),
    }
}

/// Integer jitter within `[lo, hi)`, window of a quarter range around
/// `current`. Keeps the current value with probability one half.
fn jitter_int(rng: &mut StdRng, current: i64, lo: i64, hi: i64) -> i64 {
    if rng.gen_bool(0.5) {
        return current;
    }
    let width = (((hi - lo) as f64) * 0.25).max(1.0) as i64;
    let min = (current - width).max(lo);
    let max = (current + width).min(hi - 1);
    rng.gen_range(min..=max)
}

fn jitter_float(rng: &mut StdRng, current: f64, lo: f64, hi: f64) -> f64 {
    if rng.gen_bool(0.5) {
        return current;
    }
    let width = (hi - lo) * 0.25;
    rng.gen_range((current - width).max(lo)..=(current + width).min(hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ProductionReading;
    use crate::sources::WeatherRecord;

    fn synthetic_dataset(hours: usize) -> Dataset {
        let base = 1_704_067_200_i64; // 2024-01-01 00:00 UTC
        let mut production = Vec::with_capacity(hours);
        let mut weather = Vec::with_capacity(hours);

        for i in 0..hours {
            let timestamp = base + (i as i64) * 3600;
            let hour = i % 24;
            let ghi = if (7..=17).contains(&hour) {
                ((hour - 7) as f64 * std::f64::consts::PI / 10.0).sin() * 600.0
            } else {
                0.0
            };

            weather.push(WeatherRecord {
                timestamp,
                ghi_wm2: ghi,
                cloud_cover_pct: (i * 11 % 100) as u8,
                temperature_c: 5.0 + (hour as f64) * 0.5,
                wind_speed_ms: 2.0,
                humidity_pct: 70,
                dhi_wm2: Some(ghi * 0.5),
                dni_wm2: ghi * 0.7,
            });
            production.push(ProductionReading {
                timestamp,
                production_w: (ghi * 3.5) as i64,
                curtailed: false,
            });
        }

        Dataset::assemble(&production, &weather).unwrap()
    }

    #[test]
    fn test_expanding_window_folds_are_chronological() {
        let folds = ExpandingWindow::with_folds(3, 500).split(500).unwrap();

        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].train, 0..125);
        assert_eq!(folds[0].test, 125..250);
        assert_eq!(folds[2].test.end, 500);

        for fold in &folds {
            assert_eq!(fold.train.start, 0);
            assert_eq!(fold.train.end, fold.test.start);
            assert!(fold.test.end > fold.test.start);
        }
        // Training prefixes strictly grow
        for pair in folds.windows(2) {
            assert!(pair[1].train.end > pair[0].train.end);
        }
    }

    #[test]
    fn test_expanding_window_uneven_lengths_stay_in_bounds() {
        let folds = ExpandingWindow::with_folds(3, 503).split(503).unwrap();
        assert!(folds.last().unwrap().test.end <= 503);
    }

    #[test]
    fn test_expanding_window_rejects_degenerate_splits() {
        assert!(ExpandingWindow::with_folds(0, 100).split(100).is_err());
        assert!(ExpandingWindow::with_folds(50, 40).split(40).is_err());
    }

    #[test]
    fn test_sampling_respects_bounds_and_seed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            match sample(ModelKind::Rf, &mut rng) {
                ModelParams::Forest(p) => {
                    assert!((100..500).contains(&p.n_estimators));
                    assert!((5..25).contains(&p.max_depth));
                    assert!((2..20).contains(&p.min_samples_split));
                    assert!((1..15).contains(&p.min_samples_leaf));
                }
                ModelParams::Boost(_) => panic!("sampled wrong family"),
            }
            match sample(ModelKind::Xgb, &mut rng) {
                ModelParams::Boost(p) => {
                    assert!((100..500).contains(&p.n_estimators));
                    assert!((4..13).contains(&p.max_depth));
                    assert!((0.01..=0.30).contains(&p.learning_rate));
                    assert!((1..11).contains(&p.min_child_weight));
                    assert!((0.6..=1.0).contains(&p.subsample));
                    assert!((0.6..=1.0).contains(&p.colsample_bytree));
                }
                ModelParams::Forest(_) => panic!("sampled wrong family"),
            }
        }

        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        for _ in 0..10 {
            assert_eq!(sample(ModelKind::Rf, &mut a), sample(ModelKind::Rf, &mut b));
        }
    }

    #[test]
    fn test_perturb_stays_inside_space() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut params = sample(ModelKind::Rf, &mut rng);
        for _ in 0..200 {
            params = perturb(&params, &mut rng);
            match &params {
                ModelParams::Forest(p) => {
                    assert!((100..500).contains(&p.n_estimators));
                    assert!((5..25).contains(&p.max_depth));
                    assert!((2..20).contains(&p.min_samples_split));
                    assert!((1..15).contains(&p.min_samples_leaf));
                }
                ModelParams::Boost(_) => panic!("family changed under perturbation"),
            }
        }
    }

    #[test]
    fn test_pruner_needs_history_and_late_folds() {
        let mut pruner = Pruner::new(3);
        // Folds 0 and 1 never prune regardless of history
        assert!(!pruner.should_prune(0, f64::MAX));
        assert!(!pruner.should_prune(1, f64::MAX));
        // Fold 2 needs enough completed trials first
        assert!(!pruner.should_prune(2, f64::MAX));

        for mae in [100.0, 110.0, 120.0, 130.0, 140.0] {
            pruner.record(&[mae, mae, mae]);
        }
        assert!(pruner.should_prune(2, 500.0));
        assert!(!pruner.should_prune(2, 50.0));
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn test_tune_rejects_small_dataset() {
        let dataset = synthetic_dataset(499);
        let options = TuneOptions {
            kind: ModelKind::Rf,
            strategy: SearchStrategy::Random,
            n_iter: 2,
            cv_splits: 2,
            timeout: None,
            seed: 42,
            latitude: 51.83,
            longitude: 7.28,
            since_year: None,
            until_year: None,
        };

        let err = tune(&dataset, &options, &BoostCapability::Available).unwrap_err();
        assert!(matches!(
            err,
            TuneError::Data(DataError::Insufficient {
                actual: 499,
                required: 500
            })
        ));
    }

    #[test]
    fn test_tune_random_reports_best_and_refits() {
        let dataset = synthetic_dataset(500);
        let options = TuneOptions {
            kind: ModelKind::Rf,
            strategy: SearchStrategy::Random,
            n_iter: 2,
            cv_splits: 2,
            timeout: None,
            seed: 42,
            latitude: 51.83,
            longitude: 7.28,
            since_year: Some(2024),
            until_year: None,
        };

        let outcome = tune(&dataset, &options, &BoostCapability::Available).unwrap();

        assert_eq!(outcome.trials_completed, 2);
        assert_eq!(outcome.trials_pruned, 0);
        assert!(outcome.best_cv_mae_w.is_finite());
        assert!(outcome.trained.metrics.tuned);
        assert_eq!(outcome.trained.metrics.cv_mae_w, Some(outcome.best_cv_mae_w));
        assert_eq!(outcome.trained.metrics.since_year, Some(2024));
        assert_eq!(outcome.trained.metrics.n_train, 400);
        assert_eq!(outcome.trained.metrics.n_test, 100);
        assert_eq!(outcome.best_params.kind(), ModelKind::Rf);
    }

    #[test]
    fn test_tune_sequential_timeout_still_completes_one_trial() {
        let dataset = synthetic_dataset(500);
        let options = TuneOptions {
            kind: ModelKind::Rf,
            strategy: SearchStrategy::Sequential,
            n_iter: 10,
            cv_splits: 2,
            timeout: Some(Duration::ZERO),
            seed: 1,
            latitude: 51.83,
            longitude: 7.28,
            since_year: None,
            until_year: None,
        };

        let outcome = tune(&dataset, &options, &BoostCapability::Available).unwrap();
        assert_eq!(outcome.trials_completed, 1);
    }

    #[test]
    fn test_tune_boost_without_backend_fails_before_search() {
        let dataset = synthetic_dataset(500);
        let options = TuneOptions {
            kind: ModelKind::Xgb,
            strategy: SearchStrategy::Random,
            n_iter: 1,
            cv_splits: 2,
            timeout: None,
            seed: 42,
            latitude: 51.83,
            longitude: 7.28,
            since_year: None,
            until_year: None,
        };

        let err = tune(&dataset, &options, &BoostCapability::NotInstalled).unwrap_err();
        assert!(matches!(
            err,
            TuneError::Model(ModelError::BoostUnavailable { .. })
        ));
    }
}
