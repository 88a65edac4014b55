//! Forecast accuracy analysis.
//!
//! Compares stored forecast rows against the observations that later landed
//! on the same hours, grading each weather source by error and by forecast
//! horizon. GHI is the variable under test since it dominates the power
//! model. The analysis is pure; the caller loads the joined rows and passes
//! the current time in, so results are reproducible.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::store::ForecastObservation;

/// Horizon buckets in hours: half-open `[min, max)` plus a catch-all tail.
const HORIZON_BUCKETS: [(f64, f64, &str); 6] = [
    (0.0, 1.0, "0-1h"),
    (1.0, 6.0, "1-6h"),
    (6.0, 24.0, "6-24h"),
    (24.0, 48.0, "24-48h"),
    (48.0, 72.0, "48-72h"),
    (72.0, f64::INFINITY, ">72h"),
];

/// A correlation needs at least this many shared hours to mean anything.
const MIN_CORRELATION_POINTS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct AccuracyOptions {
    /// Restrict to target hours within the last N days.
    pub days: Option<u32>,
    /// Restrict to one source.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HorizonMetrics {
    pub label: &'static str,
    pub count: usize,
    pub mae_wm2: f64,
    pub rmse_wm2: f64,
    /// Mean signed error; positive means the source overforecasts.
    pub bias_wm2: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceAccuracy {
    pub source: String,
    pub count: usize,
    pub mae_wm2: f64,
    pub rmse_wm2: f64,
    pub bias_wm2: f64,
    pub by_horizon: Vec<HorizonMetrics>,
}

/// Pearson correlation of two sources' errors over their shared hours.
///
/// Low correlation between sources hints at ensemble potential; high
/// correlation means they fail on the same hours.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorCorrelation {
    pub source_a: String,
    pub source_b: String,
    pub pearson_r: f64,
    pub common_points: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyReport {
    pub sources: Vec<SourceAccuracy>,
    pub correlations: Vec<ErrorCorrelation>,
    pub analysis_start: i64,
    pub analysis_end: i64,
    pub total_forecasts: u64,
    pub matched_forecasts: usize,
}

/// Grade every source present in `observations`.
///
/// `total_forecasts` is the count of stored forecast rows in the same
/// window, matched or not; `now` anchors the `days` filter.
pub fn analyze(
    observations: &[ForecastObservation],
    total_forecasts: u64,
    now: i64,
    options: &AccuracyOptions,
) -> AccuracyReport {
    let cutoff = options.days.map(|d| now - i64::from(d) * 86_400);
    let filtered: Vec<&ForecastObservation> = observations
        .iter()
        .filter(|o| cutoff.is_none_or(|c| o.target_time >= c))
        .filter(|o| options.source.as_deref().is_none_or(|s| o.source == s))
        .collect();

    let analysis_start = filtered.iter().map(|o| o.target_time).min().unwrap_or(0);
    let analysis_end = filtered.iter().map(|o| o.target_time).max().unwrap_or(0);

    let mut by_source: BTreeMap<&str, Vec<&ForecastObservation>> = BTreeMap::new();
    for o in &filtered {
        by_source.entry(o.source.as_str()).or_default().push(o);
    }

    let sources: Vec<SourceAccuracy> = by_source
        .iter()
        .map(|(source, rows)| source_accuracy(source, rows))
        .collect();

    // Error series keyed by target hour, for pairwise correlation.
    let error_series: Vec<(&str, BTreeMap<i64, f64>)> = by_source
        .iter()
        .map(|(source, rows)| {
            let series = rows
                .iter()
                .map(|o| (o.target_time, o.forecast_ghi_wm2 - o.actual_ghi_wm2))
                .collect();
            (*source, series)
        })
        .collect();

    let mut correlations = Vec::new();
    for (i, (name_a, series_a)) in error_series.iter().enumerate() {
        for (name_b, series_b) in &error_series[i + 1..] {
            if let Some(corr) = error_correlation(name_a, name_b, series_a, series_b) {
                correlations.push(corr);
            }
        }
    }

    AccuracyReport {
        sources,
        correlations,
        analysis_start,
        analysis_end,
        total_forecasts,
        matched_forecasts: filtered.len(),
    }
}

fn horizon_label(horizon_hours: f64) -> &'static str {
    HORIZON_BUCKETS
        .iter()
        .find(|(min_h, max_h, _)| horizon_hours >= *min_h && horizon_hours < *max_h)
        .map(|(_, _, label)| *label)
        .unwrap_or(">72h")
}

fn source_accuracy(source: &str, rows: &[&ForecastObservation]) -> SourceAccuracy {
    let errors: Vec<f64> = rows
        .iter()
        .map(|o| o.forecast_ghi_wm2 - o.actual_ghi_wm2)
        .collect();

    let mut by_label: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for (o, &error) in rows.iter().zip(&errors) {
        let horizon_hours = (o.target_time - o.issued_at) as f64 / 3600.0;
        by_label
            .entry(horizon_label(horizon_hours))
            .or_default()
            .push(error);
    }

    // Every bucket appears in the report so tables line up across sources.
    let by_horizon = HORIZON_BUCKETS
        .iter()
        .map(|&(_, _, label)| {
            let bucket = by_label.get(label).map(Vec::as_slice).unwrap_or(&[]);
            HorizonMetrics {
                label,
                count: bucket.len(),
                mae_wm2: mean_abs(bucket),
                rmse_wm2: rms(bucket),
                bias_wm2: mean(bucket),
            }
        })
        .collect();

    SourceAccuracy {
        source: source.to_string(),
        count: rows.len(),
        mae_wm2: mean_abs(&errors),
        rmse_wm2: rms(&errors),
        bias_wm2: mean(&errors),
        by_horizon,
    }
}

fn error_correlation(
    name_a: &str,
    name_b: &str,
    series_a: &BTreeMap<i64, f64>,
    series_b: &BTreeMap<i64, f64>,
) -> Option<ErrorCorrelation> {
    let paired: Vec<(f64, f64)> = series_a
        .iter()
        .filter_map(|(t, &ea)| series_b.get(t).map(|&eb| (ea, eb)))
        .collect();
    if paired.len() < MIN_CORRELATION_POINTS {
        return None;
    }

    let n = paired.len() as f64;
    let mean_a = paired.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = paired.iter().map(|p| p.1).sum::<f64>() / n;

    let cov = paired
        .iter()
        .map(|(a, b)| (a - mean_a) * (b - mean_b))
        .sum::<f64>()
        / n;
    let std_a = (paired.iter().map(|(a, _)| (a - mean_a).powi(2)).sum::<f64>() / n).sqrt();
    let std_b = (paired.iter().map(|(_, b)| (b - mean_b).powi(2)).sum::<f64>() / n).sqrt();

    if std_a < 1e-10 || std_b < 1e-10 {
        return None;
    }

    Some(ErrorCorrelation {
        source_a: name_a.to_string(),
        source_b: name_b.to_string(),
        pearson_r: cov / (std_a * std_b),
        common_points: paired.len(),
    })
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn mean_abs(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().map(|x| x.abs()).sum::<f64>() / xs.len() as f64
}

fn rms(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    (xs.iter().map(|x| x * x).sum::<f64>() / xs.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn obs(
        source: &str,
        issued_at: i64,
        target_time: i64,
        forecast: f64,
        actual: f64,
    ) -> ForecastObservation {
        ForecastObservation {
            source: source.to_string(),
            issued_at,
            target_time,
            forecast_ghi_wm2: forecast,
            actual_ghi_wm2: actual,
        }
    }

    #[test]
    fn test_horizon_labels_at_boundaries() {
        assert_eq!(horizon_label(0.0), "0-1h");
        assert_eq!(horizon_label(0.99), "0-1h");
        assert_eq!(horizon_label(1.0), "1-6h");
        assert_eq!(horizon_label(6.0), "6-24h");
        assert_eq!(horizon_label(24.0), "24-48h");
        assert_eq!(horizon_label(48.0), "48-72h");
        assert_eq!(horizon_label(72.0), ">72h");
        assert_eq!(horizon_label(200.0), ">72h");
    }

    #[test]
    fn test_single_source_metrics() {
        let base = 1_717_200_000;
        let observations = vec![
            obs("open-meteo", base, base + 1800, 510.0, 500.0),
            obs("open-meteo", base, base + 30 * 3600, 490.0, 500.0),
        ];

        let report = analyze(&observations, 5, base + 40 * 3600, &AccuracyOptions::default());
        assert_eq!(report.total_forecasts, 5);
        assert_eq!(report.matched_forecasts, 2);
        assert_eq!(report.analysis_start, base + 1800);
        assert_eq!(report.analysis_end, base + 30 * 3600);

        let src = &report.sources[0];
        assert_eq!(src.source, "open-meteo");
        assert_eq!(src.count, 2);
        assert_relative_eq!(src.mae_wm2, 10.0);
        assert_relative_eq!(src.rmse_wm2, 10.0);
        assert_relative_eq!(src.bias_wm2, 0.0);

        // One error sits in the first bucket, one 30 hours out.
        assert_eq!(src.by_horizon[0].count, 1);
        assert_relative_eq!(src.by_horizon[0].bias_wm2, 10.0);
        assert_eq!(src.by_horizon[3].count, 1);
        assert_relative_eq!(src.by_horizon[3].bias_wm2, -10.0);
        assert_eq!(src.by_horizon[1].count, 0);
        assert_eq!(src.by_horizon[1].mae_wm2, 0.0);
    }

    #[test]
    fn test_days_and_source_filters() {
        let now = 1_717_200_000;
        let recent = now - 86_400;
        let old = now - 10 * 86_400;
        let observations = vec![
            obs("open-meteo", old - 3600, old, 400.0, 380.0),
            obs("open-meteo", recent - 3600, recent, 400.0, 390.0),
            obs("mosmix", recent - 3600, recent, 400.0, 420.0),
        ];

        let last_week = analyze(
            &observations,
            3,
            now,
            &AccuracyOptions {
                days: Some(7),
                source: None,
            },
        );
        assert_eq!(last_week.matched_forecasts, 2);
        assert_eq!(last_week.sources.len(), 2);

        let only_mosmix = analyze(
            &observations,
            3,
            now,
            &AccuracyOptions {
                days: None,
                source: Some("mosmix".to_string()),
            },
        );
        assert_eq!(only_mosmix.matched_forecasts, 1);
        assert_eq!(only_mosmix.sources.len(), 1);
        assert_eq!(only_mosmix.sources[0].source, "mosmix");
    }

    #[test]
    fn test_correlated_sources() {
        let base = 1_717_200_000;
        let mut observations = Vec::new();
        for i in 0..12 {
            let target = base + i * 3600;
            let error = i as f64 - 5.0;
            observations.push(obs("a", base, target, 400.0 + error, 400.0));
            observations.push(obs("b", base, target, 300.0 + error, 300.0));
        }

        let report = analyze(&observations, 24, base + 86_400, &AccuracyOptions::default());
        assert_eq!(report.correlations.len(), 1);
        let corr = &report.correlations[0];
        assert_eq!(corr.source_a, "a");
        assert_eq!(corr.source_b, "b");
        assert_eq!(corr.common_points, 12);
        assert_relative_eq!(corr.pearson_r, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_anticorrelated_sources() {
        let base = 1_717_200_000;
        let mut observations = Vec::new();
        for i in 0..12 {
            let target = base + i * 3600;
            let error = i as f64 - 5.0;
            observations.push(obs("a", base, target, 400.0 + error, 400.0));
            observations.push(obs("b", base, target, 300.0 - error, 300.0));
        }

        let report = analyze(&observations, 24, base + 86_400, &AccuracyOptions::default());
        assert_relative_eq!(report.correlations[0].pearson_r, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_correlation_needs_enough_common_points() {
        let base = 1_717_200_000;
        let mut observations = Vec::new();
        for i in 0..9 {
            let target = base + i * 3600;
            observations.push(obs("a", base, target, 400.0 + i as f64, 400.0));
            observations.push(obs("b", base, target, 300.0 + i as f64, 300.0));
        }

        let report = analyze(&observations, 18, base + 86_400, &AccuracyOptions::default());
        assert!(report.correlations.is_empty());
    }

    #[test]
    fn test_constant_errors_have_no_correlation() {
        let base = 1_717_200_000;
        let mut observations = Vec::new();
        for i in 0..12 {
            let target = base + i * 3600;
            observations.push(obs("a", base, target, 410.0, 400.0));
            observations.push(obs("b", base, target, 300.0 + i as f64, 300.0));
        }

        let report = analyze(&observations, 24, base + 86_400, &AccuracyOptions::default());
        assert!(report.correlations.is_empty());
    }

    #[test]
    fn test_empty_observations() {
        let report = analyze(&[], 7, 1_717_200_000, &AccuracyOptions::default());
        assert!(report.sources.is_empty());
        assert!(report.correlations.is_empty());
        assert_eq!(report.total_forecasts, 7);
        assert_eq!(report.matched_forecasts, 0);
        assert_eq!(report.analysis_start, 0);
    }
}
