//! Command handlers.
//!
//! Each handler wires the pure pipeline modules to the store, the weather
//! source and the terminal. Errors bubble up as `anyhow` chains and reach
//! the user through `main`'s error printer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::accuracy::{self, AccuracyOptions};
use crate::cli::{format, Args, Command, ConfigAction, Method, OutputFormat};
use crate::config::Config;
use crate::dataset::Dataset;
use crate::evaluate;
use crate::geocode::{Geocoder, DEFAULT_COUNTRY_CODES};
use crate::import;
use crate::model::{self, BoostCapability, ModelKind, ModelParams};
use crate::predict;
use crate::sources::{self, WeatherSource};
use crate::store::Store;
use crate::training::{self, TrainOptions};
use crate::tuning::{self, TuneOptions};

/// Fixed seed for the tuner, so reruns on unchanged data reproduce.
const TUNE_SEED: u64 = 42;

pub async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(Config::default_path);

    // `config --init` and `reset` must work before a config file exists.
    if let Command::Config { action } = &args.command {
        return handle_config(&config_path, action);
    }

    let mut config = Config::load(&config_path)?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(lat) = args.lat {
        config.latitude = lat;
    }
    if let Some(lon) = args.lon {
        config.longitude = lon;
    }
    config.validate()?;

    match args.command {
        Command::Config { .. } => unreachable!("handled above"),
        Command::Import { files } => handle_import(&config, &files),
        Command::FetchForecast { hours, format } => {
            handle_fetch_forecast(&config, hours, format).await
        }
        Command::FetchHistorical { start, end, force } => {
            handle_fetch_historical(&config, start, end, force).await
        }
        Command::Train { model, since, until } => handle_train(&config, model, since, until),
        Command::Tune {
            model,
            method,
            trials,
            cv,
            timeout,
            since,
            until,
        } => handle_tune(&config, model, method, trials, cv, timeout, since, until),
        Command::Predict { days, format } => handle_predict(&config, days, format).await,
        Command::Today { full, format } => handle_today(&config, full, format).await,
        Command::Evaluate { year } => handle_evaluate(&config, year),
        Command::Status => handle_status(&config),
        Command::Accuracy {
            days,
            source,
            format,
        } => handle_accuracy(&config, days, source, format),
        Command::Locate { query } => handle_locate(&query.join(" ")).await,
        Command::Doctor => handle_doctor(&config, &config_path).await,
        Command::Reset {
            all,
            database,
            model_file,
            configuration,
            force,
            dry_run,
        } => handle_reset(
            &config,
            &config_path,
            ResetTargets {
                database: database || all,
                model_file: model_file || all,
                configuration: configuration || all,
            },
            force,
            dry_run,
        ),
    }
}

/// Load everything the store has, join it and apply the year bounds.
fn load_dataset(
    store: &Store,
    config: &Config,
    since: Option<i32>,
    until: Option<i32>,
) -> Result<Dataset> {
    let production = store.load_production_range(0, i64::MAX)?;
    let weather = store.load_weather_range(0, i64::MAX)?;

    let mut dataset = Dataset::assemble(&production, &weather)?.filter_years(since, until);
    dataset.fill_missing_dhi(config.latitude, config.longitude);
    Ok(dataset)
}

fn open_source(config: &Config) -> Result<Box<dyn WeatherSource>> {
    Ok(sources::create_source(
        &config.provider,
        config.latitude,
        config.longitude,
        config.tz()?,
    )?)
}

fn handle_import(config: &Config, files: &[PathBuf]) -> Result<()> {
    let mut store = Store::open(&config.db_path)?;
    let summary = import::import_files(&mut store, files, config.tz()?);

    println!(
        "Imported {} file(s): {} rows new, {} updated, {} skipped around DST.",
        summary.files_imported,
        summary.rows_inserted,
        summary.rows_replaced,
        summary.rows_skipped_dst
    );
    if summary.files_failed > 0 {
        bail!("{} file(s) failed to import", summary.files_failed);
    }
    Ok(())
}

async fn handle_fetch_forecast(
    config: &Config,
    hours: usize,
    format: OutputFormat,
) -> Result<()> {
    let source = open_source(config)?;
    let records = source.fetch_forecast(hours).await?;

    let mut store = Store::open(&config.db_path)?;
    store.record_forecast(source.name(), Utc::now().timestamp(), &records)?;
    info!(rows = records.len(), source = source.name(), "forecast archived");

    format::print_weather(&records, format, config.tz()?)
}

async fn handle_fetch_historical(
    config: &Config,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    force: bool,
) -> Result<()> {
    let source = open_source(config)?;
    let (available_start, available_end) = source.available_range();

    let mut store = Store::open(&config.db_path)?;
    let stored_last = store.weather_summary()?.last;

    let start = start.unwrap_or_else(|| match stored_last {
        // Resume one day back so a partially stored day completes.
        Some(last) => Utc
            .timestamp_opt(last, 0)
            .single()
            .map_or(available_start, |t| t.date_naive()),
        None => available_start,
    });
    let start = start.max(available_start);
    let end = end.unwrap_or(available_end).min(available_end);

    if start > end {
        println!("Weather history is already up to date (archive serves up to {end}).");
        return Ok(());
    }

    let mut records = source.fetch_historical(start, end).await?;
    if !force {
        if let Some(last) = stored_last {
            records.retain(|r| r.timestamp > last);
        }
    }

    let counts = store.upsert_weather(&records)?;
    println!(
        "Fetched {start} to {end}: {} rows new, {} updated.",
        counts.inserted, counts.replaced
    );
    Ok(())
}

fn handle_train(
    config: &Config,
    model: ModelKind,
    since: Option<i32>,
    until: Option<i32>,
) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let dataset = load_dataset(&store, config, since, until)?;
    info!(rows = dataset.len(), "assembled training dataset");

    let boost = BoostCapability::probe();
    let options = TrainOptions {
        params: ModelParams::default_for(model),
        latitude: config.latitude,
        longitude: config.longitude,
        since_year: since,
        until_year: until,
    };

    let trained = training::train(&dataset, &options, &boost)?;
    model::store::save(&config.model_path, &trained.pipeline, &trained.metrics)?;

    println!("Model saved to {}", config.model_path.display());
    format::print_metrics(&trained.metrics);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_tune(
    config: &Config,
    model: ModelKind,
    method: Method,
    trials: usize,
    cv: usize,
    timeout: Option<u64>,
    since: Option<i32>,
    until: Option<i32>,
) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let dataset = load_dataset(&store, config, since, until)?;
    info!(rows = dataset.len(), "assembled tuning dataset");

    let boost = BoostCapability::probe();
    let options = TuneOptions {
        kind: model,
        strategy: method.into(),
        n_iter: trials,
        cv_splits: cv,
        timeout: timeout.map(Duration::from_secs),
        seed: TUNE_SEED,
        latitude: config.latitude,
        longitude: config.longitude,
        since_year: since,
        until_year: until,
    };

    let outcome = tuning::tune(&dataset, &options, &boost)?;
    model::store::save(
        &config.model_path,
        &outcome.trained.pipeline,
        &outcome.trained.metrics,
    )?;

    println!(
        "Search done: {} trial(s) completed, {} pruned. Best CV MAE {:.0} W.",
        outcome.trials_completed, outcome.trials_pruned, outcome.best_cv_mae_w
    );
    println!("Model saved to {}", config.model_path.display());
    format::print_metrics(&outcome.trained.metrics);
    Ok(())
}

async fn handle_predict(config: &Config, days: u32, format: OutputFormat) -> Result<()> {
    let loaded = model::store::load(&config.model_path)?;
    let tz = config.tz()?;

    let today = Utc::now().with_timezone(&tz).date_naive();
    let window_start = local_midnight(today + Days::new(1), tz);
    let window_end = local_midnight(today + Days::new(1 + u64::from(days)), tz);

    let hours_ahead = ((window_end - Utc::now().timestamp()).max(0) / 3600 + 1) as usize;
    let source = open_source(config)?;
    let weather: Vec<_> = source
        .fetch_forecast(hours_ahead)
        .await?
        .into_iter()
        .filter(|r| r.timestamp >= window_start && r.timestamp < window_end)
        .collect();

    let forecast = predict::predict(
        &loaded.pipeline,
        &loaded.version,
        &weather,
        config.latitude,
        config.longitude,
    )?;
    format::print_forecast(&forecast, format, tz)
}

async fn handle_today(config: &Config, full: bool, format: OutputFormat) -> Result<()> {
    let loaded = model::store::load(&config.model_path)?;
    let tz = config.tz()?;

    let source = open_source(config)?;
    let mut weather = source.fetch_today().await?;
    if !full {
        let current_hour = Utc::now().timestamp() / 3600 * 3600;
        weather.retain(|r| r.timestamp >= current_hour);
    }

    let forecast = predict::predict(
        &loaded.pipeline,
        &loaded.version,
        &weather,
        config.latitude,
        config.longitude,
    )?;
    format::print_forecast(&forecast, format, tz)
}

fn handle_evaluate(config: &Config, year: Option<i32>) -> Result<()> {
    let year = year.unwrap_or_else(|| Utc::now().year() - 1);
    let loaded = model::store::load(&config.model_path)?;

    let store = Store::open(&config.db_path)?;
    let dataset = load_dataset(&store, config, Some(year), Some(year))?;

    let result = evaluate::evaluate(
        &loaded.pipeline,
        &loaded.version,
        &dataset,
        year,
        config.latitude,
        config.longitude,
        Some(config.peak_kwp),
    )?;
    format::print_evaluation(&result);
    Ok(())
}

fn handle_status(config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let production = store.production_summary()?;
    let weather = store.weather_summary()?;
    let forecasts = store.forecast_summaries()?;

    let model = match model::store::load(&config.model_path) {
        Ok(loaded) => Some(loaded),
        Err(model::ModelError::NotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };

    format::print_status(&production, &weather, &forecasts, model.as_ref(), config.tz()?);
    Ok(())
}

fn handle_accuracy(
    config: &Config,
    days: Option<u32>,
    source: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let store = Store::open(&config.db_path)?;
    let now = Utc::now().timestamp();

    let observations = store.forecast_observations()?;
    let total = store.forecast_count(days.map(|d| now - i64::from(d) * 86_400))?;

    let report = accuracy::analyze(&observations, total, now, &AccuracyOptions { days, source });
    format::print_accuracy(&report, format, config.tz()?)
}

async fn handle_locate(query: &str) -> Result<()> {
    let mut geocoder = Geocoder::new();
    match geocoder.search(query, Some(DEFAULT_COUNTRY_CODES)).await? {
        Some(place) => {
            println!("{}", place.display_name);
            println!(
                "  {} — latitude {:.4}, longitude {:.4}",
                place.short_name(),
                place.latitude,
                place.longitude
            );
            println!(
                "Put these in your config: latitude = {:.4}, longitude = {:.4}",
                place.latitude, place.longitude
            );
        }
        None => println!("No match for '{query}'."),
    }
    Ok(())
}

fn handle_config(path: &Path, action: &ConfigAction) -> Result<()> {
    if action.path {
        println!("{}", path.display());
        return Ok(());
    }
    if action.init {
        if path.exists() {
            bail!("{} already exists; delete it first or edit it in place", path.display());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, Config::default().to_toml()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // --show
    let config = Config::load(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

async fn handle_doctor(config: &Config, config_path: &Path) -> Result<()> {
    let mut problems = 0usize;
    let mut check = |name: &str, outcome: std::result::Result<String, String>| match outcome {
        Ok(detail) => println!("  ok: {name} — {detail}"),
        Err(detail) => {
            problems += 1;
            println!("FAIL: {name} — {detail}");
        }
    };

    check(
        "configuration",
        Ok(if config_path.exists() {
            format!("loaded from {}", config_path.display())
        } else {
            "using built-in defaults (no config file)".to_string()
        }),
    );

    match Store::open(&config.db_path) {
        Ok(store) => {
            let version = store
                .get_meta("schema_version")
                .ok()
                .flatten()
                .unwrap_or_else(|| "?".to_string());
            check("database", Ok(format!("schema v{version}")));
            match (store.production_summary(), store.weather_summary()) {
                (Ok(p), Ok(w)) => check(
                    "data",
                    Ok(format!("{} production rows, {} weather rows", p.rows, w.rows)),
                ),
                (p, w) => check("data", Err(format!("{:?} / {:?}", p.err(), w.err()))),
            }
        }
        Err(e) => check("database", Err(format!("{e:#}"))),
    }

    match model::store::load(&config.model_path) {
        Ok(loaded) => check(
            "model",
            Ok(format!(
                "{} trained {}",
                loaded.version,
                loaded.created_at.format("%Y-%m-%d")
            )),
        ),
        Err(model::ModelError::NotFound { .. }) => {
            check("model", Err("none trained yet — run `pvcast train`".to_string()));
        }
        Err(e) => check("model", Err(e.to_string())),
    }

    let boost = BoostCapability::probe();
    match boost.remediation() {
        None => check("boosted backend", Ok("available".to_string())),
        // Not having the optional backend is worth a line, not a failure.
        Some(remedy) => println!("note: boosted backend {boost} — {remedy}"),
    }

    match probe_provider(config).await {
        Ok(()) => check("weather provider", Ok(format!("{} reachable", config.provider))),
        Err(e) => {
            warn!("provider probe failed: {e:#}");
            println!("warn: weather provider — {} unreachable ({e})", config.provider);
        }
    }

    if problems > 0 {
        bail!("{problems} check(s) failed");
    }
    println!("All checks passed.");
    Ok(())
}

/// One tiny forecast request; any parseable answer counts as reachable.
async fn probe_provider(config: &Config) -> Result<()> {
    let source = open_source(config)?;
    source.fetch_forecast(1).await?;
    Ok(())
}

struct ResetTargets {
    database: bool,
    model_file: bool,
    configuration: bool,
}

fn handle_reset(
    config: &Config,
    config_path: &Path,
    targets: ResetTargets,
    force: bool,
    dry_run: bool,
) -> Result<()> {
    if !targets.database && !targets.model_file && !targets.configuration {
        bail!("nothing selected; pass --all, --database, --model-file or --configuration");
    }
    if !force && !dry_run {
        bail!("refusing to delete without --force (use --dry-run to preview)");
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    if targets.database {
        paths.push(config.db_path.clone());
        // SQLite sidecars from WAL mode
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = config.db_path.as_os_str().to_owned();
            sidecar.push(suffix);
            paths.push(PathBuf::from(sidecar));
        }
    }
    if targets.model_file {
        paths.push(config.model_path.clone());
    }
    if targets.configuration {
        paths.push(config_path.to_path_buf());
    }

    for path in paths {
        if !path.exists() {
            continue;
        }
        if dry_run {
            println!("would delete {}", path.display());
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
            println!("deleted {}", path.display());
        }
    }
    Ok(())
}

fn local_midnight(date: NaiveDate, tz: Tz) -> i64 {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_midnight_converts_zone() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        // Berlin midnight in summer is 22:00 UTC the day before
        let ts = local_midnight(date, chrono_tz::Europe::Berlin);
        assert_eq!(ts, 1_717_192_800);

        let utc = local_midnight(date, chrono_tz::UTC);
        assert_eq!(utc, 1_717_200_000);
    }
}
