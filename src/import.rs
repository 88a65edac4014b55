//! Import of E3DC inverter CSV exports.
//!
//! The portal exports semicolon-separated files with German column names,
//! decimal commas and local wall-clock timestamps that mark the END of each
//! hour. Normalization shifts every row to hour-start UTC seconds and flags
//! curtailed hours so training can exclude them later.

use std::path::{Path, PathBuf};

use chrono::{LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{PvReading, Store, UpsertCounts};

const COL_TIMESTAMP: &str = "Zeitstempel";
const COL_PRODUCTION: &str = "Solarproduktion [W]";
const COL_SOC: &str = "Ladezustand [%]";
const COL_GRID_FEED: &str = "Netzeinspeisung [W]";
const COL_GRID_DRAW: &str = "Netzbezug [W]";
const COL_CONSUMPTION: &str = "Hausverbrauch [W]";
const COL_CURTAIL_LIMIT: &str = "Abregelungsgrenze [W]";

const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Production at or above this share of the export limit counts as curtailed.
const CURTAIL_TOLERANCE: f64 = 0.95;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} is missing required columns: {columns}")]
    MissingColumns { path: PathBuf, columns: String },

    #[error("{path} line {line}: unparseable timestamp '{value}'")]
    Timestamp {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

/// One parsed file before it touches the database.
#[derive(Debug)]
pub struct ParsedCsv {
    pub readings: Vec<PvReading>,
    /// Rows dropped because their wall-clock time has no unique UTC instant
    /// (the hours skipped or repeated around DST transitions).
    pub skipped_dst: usize,
}

/// Totals for a batch import run.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ImportSummary {
    pub files_imported: usize,
    pub files_failed: usize,
    pub rows_inserted: u64,
    pub rows_replaced: u64,
    pub rows_skipped_dst: usize,
}

struct Columns {
    timestamp: usize,
    production: usize,
    soc: Option<usize>,
    grid_feed: Option<usize>,
    grid_draw: Option<usize>,
    consumption: Option<usize>,
    curtail_limit: Option<usize>,
}

fn resolve_columns(path: &Path, headers: &csv::StringRecord) -> Result<Columns, ImportError> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
    };

    let (Some(timestamp), Some(production)) = (find(COL_TIMESTAMP), find(COL_PRODUCTION)) else {
        let missing: Vec<&str> = [COL_TIMESTAMP, COL_PRODUCTION]
            .into_iter()
            .filter(|name| find(name).is_none())
            .collect();
        return Err(ImportError::MissingColumns {
            path: path.to_path_buf(),
            columns: missing.join(", "),
        });
    };

    let columns = Columns {
        timestamp,
        production,
        soc: find(COL_SOC),
        grid_feed: find(COL_GRID_FEED),
        grid_draw: find(COL_GRID_DRAW),
        consumption: find(COL_CONSUMPTION),
        curtail_limit: find(COL_CURTAIL_LIMIT),
    };

    let absent: Vec<&str> = [
        (COL_SOC, columns.soc),
        (COL_GRID_FEED, columns.grid_feed),
        (COL_GRID_DRAW, columns.grid_draw),
        (COL_CONSUMPTION, columns.consumption),
        (COL_CURTAIL_LIMIT, columns.curtail_limit),
    ]
    .into_iter()
    .filter_map(|(name, idx)| idx.is_none().then_some(name))
    .collect();
    if !absent.is_empty() {
        warn!(
            "{}: optional columns absent: {}",
            path.display(),
            absent.join(", ")
        );
    }

    Ok(columns)
}

/// Parse a cell that may use a decimal comma; empty cells read as absent.
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Load and normalize one E3DC export.
pub fn load_e3dc_csv(path: &Path, timezone: Tz) -> Result<ParsedCsv, ImportError> {
    if !path.exists() {
        return Err(ImportError::NotFound(path.to_path_buf()));
    }
    debug!("loading CSV {}", path.display());

    let read_err = |source| ImportError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)
        .map_err(read_err)?;

    let headers = reader.headers().map_err(read_err)?.clone();
    let columns = resolve_columns(path, &headers)?;

    let mut readings = Vec::new();
    let mut skipped_dst = 0usize;

    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(read_err)?;
        let line = i + 2;

        let raw_ts = record.get(columns.timestamp).unwrap_or("").trim();
        let naive = NaiveDateTime::parse_from_str(raw_ts, TIMESTAMP_FORMAT).map_err(|_| {
            ImportError::Timestamp {
                path: path.to_path_buf(),
                line,
                value: raw_ts.to_string(),
            }
        })?;

        let local = match timezone.from_local_datetime(&naive) {
            LocalResult::Single(t) => t,
            LocalResult::Ambiguous(..) | LocalResult::None => {
                skipped_dst += 1;
                continue;
            }
        };
        // The export stamps each hour with its end; shift to hour start so
        // rows line up with weather records.
        let timestamp = local.timestamp() - 3600;

        let cell = |idx: usize| record.get(idx).and_then(parse_number);
        // A column that exists but holds an empty cell reads as 0; only a
        // column missing from the file entirely stays NULL.
        let int_cell = |idx: Option<usize>| idx.map(|i| cell(i).unwrap_or(0.0).round() as i64);

        let production = cell(columns.production).unwrap_or(0.0);
        let limit = columns.curtail_limit.and_then(cell).unwrap_or(0.0);
        let curtailed = limit > 0.0 && production >= limit * CURTAIL_TOLERANCE;

        readings.push(PvReading {
            timestamp,
            production_w: production.round() as i64,
            curtailed,
            soc_pct: columns.soc.map(|i| cell(i).unwrap_or(0.0)),
            grid_feed_w: int_cell(columns.grid_feed),
            grid_draw_w: int_cell(columns.grid_draw),
            consumption_w: int_cell(columns.consumption),
        });
    }

    if skipped_dst > 0 {
        warn!(
            "{}: skipped {} rows around DST transitions",
            path.display(),
            skipped_dst
        );
    }
    debug!("parsed {} readings from {}", readings.len(), path.display());
    Ok(ParsedCsv {
        readings,
        skipped_dst,
    })
}

/// Import a batch of files, isolating failures per file.
pub fn import_files(store: &mut Store, paths: &[PathBuf], timezone: Tz) -> ImportSummary {
    let mut summary = ImportSummary::default();
    let n_files = paths.len();

    for (i, path) in paths.iter().enumerate() {
        match import_one(store, path, timezone) {
            Ok((counts, skipped)) => {
                summary.files_imported += 1;
                summary.rows_inserted += counts.inserted;
                summary.rows_replaced += counts.replaced;
                summary.rows_skipped_dst += skipped;
                info!(
                    "[{}/{}] {}: {} new, {} updated",
                    i + 1,
                    n_files,
                    path.display(),
                    counts.inserted,
                    counts.replaced
                );
            }
            Err(e) => {
                summary.files_failed += 1;
                error!("[{}/{}] {}: {:#}", i + 1, n_files, path.display(), e);
            }
        }
    }
    summary
}

fn import_one(
    store: &mut Store,
    path: &Path,
    timezone: Tz,
) -> anyhow::Result<(UpsertCounts, usize)> {
    let parsed = load_e3dc_csv(path, timezone)?;
    let counts = store.upsert_readings(&parsed.readings)?;
    Ok((counts, parsed.skipped_dst))
}
