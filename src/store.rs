//! SQLite persistence for readings, weather and forecast history.
//!
//! One database file holds everything: imported inverter readings, hourly
//! weather (forecast and archive), every fetched forecast row for later
//! accuracy analysis, and a small metadata table. Batch writes run inside a
//! transaction so an interrupted fetch never leaves a half-written window.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::dataset::ProductionReading;
use crate::sources::WeatherRecord;

const SCHEMA_VERSION: i64 = 3;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pv_readings (
        timestamp      INTEGER PRIMARY KEY,
        production_w   INTEGER NOT NULL,
        curtailed      INTEGER NOT NULL DEFAULT 0,
        soc_pct        REAL,
        grid_feed_w    INTEGER,
        grid_draw_w    INTEGER,
        consumption_w  INTEGER
    );

    CREATE TABLE IF NOT EXISTS weather_history (
        timestamp       INTEGER PRIMARY KEY,
        ghi_wm2         REAL    NOT NULL,
        cloud_cover_pct INTEGER NOT NULL,
        temperature_c   REAL    NOT NULL,
        wind_speed_ms   REAL    NOT NULL,
        humidity_pct    INTEGER NOT NULL,
        dhi_wm2         REAL,
        dni_wm2         REAL    NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS forecast_history (
        source          TEXT    NOT NULL,
        issued_at       INTEGER NOT NULL,
        target_time     INTEGER NOT NULL,
        ghi_wm2         REAL    NOT NULL,
        cloud_cover_pct INTEGER NOT NULL,
        temperature_c   REAL    NOT NULL,
        PRIMARY KEY (source, issued_at, target_time)
    );

    CREATE INDEX IF NOT EXISTS idx_forecast_target
        ON forecast_history(target_time);

    CREATE TABLE IF NOT EXISTS metadata (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// One full inverter reading row as persisted. The dataset assembler only
/// consumes the first three fields; the rest are kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PvReading {
    pub timestamp: i64,
    pub production_w: i64,
    pub curtailed: bool,
    pub soc_pct: Option<f64>,
    pub grid_feed_w: Option<i64>,
    pub grid_draw_w: Option<i64>,
    pub consumption_w: Option<i64>,
}

/// Row count and covered time range of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSummary {
    pub rows: u64,
    pub first: Option<i64>,
    pub last: Option<i64>,
    /// Distinct calendar months covered, for a quick coverage check.
    pub months: u64,
}

/// Per-source forecast history summary.
#[derive(Debug, Clone)]
pub struct ForecastSummary {
    pub source: String,
    pub rows: u64,
    pub last_issued_at: Option<i64>,
}

/// A stored forecast value paired with the observation that later landed on
/// the same hour.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastObservation {
    pub source: String,
    pub issued_at: i64,
    pub target_time: i64,
    pub forecast_ghi_wm2: f64,
    pub actual_ghi_wm2: f64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and bring its schema up to
    /// date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;

        conn.execute_batch(SCHEMA)
            .context("failed to initialize database schema")?;
        migrate(&conn)?;

        info!(db = %path.display(), "database ready");
        Ok(Self { conn })
    }

    pub fn upsert_readings(&mut self, readings: &[PvReading]) -> Result<UpsertCounts> {
        let before = self.count("pv_readings")?;

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO pv_readings
                 (timestamp, production_w, curtailed, soc_pct, grid_feed_w, grid_draw_w, consumption_w)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for r in readings {
                stmt.execute(params![
                    r.timestamp,
                    r.production_w,
                    r.curtailed,
                    r.soc_pct,
                    r.grid_feed_w,
                    r.grid_draw_w,
                    r.consumption_w,
                ])?;
            }
        }
        tx.commit()?;

        let inserted = self.count("pv_readings")? - before;
        let counts = UpsertCounts {
            inserted,
            replaced: readings.len() as u64 - inserted,
        };
        debug!(?counts, "stored inverter readings");
        Ok(counts)
    }

    pub fn upsert_weather(&mut self, records: &[WeatherRecord]) -> Result<UpsertCounts> {
        let before = self.count("weather_history")?;

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO weather_history
                 (timestamp, ghi_wm2, cloud_cover_pct, temperature_c, wind_speed_ms, humidity_pct, dhi_wm2, dni_wm2)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.timestamp,
                    r.ghi_wm2,
                    r.cloud_cover_pct,
                    r.temperature_c,
                    r.wind_speed_ms,
                    r.humidity_pct,
                    r.dhi_wm2,
                    r.dni_wm2,
                ])?;
            }
        }
        tx.commit()?;

        let inserted = self.count("weather_history")? - before;
        Ok(UpsertCounts {
            inserted,
            replaced: records.len() as u64 - inserted,
        })
    }

    /// Record a fetched forecast for later accuracy analysis. Rows are keyed
    /// by (source, issued_at, target_time), so repeated fetches accumulate
    /// instead of overwriting each other.
    pub fn record_forecast(
        &mut self,
        source: &str,
        issued_at: i64,
        records: &[WeatherRecord],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO forecast_history
                 (source, issued_at, target_time, ghi_wm2, cloud_cover_pct, temperature_c)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                stmt.execute(params![
                    source,
                    issued_at,
                    r.timestamp,
                    r.ghi_wm2,
                    r.cloud_cover_pct,
                    r.temperature_c,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Production rows within `[from, to)` as the compact form the dataset
    /// assembler consumes, ascending by timestamp.
    pub fn load_production_range(&self, from: i64, to: i64) -> Result<Vec<ProductionReading>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, production_w, curtailed FROM pv_readings
             WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                Ok(ProductionReading {
                    timestamp: row.get(0)?,
                    production_w: row.get(1)?,
                    curtailed: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn load_weather_range(&self, from: i64, to: i64) -> Result<Vec<WeatherRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, ghi_wm2, cloud_cover_pct, temperature_c, wind_speed_ms,
                    humidity_pct, dhi_wm2, dni_wm2
             FROM weather_history
             WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                Ok(WeatherRecord {
                    timestamp: row.get(0)?,
                    ghi_wm2: row.get(1)?,
                    cloud_cover_pct: row.get(2)?,
                    temperature_c: row.get(3)?,
                    wind_speed_ms: row.get(4)?,
                    humidity_pct: row.get(5)?,
                    dhi_wm2: row.get(6)?,
                    dni_wm2: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn production_summary(&self) -> Result<TableSummary> {
        self.summary("pv_readings")
    }

    pub fn weather_summary(&self) -> Result<TableSummary> {
        self.summary("weather_history")
    }

    pub fn forecast_summaries(&self) -> Result<Vec<ForecastSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, COUNT(*), MAX(issued_at) FROM forecast_history
             GROUP BY source ORDER BY source",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForecastSummary {
                    source: row.get(0)?,
                    rows: row.get(1)?,
                    last_issued_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count stored forecast rows, optionally only those targeting hours at
    /// or after `since`.
    pub fn forecast_count(&self, since: Option<i64>) -> Result<u64> {
        let count = match since {
            Some(cutoff) => self.conn.query_row(
                "SELECT COUNT(*) FROM forecast_history WHERE target_time >= ?1",
                [cutoff],
                |row| row.get(0),
            )?,
            None => self.count("forecast_history")?,
        };
        Ok(count)
    }

    /// Join stored forecasts with the observations that later landed on the
    /// same hour. Only hours with a recorded observation appear.
    pub fn forecast_observations(&self) -> Result<Vec<ForecastObservation>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.source, f.issued_at, f.target_time, f.ghi_wm2, w.ghi_wm2
             FROM forecast_history f
             JOIN weather_history w ON w.timestamp = f.target_time
             ORDER BY f.source, f.issued_at, f.target_time",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForecastObservation {
                    source: row.get(0)?,
                    issued_at: row.get(1)?,
                    target_time: row.get(2)?,
                    forecast_ghi_wm2: row.get(3)?,
                    actual_ghi_wm2: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn count(&self, table: &str) -> Result<u64> {
        let count: u64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }

    fn summary(&self, table: &str) -> Result<TableSummary> {
        let summary = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp),
                        COUNT(DISTINCT strftime('%Y-%m', timestamp, 'unixepoch'))
                 FROM {table}"
            ),
            [],
            |row| {
                Ok(TableSummary {
                    rows: row.get(0)?,
                    first: row.get(1)?,
                    last: row.get(2)?,
                    months: row.get(3)?,
                })
            },
        )?;
        Ok(summary)
    }
}

/// How a batch write landed: fresh rows vs. overwritten timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub replaced: u64,
}

/// Bring databases created by older releases up to the current schema.
/// Column presence is probed via table_info, so reruns are no-ops.
fn migrate(conn: &Connection) -> Result<()> {
    ensure_column(conn, "weather_history", "dhi_wm2", "dhi_wm2 REAL")?;
    ensure_column(
        conn,
        "weather_history",
        "dni_wm2",
        "dni_wm2 REAL NOT NULL DEFAULT 0",
    )?;
    for (column, ddl) in [
        ("soc_pct", "soc_pct REAL"),
        ("grid_feed_w", "grid_feed_w INTEGER"),
        ("grid_draw_w", "grid_draw_w INTEGER"),
        ("consumption_w", "consumption_w INTEGER"),
    ] {
        ensure_column(conn, "pv_readings", column, ddl)?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"))
            .with_context(|| format!("failed to add column {column} to {table}"))?;
        info!(table, column, "migrated database column");
    }
    Ok(())
}
