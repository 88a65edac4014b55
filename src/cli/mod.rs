//! Command-line interface.
//!
//! `clap` derive types live here; the handlers are in [`commands`] and the
//! table/json/csv rendering in [`format`]. Global flags override the loaded
//! configuration, so `pvcast --db /tmp/scratch.db train` never touches the
//! real database.

pub mod commands;
pub mod format;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use crate::model::ModelKind;
use crate::tuning::SearchStrategy;

#[derive(Debug, Parser)]
#[command(name = "pvcast", version, about = "Hourly PV production forecasting")]
pub struct Args {
    /// Config file (default: ~/.local/share/pvcast/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured path.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Installation latitude in degrees, overriding the configuration.
    #[arg(long, global = true)]
    pub lat: Option<f64>,

    /// Installation longitude in degrees, overriding the configuration.
    #[arg(long, global = true)]
    pub lon: Option<f64>,

    /// More log output (debug level).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (warnings only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Net verbosity for the tracing filter: `-q` is -1, each `-v` adds 1.
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose as i8
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import E3DC inverter CSV exports into the database.
    Import {
        /// One or more exported CSV files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fetch the hourly weather forecast and archive it for accuracy
    /// analysis.
    FetchForecast {
        /// Number of hours ahead.
        #[arg(long, default_value_t = 48)]
        hours: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Fetch historical weather into the database.
    FetchHistorical {
        /// First day to fetch (default: continue after the newest stored
        /// row, or the provider's earliest day for an empty database).
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day to fetch (default: newest day the provider serves).
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Re-fetch days that are already stored.
        #[arg(long)]
        force: bool,
    },

    /// Train a model on the imported production and weather history.
    Train {
        /// Regressor family.
        #[arg(long, default_value = "rf", value_parser = parse_model_kind)]
        model: ModelKind,

        /// Only use data from this calendar year on.
        #[arg(long)]
        since: Option<i32>,

        /// Only use data up to and including this calendar year.
        #[arg(long)]
        until: Option<i32>,
    },

    /// Search for better hyperparameters, then train with the winner.
    Tune {
        #[arg(long, default_value = "rf", value_parser = parse_model_kind)]
        model: ModelKind,

        /// Search strategy.
        #[arg(long, value_enum, default_value_t = Method::Random)]
        method: Method,

        /// Trial budget.
        #[arg(long, default_value_t = 50)]
        trials: usize,

        /// Cross-validation folds.
        #[arg(long, default_value_t = 5)]
        cv: usize,

        /// Wall-clock limit in seconds (seq only).
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        since: Option<i32>,

        #[arg(long)]
        until: Option<i32>,
    },

    /// Forecast production for the coming days, starting tomorrow.
    Predict {
        /// Number of days to forecast.
        #[arg(long, default_value_t = 2)]
        days: u32,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Forecast the current local day.
    Today {
        /// Include hours that have already passed.
        #[arg(long)]
        full: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Backtest the trained model against a year of actual production.
    Evaluate {
        /// Calendar year (default: last year).
        #[arg(long)]
        year: Option<i32>,
    },

    /// Show database and model state.
    Status,

    /// Grade archived weather forecasts against later observations.
    Accuracy {
        /// Only consider forecasts targeting the last N days.
        #[arg(long)]
        days: Option<u32>,

        /// Only grade this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Look up coordinates for a place name or postal code.
    Locate {
        /// Free-text query, e.g. "48149 Münster".
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Inspect or create the configuration file.
    Config {
        #[command(flatten)]
        action: ConfigAction,
    },

    /// Run diagnostic checks on the local setup.
    Doctor,

    /// Delete local state.
    Reset {
        /// Delete database, model and configuration.
        #[arg(long)]
        all: bool,

        /// Delete the database file.
        #[arg(long)]
        database: bool,

        /// Delete the trained model file.
        #[arg(long)]
        model_file: bool,

        /// Delete the configuration file.
        #[arg(long)]
        configuration: bool,

        /// Actually delete; without this, reset refuses to run.
        #[arg(long)]
        force: bool,

        /// Show what would be deleted without touching anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
pub struct ConfigAction {
    /// Print the effective configuration as TOML.
    #[arg(long)]
    pub show: bool,

    /// Write a default configuration file.
    #[arg(long)]
    pub init: bool,

    /// Print the configuration file path.
    #[arg(long)]
    pub path: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Method {
    /// Uniform random sampling.
    Random,
    /// Sequential search with pruning and timeout support.
    Seq,
}

impl From<Method> for SearchStrategy {
    fn from(method: Method) -> Self {
        match method {
            Method::Random => Self::Random,
            Method::Seq => Self::Sequential,
        }
    }
}

fn parse_model_kind(s: &str) -> Result<ModelKind, String> {
    s.parse()
}
