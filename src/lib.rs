//! Hourly photovoltaic power forecasting for a residential installation.
//!
//! The pipeline: import inverter production logs, fetch matching weather
//! history, train a regression model mapping weather and time-of-day
//! features to power, then apply the model to forecast weather. The crate
//! splits into the pure core (solar geometry, feature building, dataset
//! assembly, training, tuning, prediction, evaluation) and the plumbing
//! around it (SQLite store, weather sources, CSV import, geocoding, CLI).

pub mod accuracy;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod features;
pub mod geocode;
pub mod import;
pub mod model;
pub mod predict;
pub mod solar;
pub mod sources;
pub mod store;
pub mod telemetry;
pub mod training;
pub mod tuning;

pub use config::Config;
pub use dataset::{Dataset, ProductionReading};
pub use model::{BoostCapability, ModelKind};
pub use predict::Forecast;
pub use sources::WeatherRecord;
