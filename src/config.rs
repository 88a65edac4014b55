//! Configuration loading and validation.
//!
//! Precedence, lowest to highest: built-in defaults, the TOML config file,
//! `PVCAST__*` environment variables, then CLI flags applied by the caller.
//! The defaults describe the reference installation so a fresh checkout can
//! run every command without writing a config first.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub latitude: f64,
    pub longitude: f64,
    /// IANA timezone of the installation, used for the importer and the
    /// local-day window of `today`.
    pub timezone: String,
    /// Installed array capacity, for specific-yield reporting.
    pub peak_kwp: f64,
    pub db_path: PathBuf,
    pub model_path: PathBuf,
    /// Weather provider name, resolved by the source factory.
    pub provider: String,
}

impl Default for Config {
    fn default() -> Self {
        let dir = data_dir();
        Self {
            latitude: 51.83,
            longitude: 7.28,
            timezone: "Europe/Berlin".to_string(),
            peak_kwp: 9.92,
            db_path: dir.join("pvcast.db"),
            model_path: dir.join("model.bin"),
            provider: "open-meteo".to_string(),
        }
    }
}

impl Config {
    /// Load the effective configuration, merging `path` over the defaults
    /// and the environment over both.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PVCAST__").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            bail!("latitude {} out of range [-90, 90]", self.latitude);
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            bail!("longitude {} out of range [-180, 180]", self.longitude);
        }
        if self.peak_kwp < 0.0 {
            bail!("peak_kwp {} must not be negative", self.peak_kwp);
        }
        self.tz()?;
        Ok(())
    }

    /// The configured timezone, parsed.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| anyhow::anyhow!("unknown timezone '{}'", self.timezone))
    }

    /// Where the config file lives unless `PVCAST_CONFIG` points elsewhere.
    pub fn default_path() -> PathBuf {
        match std::env::var_os("PVCAST_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => data_dir().join("config.toml"),
        }
    }

    /// Render as TOML for `config --init` and `config --show`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

/// `~/.local/share/pvcast`, falling back to the working directory when no
/// home directory is known.
fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local").join("share").join("pvcast"))
        .unwrap_or_else(|| PathBuf::from("."))
}
