//! Process configuration.
//!
//! Service settings come from `PARKD_*` environment variables. Facilities,
//! affiliations and the administrative charge table come from a JSON file
//! named by `PARKD_FACILITIES`. Money values in that file are strings
//! (`"2.50"`) so they are read as exact decimals.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use ulid::Ulid;

use crate::billing::ChargeRule;
use crate::model::{Affiliation, FacilityCapacity};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
const DEFAULT_COUNTER_TIMEOUT_MS: u64 = 500;
const DEFAULT_REJECTION_LOOKBACK_DAYS: u32 = 365;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid facility file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub counter_timeout: Duration,
    pub facilities_file: Option<PathBuf>,
    pub rejection_lookback_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.parse::<u64>().ok());
        Self {
            data_dir: PathBuf::from(lookup("PARKD_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into())),
            metrics_port: lookup("PARKD_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: parsed("PARKD_COMPACT_THRESHOLD").unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            counter_timeout: Duration::from_millis(
                parsed("PARKD_COUNTER_TIMEOUT_MS").unwrap_or(DEFAULT_COUNTER_TIMEOUT_MS),
            ),
            facilities_file: lookup("PARKD_FACILITIES").map(PathBuf::from),
            rejection_lookback_days: lookup("PARKD_REJECTION_LOOKBACK_DAYS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REJECTION_LOOKBACK_DAYS),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkd.wal")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FacilityConfig {
    pub id: Ulid,
    pub name: String,
    pub capacity: FacilityCapacity,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FacilityFile {
    pub facilities: Vec<FacilityConfig>,
    #[serde(default)]
    pub affiliations: Vec<Affiliation>,
    #[serde(default)]
    pub charge_rules: Vec<ChargeRule>,
}

impl FacilityFile {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
