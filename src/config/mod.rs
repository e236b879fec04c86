//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required values are missing
//! or malformed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding every record pool.
    pub database_path: PathBuf,
    /// How long a writer waits for a concurrent writer before giving up.
    pub busy_timeout: Duration,
    pub deletion_policy: DeletionPolicy,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Whether a database with records still in custody may be deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete regardless of outstanding requested/assigned records.
    #[default]
    Unconditional,
    /// Refuse while any record is requested or assigned.
    RefuseOutstanding,
}

impl std::str::FromStr for DeletionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unconditional" => Ok(DeletionPolicy::Unconditional),
            "refuse_outstanding" => Ok(DeletionPolicy::RefuseOutstanding),
            _ => Err(Error::Config(format!(
                "deletion policy must be 'unconditional' or 'refuse_outstanding', got '{s}'"
            ))),
        }
    }
}

/// On-disk shape of the TOML config file.
#[derive(Debug, Deserialize)]
struct FileConfig {
    database_path: PathBuf,
    busy_timeout_ms: Option<u64>,
    #[serde(default)]
    deletion_policy: DeletionPolicy,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let busy_timeout_ms = match std::env::var("LEADPOOL_BUSY_TIMEOUT_MS") {
            Ok(raw) => raw.parse().map_err(|e| {
                Error::Config(format!("LEADPOOL_BUSY_TIMEOUT_MS must be an integer: {e}"))
            })?,
            Err(_) => DEFAULT_BUSY_TIMEOUT_MS,
        };
        let deletion_policy = match std::env::var("LEADPOOL_DELETION_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => DeletionPolicy::default(),
        };

        Ok(Self {
            database_path: PathBuf::from(required_var("LEADPOOL_DATABASE_PATH")?),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            deletion_policy,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;

        Ok(Self {
            database_path: file.database_path,
            busy_timeout: Duration::from_millis(
                file.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            ),
            deletion_policy: file.deletion_policy,
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
