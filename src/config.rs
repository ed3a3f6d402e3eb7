//! Configuration loaded from `~/.speedwatch/config.yaml`.
//!
//! A missing file is not an error: every key has a default, so
//! `speedwatch submit https://example.com` works out of the box against
//! the public WebPageTest instance (given `WPT_API_KEY`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cycle::FailurePolicy;
use crate::metrics::{ThresholdError, ThresholdSet};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Holds the SQLite database. `~/` is expanded.
    pub data_dir: PathBuf,
    /// Key under which the active activation id is persisted.
    pub owner: String,
    pub max_outstanding_jobs: usize,
    pub poll_interval_secs: u64,
    /// Daemon only: re-submit `targets` this often.
    pub submit_interval_hours: Option<u64>,
    pub lease_ttl_secs: u64,
    pub failure_policy: FailurePolicy,
    pub service: ServiceConfig,
    pub targets: Vec<String>,
    /// Metric key → limit. Keys left out are never alerted on.
    pub thresholds: BTreeMap<String, f64>,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Device/network profile, in WebPageTest `location` syntax.
    pub location: String,
    pub mobile: bool,
    pub first_view_only: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub recipients: Vec<String>,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub from: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.speedwatch"),
            owner: "speedwatch".into(),
            max_outstanding_jobs: 10,
            poll_interval_secs: 300,
            submit_interval_hours: None,
            lease_ttl_secs: 900,
            failure_policy: FailurePolicy::default(),
            service: ServiceConfig::default(),
            targets: Vec::new(),
            thresholds: BTreeMap::new(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.webpagetest.org".into(),
            api_key: None,
            location: "Dulles_MotoG4:Moto G4 - Chrome.3GFast".into(),
            mobile: true,
            first_view_only: true,
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// `$SPEEDWATCH_CONFIG`, else `~/.speedwatch/config.yaml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SPEEDWATCH_CONFIG") {
            return PathBuf::from(path);
        }
        expand_home(Path::new("~/.speedwatch/config.yaml"))
    }

    /// Load, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.data_dir = expand_home(&config.data_dir);
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("WPT_API_KEY") {
            self.service.api_key = Some(key);
        }
        if let (Ok(password), Some(smtp)) = (std::env::var("SMTP_PASSWORD"), self.alerts.smtp.as_mut()) {
            smtp.password = Some(password);
        }
        self.data_dir = expand_home(&self.data_dir);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outstanding_jobs == 0 {
            return Err(ConfigError::Invalid("max_outstanding_jobs must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lease_ttl_secs must be at least 1".into()));
        }
        if self.submit_interval_hours == Some(0) {
            return Err(ConfigError::Invalid("submit_interval_hours must be at least 1".into()));
        }
        if self.owner.trim().is_empty() {
            return Err(ConfigError::Invalid("owner must not be empty".into()));
        }
        self.threshold_set()?;
        Ok(())
    }

    pub fn threshold_set(&self) -> Result<ThresholdSet, ConfigError> {
        Ok(ThresholdSet::from_map(&self.thresholds)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("speedwatch.db")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// ── Threshold Sources ───────────────────────────────────────────────

/// Supplies the threshold set at the start of each poll cycle.
pub trait ThresholdSource: Send + Sync {
    fn load(&self) -> Result<ThresholdSet>;
}

impl ThresholdSource for ThresholdSet {
    fn load(&self) -> Result<ThresholdSet> {
        Ok(self.clone())
    }
}

/// Re-reads the config file every cycle so limits can be tuned without
/// restarting the daemon.
pub struct ConfigThresholds {
    path: PathBuf,
}

impl ConfigThresholds {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ThresholdSource for ConfigThresholds {
    fn load(&self) -> Result<ThresholdSet> {
        Ok(Config::load(&self.path)?.threshold_set()?)
    }
}
