//! Store configuration.
//!
//! Loaded from a JSON file, then overridden by `SHEETBASE_*` environment
//! variables (a `.env` file in the working directory is honoured).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::sheets::retry::RetryPolicy;

pub const ENV_SPREADSHEET_ID: &str = "SHEETBASE_SPREADSHEET_ID";
pub const ENV_ACCESS_TOKEN: &str = "SHEETBASE_ACCESS_TOKEN";
pub const ENV_API_BASE_URL: &str = "SHEETBASE_API_BASE_URL";
pub const ENV_MAX_ATTEMPTS: &str = "SHEETBASE_MAX_ATTEMPTS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Id of the spreadsheet holding every table
    pub spreadsheet_id: String,
    /// OAuth bearer token sent with each request
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            access_token: None,
            api_base_url: "https://sheets.googleapis.com/v4".to_string(),
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// `<config dir>/sheetbase/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sheetbase").join("config.json"))
    }

    /// [`resolve`](Self::resolve) followed by [`validate`](Self::validate)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::resolve(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, or the default file when it exists, then apply the
    /// environment. Without any file the defaults are used.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(id) = var(ENV_SPREADSHEET_ID) {
            self.spreadsheet_id = id;
        }
        if let Some(token) = var(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
        if let Some(url) = var(ENV_API_BASE_URL) {
            self.api_base_url = url;
        }
        if let Some(raw) = var(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_MAX_ATTEMPTS,
                value: raw,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "spreadsheet_id is empty (set it in the config file or {})",
                ENV_SPREADSHEET_ID
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}
