//! TOML-based configuration for Quarry.
//!
//! Supports a config file (quarry.toml) with environment variable expansion
//! in path values.
//!
//! Example configuration:
//! ```toml
//! [limits]
//! max_joins = 7
//! row_cap = 10000
//! query_timeout_secs = 30
//!
//! [execution]
//! count_failed_attempts = true
//! export_dir = "${QUARRY_HOME}/exports"
//!
//! [scheduler]
//! tick_secs = 60
//! max_concurrency = 4
//!
//! [format]
//! currency_suffix = "€"
//!
//! [storage]
//! database = "./quarry.db"
//! data = "./business.db"
//!
//! [catalog]
//! path = "./catalog.toml"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Structural and resource limits.
    pub limits: EngineLimits,

    /// Execution engine behaviour.
    pub execution: ExecutionSettings,

    /// Scheduler sweep settings.
    pub scheduler: SchedulerSettings,

    /// Cell formatting.
    pub format: FormatSettings,

    /// Database locations.
    pub storage: StorageSettings,

    /// Data source catalog.
    pub catalog: CatalogSettings,
}

/// Limits enforced by the validator, engine and scheduler.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineLimits {
    pub max_joins: usize,
    pub max_columns: usize,
    pub max_aggregations: usize,
    pub max_filters: usize,
    /// Active schedules allowed per tenant.
    pub max_active_schedules: usize,
    /// Rows returned by one run; more are cut and flagged.
    pub row_cap: usize,
    pub query_timeout_secs: u64,
    /// Rows returned by a test run.
    pub preview_limit: usize,
    /// Advisor cost above which a report counts as complex.
    pub high_cost_threshold: u32,
    pub very_high_cost_threshold: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_joins: 7,
            max_columns: 50,
            max_aggregations: 10,
            max_filters: 20,
            max_active_schedules: 10,
            row_cap: 10_000,
            query_timeout_secs: 30,
            preview_limit: 20,
            high_cost_threshold: 300,
            very_high_cost_threshold: 500,
        }
    }
}

impl EngineLimits {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Count a run toward `execution_count` once it compiled, even if it later failed.
    pub count_failed_attempts: bool,

    /// Directory exports are written to (supports ${ENV_VAR} expansion).
    pub export_dir: Option<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            count_failed_attempts: true,
            export_dir: None,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between sweeps.
    pub tick_secs: u64,

    /// Due schedules run concurrently up to this many at once.
    pub max_concurrency: usize,

    /// Directory scheduled artifacts are delivered to; logs only when unset.
    pub delivery_dir: Option<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            max_concurrency: 4,
            delivery_dir: None,
        }
    }
}

/// Cell formatting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FormatSettings {
    /// Appended to currency values after a space.
    pub currency_suffix: String,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            currency_suffix: "€".to_string(),
        }
    }
}

/// Database locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Report definitions, executions and schedules.
    pub database: String,

    /// Business data reports query. Same file as `database` when unset.
    pub data: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: "quarry.db".to_string(),
            data: None,
        }
    }
}

/// Catalog settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CatalogSettings {
    /// TOML catalog file; the built-in catalog is used when unset.
    pub path: Option<String>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SettingsResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and check settings from TOML text.
    pub fn from_toml_str(content: &str) -> SettingsResult<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `QUARRY_CONFIG`
    /// 2. `./quarry.toml`
    /// 3. `~/.config/quarry/config.toml`
    pub fn load() -> SettingsResult<Self> {
        if let Ok(path) = env::var("QUARRY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("quarry.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("quarry").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> SettingsResult<()> {
        if self.limits.row_cap == 0 {
            return Err(SettingsError::InvalidConfig(
                "limits.row_cap must be at least 1".into(),
            ));
        }
        if self.limits.query_timeout_secs == 0 {
            return Err(SettingsError::InvalidConfig(
                "limits.query_timeout_secs must be at least 1".into(),
            ));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(SettingsError::InvalidConfig(
                "scheduler.max_concurrency must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(SettingsError::InvalidConfig(
                "scheduler.tick_secs must be at least 1".into(),
            ));
        }
        if self.limits.very_high_cost_threshold < self.limits.high_cost_threshold {
            return Err(SettingsError::InvalidConfig(
                "limits.very_high_cost_threshold must not be below high_cost_threshold".into(),
            ));
        }
        Ok(())
    }

    /// Report store database path.
    pub fn database_path(&self) -> SettingsResult<PathBuf> {
        Ok(PathBuf::from(expand_env_vars(&self.storage.database)?))
    }

    /// Business data database path.
    pub fn data_path(&self) -> SettingsResult<PathBuf> {
        match &self.storage.data {
            Some(path) => Ok(PathBuf::from(expand_env_vars(path)?)),
            None => self.database_path(),
        }
    }

    /// Export directory, if configured.
    pub fn export_dir(&self) -> SettingsResult<Option<PathBuf>> {
        resolve_optional_path(self.execution.export_dir.as_deref())
    }

    /// Delivery directory for scheduled artifacts, if configured.
    pub fn delivery_dir(&self) -> SettingsResult<Option<PathBuf>> {
        resolve_optional_path(self.scheduler.delivery_dir.as_deref())
    }

    /// Catalog file path, if configured.
    pub fn catalog_path(&self) -> SettingsResult<Option<PathBuf>> {
        resolve_optional_path(self.catalog.path.as_deref())
    }
}

fn resolve_optional_path(path: Option<&str>) -> SettingsResult<Option<PathBuf>> {
    path.map(|p| expand_env_vars(p).map(PathBuf::from))
        .transpose()
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> SettingsResult<String> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|&ch| ch != '}') {
                name.push(ch);
            }
            chars.next(); // consume '}'
            name
        } else {
            // $VAR (ends at non-alphanumeric/underscore)
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|&ch| ch.is_alphanumeric() || ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
