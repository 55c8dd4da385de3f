//! Configuration module for Quarry.
//!
//! Handles engine limits, storage locations and environment variables.

mod settings;

pub use settings::{
    expand_env_vars, CatalogSettings, EngineLimits, ExecutionSettings, FormatSettings,
    SchedulerSettings, Settings, SettingsError, SettingsResult, StorageSettings,
};
