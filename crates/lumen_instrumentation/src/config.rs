//! Process-wide instrumentation configuration.

use std::path::PathBuf;
use std::sync::OnceLock;

use lumen_env::{EnvVarError, LOG_LEVEL, METRICS_CONSOLE, METRICS_JSONL_PATH};
use tracing::Level;

#[derive(Debug, thiserror::Error)]
pub enum AppConfigError {
    #[error("app configuration already initialised")]
    AlreadyInitialised,
    #[error("invalid log level '{value}'")]
    InvalidLogLevel { value: String },
    #[error("invalid boolean flag '{value}' for {name}")]
    InvalidBoolean { name: &'static str, value: String },
    #[error("failed to access instrumentation environment: {source}")]
    EnvVar {
        #[from]
        source: EnvVarError,
    },
}

/// Logging and metrics settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub log_level: Level,
    /// Append metrics as JSON lines to this file when set.
    pub metrics_jsonl_path: Option<PathBuf>,
    pub enable_console_metrics: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            metrics_jsonl_path: None,
            enable_console_metrics: false,
        }
    }
}

static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

impl AppConfig {
    /// Load configuration from the process environment, using defaults for unset variables.
    pub fn from_env() -> Result<Self, AppConfigError> {
        let log_level = match LOG_LEVEL.get() {
            Ok(value) => value.unwrap_or(Level::INFO),
            Err(EnvVarError::Parse { value, .. }) => return Err(AppConfigError::InvalidLogLevel { value }),
            Err(err) => return Err(err.into()),
        };

        let metrics_jsonl_path = METRICS_JSONL_PATH.get()?;

        let enable_console_metrics = match METRICS_CONSOLE.get() {
            Ok(value) => value.unwrap_or(false),
            Err(EnvVarError::Parse { value, .. }) => {
                return Err(AppConfigError::InvalidBoolean {
                    name: METRICS_CONSOLE.key(),
                    value,
                });
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            log_level,
            metrics_jsonl_path,
            enable_console_metrics,
        })
    }

    /// True when at least one metric sink is configured.
    pub fn metrics_enabled(&self) -> bool {
        self.enable_console_metrics || self.metrics_jsonl_path.is_some()
    }

    /// Store `config` as the global instance. Fails if one was already stored.
    pub fn initialise(config: AppConfig) -> Result<&'static Self, AppConfigError> {
        APP_CONFIG.set(config).map_err(|_| AppConfigError::AlreadyInitialised)?;
        APP_CONFIG.get().ok_or(AppConfigError::AlreadyInitialised)
    }

    /// Global configuration, loading it from the environment on first access.
    pub fn get_or_init_from_env() -> Result<&'static Self, AppConfigError> {
        if let Some(config) = APP_CONFIG.get() {
            return Ok(config);
        }
        let config = Self::from_env()?;
        // A concurrent initialiser may win the race; either value came from the same environment.
        Ok(APP_CONFIG.get_or_init(|| config))
    }

    pub fn try_global() -> Option<&'static Self> {
        APP_CONFIG.get()
    }
}
