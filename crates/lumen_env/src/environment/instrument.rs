//! Logging and metrics environment variables.

use std::path::PathBuf;

use tracing::Level;

use super::EnvVar;
use super::value::{EnvVarValueError, TypedEnvVar, format_display, parse_bool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentEnvVar {
    /// Minimum tracing level.
    LogLevel,
    /// Where metrics are appended as JSON lines.
    MetricsJsonlPath,
    /// Print metrics to stdout when truthy.
    MetricsConsole,
}

impl InstrumentEnvVar {
    pub const fn key(self) -> &'static str {
        match self {
            InstrumentEnvVar::LogLevel => "LUMEN_LOG_LEVEL",
            InstrumentEnvVar::MetricsJsonlPath => "LUMEN_METRICS_JSONL_PATH",
            InstrumentEnvVar::MetricsConsole => "LUMEN_METRICS_CONSOLE",
        }
    }

    pub const fn into_env(self) -> EnvVar {
        EnvVar::Instrument(self)
    }
}

pub const LOG_LEVEL: TypedEnvVar<Level> = TypedEnvVar::new(InstrumentEnvVar::LogLevel.into_env(), parse_log_level, format_display::<Level>);

pub const METRICS_JSONL_PATH: TypedEnvVar<PathBuf> =
    TypedEnvVar::new(InstrumentEnvVar::MetricsJsonlPath.into_env(), parse_path, format_path);

pub const METRICS_CONSOLE: TypedEnvVar<bool> = TypedEnvVar::new(InstrumentEnvVar::MetricsConsole.into_env(), parse_bool, format_display::<bool>);

fn parse_log_level(value: &str) -> Result<Level, EnvVarValueError> {
    value.trim().parse::<Level>().map_err(|_| EnvVarValueError::new("invalid tracing level"))
}

pub(crate) fn parse_path(value: &str) -> Result<PathBuf, EnvVarValueError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EnvVarValueError::new("path must not be empty"));
    }
    Ok(PathBuf::from(trimmed))
}

pub(crate) fn format_path(path: &PathBuf) -> Result<String, EnvVarValueError> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| EnvVarValueError::new("path is not valid UTF-8"))
}

#[cfg(test)]
mod instrument_test {
    use serial_test::serial;

    use super::*;
    use crate::{EnvVarError, EnvVarGuard, Environment};

    #[test]
    #[serial]
    fn test_log_level_round_trips_through_guard() {
        let _clear = LOG_LEVEL.unset_guard();
        {
            let guard = LOG_LEVEL.set_guard(Level::WARN).expect("set level");
            assert_eq!(*guard, Level::WARN);
            assert_eq!(LOG_LEVEL.get().expect("read level"), Some(Level::WARN));
        }
        assert!(!Environment::is_set(InstrumentEnvVar::LogLevel));
    }

    #[test]
    #[serial]
    fn test_malformed_bool_reports_raw_value() {
        let _bad = EnvVarGuard::set(InstrumentEnvVar::MetricsConsole, "perhaps");
        match METRICS_CONSOLE.get() {
            Err(EnvVarError::Parse { name, value, .. }) => {
                assert_eq!(name, "LUMEN_METRICS_CONSOLE");
                assert_eq!(value, "perhaps");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(!METRICS_CONSOLE.get_or(false));
    }

    #[test]
    #[serial]
    fn test_empty_path_is_rejected() {
        let _empty = EnvVarGuard::set(InstrumentEnvVar::MetricsJsonlPath, "   ");
        assert!(METRICS_JSONL_PATH.get().is_err());
    }
}
