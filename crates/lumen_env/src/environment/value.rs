//! Typed environment variable descriptors.
//!
//! A [`TypedEnvVar`] pairs an [`EnvVar`] key with parse/format callbacks so callers read
//! and write strongly typed values instead of raw strings.
//!
//! ```
//! use lumen_env::LOG_LEVEL;
//! use tracing::Level;
//!
//! let guard = LOG_LEVEL.set_guard(Level::DEBUG).expect("set log level");
//! assert_eq!(*guard, Level::DEBUG);
//! ```

use std::{fmt, ops::Deref, sync::OnceLock};

use super::{EnvVar, Environment, guard::EnvVarGuard};

/// Failures while reading or writing a typed variable.
#[derive(Debug, thiserror::Error)]
pub enum EnvVarError {
    #[error("failed to parse environment variable {name} from '{value}': {source}")]
    Parse {
        name: &'static str,
        /// Raw value found in the environment.
        value: String,
        source: EnvVarValueError,
    },
    #[error("failed to format environment variable {name}: {source}")]
    Format { name: &'static str, source: EnvVarValueError },
}

/// Message produced by a parse or format callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVarValueError(String);

impl EnvVarValueError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for EnvVarValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EnvVarValueError {}

impl From<&'static str> for EnvVarValueError {
    fn from(value: &'static str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EnvVarValueError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub type ParseFn<T> = fn(&str) -> Result<T, EnvVarValueError>;
pub type FormatFn<T> = fn(&T) -> Result<String, EnvVarValueError>;

/// Descriptor for a strongly typed environment variable.
pub struct TypedEnvVar<T> {
    var: EnvVar,
    parse: ParseFn<T>,
    format: FormatFn<T>,
}

impl<T> Clone for TypedEnvVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedEnvVar<T> {}

impl<T> TypedEnvVar<T> {
    pub const fn new(var: EnvVar, parse: ParseFn<T>, format: FormatFn<T>) -> Self {
        Self { var, parse, format }
    }

    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.var.key()
    }

    #[must_use]
    pub const fn var(&self) -> EnvVar {
        self.var
    }

    /// Read and parse the variable. `Ok(None)` when unset.
    pub fn get(&self) -> Result<Option<T>, EnvVarError> {
        let Some(raw) = Environment::get(self.var) else {
            return Ok(None);
        };
        (self.parse)(&raw).map(Some).map_err(|source| EnvVarError::Parse {
            name: self.key(),
            value: raw,
            source,
        })
    }

    /// Read the variable, falling back to `default` when unset or malformed.
    ///
    /// Malformed values are reported through `tracing` rather than silently dropped.
    pub fn get_or(&self, default: T) -> T {
        match self.get() {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                tracing::warn!(target: "lumen_env", error = %err, "ignoring malformed environment value");
                default
            }
        }
    }

    /// Read once and latch the result into `cache`; later environment changes are not observed.
    pub fn get_cached(&self, cache: &'static OnceLock<Option<T>>) -> Option<T>
    where
        T: Clone,
    {
        cache.get_or_init(|| self.get().ok().flatten()).clone()
    }

    pub fn set(&self, value: T) -> Result<(), EnvVarError> {
        let formatted = self.format_value(&value)?;
        Environment::set(self.var, &formatted);
        Ok(())
    }

    pub fn unset(&self) {
        Environment::remove(self.var);
    }

    /// Set the variable until the returned guard drops.
    pub fn set_guard(&self, value: T) -> Result<TypedEnvVarGuard<T>, EnvVarError> {
        let formatted = self.format_value(&value)?;
        let raw = EnvVarGuard::set(self.var, &formatted);
        Ok(TypedEnvVarGuard { _raw: raw, value })
    }

    /// Remove the variable until the returned guard drops.
    pub fn unset_guard(&self) -> EnvVarGuard {
        EnvVarGuard::unset(self.var)
    }

    fn format_value(&self, value: &T) -> Result<String, EnvVarError> {
        (self.format)(value).map_err(|source| EnvVarError::Format { name: self.key(), source })
    }
}

/// Keeps a typed value set for its lifetime, then restores the previous raw value.
#[must_use = "the previous value is restored as soon as the guard is dropped"]
pub struct TypedEnvVarGuard<T> {
    _raw: EnvVarGuard,
    value: T,
}

impl<T> TypedEnvVarGuard<T> {
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for TypedEnvVarGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

pub(crate) fn parse_bool(value: &str) -> Result<bool, EnvVarValueError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EnvVarValueError::new("value is not a recognised boolean")),
    }
}

pub(crate) fn format_display<T: fmt::Display>(value: &T) -> Result<String, EnvVarValueError> {
    Ok(value.to_string())
}
