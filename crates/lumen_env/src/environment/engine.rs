//! Execution engine environment variables.
//!
//! Strategy overrides are kept as strings here; the engine owns the mapping from names to
//! kernel strategies so this crate stays free of engine types.

use std::path::PathBuf;

use super::EnvVar;
use super::instrument::{format_path, parse_path};
use super::value::{EnvVarValueError, TypedEnvVar, format_display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineEnvVar {
    /// Convolution strategy override: `direct`, `im2col` or `auto`.
    ConvStrategy,
    /// Matrix multiply strategy override: `naive`, `blocked` or `auto`.
    MatmulStrategy,
    /// Root directory of the `.npy` weight store.
    WeightsDir,
    /// Maximum number of queued operations before the host backend drains its queue.
    MaxPendingOps,
}

impl EngineEnvVar {
    pub const fn key(self) -> &'static str {
        match self {
            EngineEnvVar::ConvStrategy => "LUMEN_CONV_STRATEGY",
            EngineEnvVar::MatmulStrategy => "LUMEN_MATMUL_STRATEGY",
            EngineEnvVar::WeightsDir => "LUMEN_WEIGHTS_DIR",
            EngineEnvVar::MaxPendingOps => "LUMEN_MAX_PENDING_OPS",
        }
    }

    pub const fn into_env(self) -> EnvVar {
        EnvVar::Engine(self)
    }
}

pub const CONV_STRATEGY: TypedEnvVar<String> = TypedEnvVar::new(EngineEnvVar::ConvStrategy.into_env(), parse_name, format_display::<String>);

pub const MATMUL_STRATEGY: TypedEnvVar<String> =
    TypedEnvVar::new(EngineEnvVar::MatmulStrategy.into_env(), parse_name, format_display::<String>);

pub const WEIGHTS_DIR: TypedEnvVar<PathBuf> = TypedEnvVar::new(EngineEnvVar::WeightsDir.into_env(), parse_path, format_path);

pub const MAX_PENDING_OPS: TypedEnvVar<usize> =
    TypedEnvVar::new(EngineEnvVar::MaxPendingOps.into_env(), parse_positive, format_display::<usize>);

fn parse_name(value: &str) -> Result<String, EnvVarValueError> {
    Ok(value.trim().to_ascii_lowercase())
}

fn parse_positive(value: &str) -> Result<usize, EnvVarValueError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(EnvVarValueError::new("value must be greater than zero")),
        Ok(parsed) => Ok(parsed),
        Err(err) => Err(EnvVarValueError::new(err.to_string())),
    }
}
