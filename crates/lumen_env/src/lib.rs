//! Shared process environment helpers for the lumen engine, instrumentation and CLI.

pub mod environment;

pub use environment::{
    EnvVar, Environment, engine::{CONV_STRATEGY, EngineEnvVar, MATMUL_STRATEGY, MAX_PENDING_OPS, WEIGHTS_DIR}, guard::EnvVarGuard, instrument::{InstrumentEnvVar, LOG_LEVEL, METRICS_CONSOLE, METRICS_JSONL_PATH}, value::{EnvVarError, EnvVarValueError, TypedEnvVar, TypedEnvVarGuard}
};
