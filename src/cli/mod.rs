//! Command-line parsing and validation for the `lumen` binary.

pub mod config;
pub mod error;

pub use config::CliConfig;
pub use error::CliError;
