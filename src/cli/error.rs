use thiserror::Error;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Error when file path is invalid or doesn't exist
    #[error("File path error: {0}")]
    FilePathError(String),

    /// Error when required argument is missing
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl CliError {
    pub fn file_path_error(path: impl Into<String>) -> Self {
        Self::FilePathError(path.into())
    }

    pub fn missing_argument(arg: impl Into<String>) -> Self {
        Self::MissingArgument(arg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
