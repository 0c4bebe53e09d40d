use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from {}: {source}", path.display())]
    LoadError {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
