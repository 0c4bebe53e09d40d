use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{Config, DatabaseSettings, LogSettings, Overrides, ServerSettings};

/// Prefix for environment variables that override file values,
/// e.g. `MPSERVER__DATABASE__PASSWORD`.
pub const ENV_PREFIX: &str = "MPSERVER";

/// Loads the service configuration from a TOML file.
///
/// The file is layered with `MPSERVER__*` environment variables (so secrets can
/// stay out of the file), deserialized into our strongly-typed `Config` struct
/// and validated before it is returned.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|c| c.try_deserialize::<Config>())
        .map_err(|source| ConfigError::LoadError {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;

    tracing::debug!(path = %path.display(), database = ?config.database, "Configuration loaded.");
    Ok(config)
}
