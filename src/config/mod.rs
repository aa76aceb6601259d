//! Configuration parsing and types.

pub mod env;
pub mod parser;
pub mod types;
pub mod validate;

use tracing::info;

pub use env::{apply_env_overrides, get_config_path};
pub use parser::{load_config, load_config_str};
pub use types::*;
pub use validate::validate_config;

use crate::common::error::ConfigError;

/// Load the file at `path` (or the defaults when it does not exist), apply
/// environment overrides and validate.
pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config = if std::path::Path::new(path).exists() {
        load_config(path)?
    } else {
        info!(path, "No config file, using defaults");
        Config::default()
    };
    let config = apply_env_overrides(config);
    validate_config(&config)?;
    Ok(config)
}
