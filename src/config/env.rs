//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `TABSHELL_BUNDLED_VERSION` - Version shipped with the extension
//! - `TABSHELL_REMOTE_ORIGIN` - Remote origin serving the shell
//! - `TABSHELL_MANIFEST_PATH` - Version manifest path on the remote origin
//! - `TABSHELL_STORAGE_PATH` - Persisted state file
//! - `TABSHELL_CACHE_DIR` - Asset cache directory
//! - `TABSHELL_CHECK_DELAY_MS` - Delay before the version check

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "TABSHELL";

/// Serializes tests that mutate the process environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn var(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Apply environment variable overrides to a config.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Some(version) = var("BUNDLED_VERSION") {
        config.shell.bundled_version = version;
    }
    if let Some(origin) = var("REMOTE_ORIGIN") {
        config.shell.remote_origin = origin;
    }
    if let Some(path) = var("MANIFEST_PATH") {
        config.shell.manifest_path = path;
    }
    if let Some(path) = var("STORAGE_PATH") {
        config.storage.path = path;
    }
    if let Some(dir) = var("CACHE_DIR") {
        config.storage.cache_dir = dir;
    }
    if let Some(delay) = var("CHECK_DELAY_MS") {
        if let Ok(delay) = delay.parse() {
            config.update.check_delay_ms = delay;
        }
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `TABSHELL_CONFIG`, otherwise returns "tabshell.conf".
pub fn get_config_path() -> String {
    var("CONFIG").unwrap_or_else(|| "tabshell.conf".to_string())
}
