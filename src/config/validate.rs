//! Configuration validation.
//!
//! Validates configuration values and reports every problem at once.

use std::sync::LazyLock;

use fancy_regex::Regex;

use crate::common::error::ConfigError;
use crate::config::types::Config;

const VERSION_PATTERN: &str = r"^\d+\.\d+\.\d+$";

static VERSION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(VERSION_PATTERN).ok());

fn is_version(s: &str) -> bool {
    VERSION_RE
        .as_ref()
        .and_then(|re| re.is_match(s.trim()).ok())
        .unwrap_or(false)
}

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Shell
    if !is_version(&config.shell.bundled_version) {
        errors.push(format!(
            "shell.bundled_version '{}' is not a major.minor.patch version",
            config.shell.bundled_version
        ));
    }
    if config.shell.local_entry.is_empty() {
        errors.push("shell.local_entry is required".to_string());
    }
    match config.remote_url() {
        Ok(url) if url.scheme() != "https" && url.scheme() != "http" => {
            errors.push(format!(
                "shell.remote_origin must be http(s) (got '{}')",
                url.scheme()
            ));
        }
        Ok(_) => {
            if let Err(e) = config.manifest_url() {
                errors.push(e.to_string());
            }
        }
        Err(e) => errors.push(e.to_string()),
    }
    if !config.shell.manifest_path.starts_with('/') {
        errors.push(format!(
            "shell.manifest_path '{}' must start with '/'",
            config.shell.manifest_path
        ));
    }

    // Timings
    let timings = [
        ("shell.remote_load_timeout_ms", config.shell.remote_load_timeout_ms),
        ("update.manifest_timeout_ms", config.update.manifest_timeout_ms),
        ("update.precache_timeout_ms", config.update.precache_timeout_ms),
        ("update.backoff_window_secs", config.update.backoff_window_secs),
        ("storage.handshake_timeout_ms", config.storage.handshake_timeout_ms),
    ];
    for (name, value) in timings {
        if value == 0 {
            errors.push(format!("{} must be non-zero", name));
        }
    }
    if config.update.max_failures == 0 {
        errors.push("update.max_failures must be non-zero".to_string());
    }

    if config.storage.path.is_empty() {
        errors.push("storage.path is required".to_string());
    }
    if config.storage.cache_dir.is_empty() {
        errors.push("storage.cache_dir is required".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
