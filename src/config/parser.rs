//! Configuration file parsing (HOCON format).

use std::path::Path;

use crate::common::error::ConfigError;
use crate::config::types::Config;
use hocon::HoconLoader;

/// Load configuration from a HOCON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    HoconLoader::new()
        .load_file(path)
        .map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .resolve()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Load configuration from a HOCON string.
pub fn load_config_str(content: &str) -> Result<Config, ConfigError> {
    HoconLoader::new()
        .load_str(content)
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?
        .resolve()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = load_config_str(
            r#"
            shell {
                bundled_version = "1.4.0"
                remote_origin = "https://newtab.example.com/"
            }
            update {
                precache_timeout_ms = 20000
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.shell.bundled_version, "1.4.0");
        assert_eq!(config.shell.remote_origin, "https://newtab.example.com/");
        assert_eq!(config.shell.manifest_path, "/version.json");
        assert_eq!(config.update.precache_timeout_ms, 20_000);
        assert_eq!(config.update.check_delay_ms, 3_000);
        assert_eq!(config.storage.handshake_timeout_ms, 500);
    }

    #[test]
    fn test_wrong_type_is_a_parse_error() {
        let result = load_config_str(
            r#"
            update {
                max_failures = "many"
            }
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/tabshell.conf");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }
}
