//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::common::error::ConfigError;
use crate::update::semver::Version;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Where the two versions of the shell live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Version shipped with the extension package.
    pub bundled_version: String,
    /// Bundled entry point, relative to the extension root.
    pub local_entry: String,
    pub remote_origin: String,
    /// Path of the version manifest on the remote origin.
    pub manifest_path: String,
    pub remote_load_timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            bundled_version: env!("CARGO_PKG_VERSION").to_string(),
            local_entry: "index.html".to_string(),
            remote_origin: "https://tabshell.app/".to_string(),
            manifest_path: "/version.json".to_string(),
            remote_load_timeout_ms: 800,
        }
    }
}

/// Version check, precache and backoff timings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub check_delay_ms: u64,
    pub manifest_timeout_ms: u64,
    pub precache_timeout_ms: u64,
    pub teardown_grace_ms: u64,
    pub max_failures: u32,
    pub backoff_window_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_delay_ms: 3_000,
            manifest_timeout_ms: 5_000,
            precache_timeout_ms: 15_000,
            teardown_grace_ms: 1_000,
            max_failures: 3,
            backoff_window_secs: 300,
        }
    }
}

/// Persisted state location, asset cache directory and bridge handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Where precached remote assets are kept between sessions.
    pub cache_dir: String,
    pub handshake_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "tabshell-state.json".to_string(),
            cache_dir: "tabshell-cache".to_string(),
            handshake_timeout_ms: 500,
        }
    }
}

impl Config {
    pub fn bundled_version(&self) -> Version {
        Version::parse(&self.shell.bundled_version)
    }

    pub fn remote_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.shell.remote_origin).map_err(|e| ConfigError::ValidationError {
            message: format!("shell.remote_origin '{}': {}", self.shell.remote_origin, e),
        })
    }

    pub fn manifest_url(&self) -> Result<Url, ConfigError> {
        self.remote_url()?
            .join(&self.shell.manifest_path)
            .map_err(|e| ConfigError::ValidationError {
                message: format!("shell.manifest_path '{}': {}", self.shell.manifest_path, e),
            })
    }

    pub fn remote_load_timeout(&self) -> Duration {
        Duration::from_millis(self.shell.remote_load_timeout_ms)
    }
}

impl UpdateConfig {
    pub fn check_delay(&self) -> Duration {
        Duration::from_millis(self.check_delay_ms)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.manifest_timeout_ms)
    }

    pub fn precache_timeout(&self) -> Duration {
        Duration::from_millis(self.precache_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.backoff_window_secs)
    }
}

impl StorageConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
