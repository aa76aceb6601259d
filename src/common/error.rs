//! Error types for the application.

use thiserror::Error;

/// Top-level application error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Errors raised by a key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode stored value: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Errors on the cross-context storage bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("No ready acknowledgment from host within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Bridge client closed")]
    Closed,

    #[error("Host reported failure: {message}")]
    Remote { message: String },

    #[error("Unexpected response for request {id}")]
    UnexpectedResponse { id: String },
}

/// Errors while checking the remote version manifest.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Manifest request returned status {status}")]
    Status { status: u16 },

    #[error("Malformed manifest: {message}")]
    MalformedManifest { message: String },

    #[error("Manifest request timed out")]
    Timeout,

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from launching or loading a browsing context.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to launch frame for {url}: {message}")]
    LaunchFailed { url: String, message: String },

    #[error("Frame failed to load {url}: {message}")]
    LoadFailed { url: String, message: String },

    #[error("Frame did not load within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Result type alias for frame operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;
