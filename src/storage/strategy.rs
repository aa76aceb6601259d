//! Storage backend selection.

use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

/// Which backend the current process persists through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStrategy {
    /// The extension's own synchronized store is reachable.
    DirectExtension,
    /// Embedded in a parent that owns the store; go through the bridge.
    BridgedRemote,
    /// Neither; use origin-local storage.
    LocalFallback,
}

impl StorageStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectExtension => "direct-extension-store",
            Self::BridgedRemote => "bridged-remote-store",
            Self::LocalFallback => "local-fallback-store",
        }
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves the strategy once and remembers it.
///
/// The only change allowed after resolution is `BridgedRemote` to
/// `LocalFallback`, after a failed handshake. It is never undone.
#[derive(Debug)]
pub struct StorageStrategyResolver {
    extension_available: bool,
    embedded: bool,
    resolved: Mutex<Option<StorageStrategy>>,
}

impl StorageStrategyResolver {
    pub fn new(extension_available: bool, embedded: bool) -> Self {
        Self {
            extension_available,
            embedded,
            resolved: Mutex::new(None),
        }
    }

    pub fn resolve(&self) -> StorageStrategy {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(strategy) = *resolved {
            return strategy;
        }
        let strategy = if self.extension_available {
            StorageStrategy::DirectExtension
        } else if self.embedded {
            StorageStrategy::BridgedRemote
        } else {
            StorageStrategy::LocalFallback
        };
        info!(%strategy, "Resolved storage strategy");
        *resolved = Some(strategy);
        strategy
    }

    /// Downgrade a bridged strategy to local fallback.
    ///
    /// Returns false (and changes nothing) for any other strategy.
    pub fn downgrade_to_local(&self) -> bool {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        match *resolved {
            Some(StorageStrategy::BridgedRemote) => {
                warn!("Storage bridge unavailable, falling back to local storage");
                *resolved = Some(StorageStrategy::LocalFallback);
                true
            }
            _ => false,
        }
    }

    /// The memoized strategy, if resolved yet.
    pub fn current(&self) -> Option<StorageStrategy> {
        *self.resolved.lock().unwrap_or_else(|e| e.into_inner())
    }
}
