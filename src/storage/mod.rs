//! Key-value persistence that works the same inside the extension, inside
//! an embedded remote frame, and in a plain tab.
//!
//! - `store`: the `KeyValueStore` trait and its backends
//! - `strategy`: one-time backend selection
//! - `runtime`: per-context lifecycle tying strategy, bridge and backends
//! - `persistent`: reactive values on top of the runtime

pub mod persistent;
pub mod runtime;
pub mod store;
pub mod strategy;

pub use persistent::PersistentState;
pub use runtime::{HostEnvironment, StorageRuntime};
pub use store::{
    ChangeSet, FileStore, KeyValueStore, LocalFallbackStore, MemoryStore, StorageChange, StorageMap,
};
pub use strategy::{StorageStrategy, StorageStrategyResolver};
