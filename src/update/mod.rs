//! Update distribution: version ordering, persisted update state, backoff,
//! and the background version check that prepares the next session.

pub mod backoff;
pub mod checker;
pub mod manifest;
pub mod semver;
pub mod state;

pub use backoff::{BackoffTracker, BACKOFF_WINDOW, MAX_FAILURES};
pub use checker::{CheckOutcome, CheckPhase, CheckerSettings, VersionChecker};
pub use manifest::{HttpManifestSource, ManifestSource, VersionManifest};
pub use semver::{compare, Version};
pub use state::{UpdateState, UpdateStateStore};
