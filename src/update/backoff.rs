//! Fixed-window backoff for the remote origin.
//!
//! After `max_failures` failed loads the remote path is blocked until the
//! window since the last failure has elapsed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::state::UpdateStateStore;
use crate::common::clock::Clock;
use crate::common::error::StorageResult;

pub const MAX_FAILURES: u32 = 3;
pub const BACKOFF_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct BackoffTracker {
    state: UpdateStateStore,
    clock: Arc<dyn Clock>,
    max_failures: u32,
    window: Duration,
}

impl BackoffTracker {
    pub fn new(state: UpdateStateStore, clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(state, clock, MAX_FAILURES, BACKOFF_WINDOW)
    }

    pub fn with_limits(
        state: UpdateStateStore,
        clock: Arc<dyn Clock>,
        max_failures: u32,
        window: Duration,
    ) -> Self {
        Self {
            state,
            clock,
            max_failures,
            window,
        }
    }

    /// Whether remote attempts are currently suppressed.
    ///
    /// Once the window has elapsed the counter is reset and this returns
    /// false. A storage error reads as "not blocked".
    pub async fn is_blocked(&self) -> bool {
        match self.check().await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!("Failed to read backoff state: {}", e);
                false
            }
        }
    }

    async fn check(&self) -> StorageResult<bool> {
        let state = self.state.load().await?;
        if state.fail_count < self.max_failures {
            return Ok(false);
        }
        let elapsed = self.clock.now_ms() - state.fail_timestamp.unwrap_or(0);
        if elapsed < self.window.as_millis() as i64 {
            return Ok(true);
        }
        info!(
            failures = state.fail_count,
            "Backoff window elapsed, allowing remote again"
        );
        self.state.write_failures(0, state.fail_timestamp).await?;
        Ok(false)
    }

    /// Count one more failure, stamped now.
    pub async fn record_failure(&self) -> StorageResult<u32> {
        let state = self.state.load().await?;
        let count = state.fail_count.saturating_add(1);
        self.state
            .write_failures(count, Some(self.clock.now_ms()))
            .await?;
        if count >= self.max_failures {
            warn!(
                failures = count,
                window_secs = self.window.as_secs(),
                "Remote origin backed off"
            );
        }
        Ok(count)
    }

    pub async fn clear(&self) -> StorageResult<()> {
        self.state.clear_failures().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::storage::store::MemoryStore;

    fn tracker() -> (BackoffTracker, UpdateStateStore, Arc<ManualClock>) {
        let state = UpdateStateStore::new(Arc::new(MemoryStore::new()));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (BackoffTracker::new(state.clone(), clock.clone()), state, clock)
    }

    #[tokio::test]
    async fn test_blocks_after_max_failures() {
        let (tracker, _, _) = tracker();
        for n in 1..MAX_FAILURES {
            assert_eq!(tracker.record_failure().await.unwrap(), n);
            assert!(!tracker.is_blocked().await);
        }
        tracker.record_failure().await.unwrap();
        assert!(tracker.is_blocked().await);
    }

    #[tokio::test]
    async fn test_window_elapse_unblocks_and_resets() {
        let (tracker, state, clock) = tracker();
        for _ in 0..MAX_FAILURES {
            tracker.record_failure().await.unwrap();
        }
        clock.advance(BACKOFF_WINDOW.as_millis() as i64 - 1);
        assert!(tracker.is_blocked().await);

        clock.advance(1);
        assert!(!tracker.is_blocked().await);
        let loaded = state.load().await.unwrap();
        assert_eq!(loaded.fail_count, 0);
        assert!(loaded.fail_timestamp.is_some());

        // Counting starts over.
        tracker.record_failure().await.unwrap();
        assert!(!tracker.is_blocked().await);
    }

    #[tokio::test]
    async fn test_clear_removes_both_fields() {
        let (tracker, state, _) = tracker();
        tracker.record_failure().await.unwrap();
        tracker.clear().await.unwrap();
        let loaded = state.load().await.unwrap();
        assert_eq!(loaded.fail_count, 0);
        assert_eq!(loaded.fail_timestamp, None);
    }

    #[tokio::test]
    async fn test_failures_are_stamped_with_clock() {
        let (tracker, state, clock) = tracker();
        clock.set(42_000);
        tracker.record_failure().await.unwrap();
        assert_eq!(state.load().await.unwrap().fail_timestamp, Some(42_000));
    }
}
