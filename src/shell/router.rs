//! New-tab routing: bundled entry or remote origin.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use super::frame::{Frame, FrameLauncher, FrameSpec};
use crate::bridge::channel::BrowsingContext;
use crate::bridge::host::{HostHandle, StorageBridgeHost};
use crate::storage::store::KeyValueStore;
use crate::update::backoff::BackoffTracker;
use crate::update::state::UpdateStateStore;

pub const REMOTE_LOAD_TIMEOUT: Duration = Duration::from_millis(800);

/// Reports whether the browser is online.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

pub struct AssumeOnline;

impl Connectivity for AssumeOnline {
    fn is_online(&self) -> bool {
        true
    }
}

pub struct StaticConnectivity(pub bool);

impl Connectivity for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.0
    }
}

/// Why the bundled entry was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathReason {
    NoRemote,
    Offline,
    BackedOff,
    RemoteFailed,
}

impl fmt::Display for FastPathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoRemote => "no precached remote version",
            Self::Offline => "offline",
            Self::BackedOff => "remote origin backed off",
            Self::RemoteFailed => "remote origin failed to load",
        };
        f.write_str(s)
    }
}

/// A live remote frame plus the bridge host serving it.
pub struct RemoteSession {
    frame: Box<dyn Frame>,
    host: Option<HostHandle>,
}

impl RemoteSession {
    pub fn url(&self) -> &Url {
        self.frame.url()
    }

    pub fn is_bridged(&self) -> bool {
        self.host.as_ref().is_some_and(HostHandle::is_running)
    }

    /// Stop hosting and tear the frame down.
    pub async fn close(mut self) {
        if let Some(mut host) = self.host.take() {
            host.stop();
        }
        self.frame.teardown().await;
    }
}

pub enum ShellOutcome {
    Local { entry: String, reason: FastPathReason },
    Remote(RemoteSession),
}

impl ShellOutcome {
    pub fn is_remote(&self) -> bool {
        matches!(self, ShellOutcome::Remote(_))
    }
}

impl fmt::Display for ShellOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { entry, reason } => write!(f, "local {} ({})", entry, reason),
            Self::Remote(session) => write!(f, "remote {}", session.url()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub local_entry: String,
    pub remote_url: Url,
    pub remote_load_timeout: Duration,
    /// The shell's own context; parent of the remote frame.
    pub shell: BrowsingContext,
}

pub struct ShellRouter {
    settings: RouterSettings,
    state: UpdateStateStore,
    backoff: BackoffTracker,
    connectivity: Arc<dyn Connectivity>,
    launcher: Arc<dyn FrameLauncher>,
    host_store: Arc<dyn KeyValueStore>,
}

impl ShellRouter {
    pub fn new(
        settings: RouterSettings,
        state: UpdateStateStore,
        backoff: BackoffTracker,
        connectivity: Arc<dyn Connectivity>,
        launcher: Arc<dyn FrameLauncher>,
        host_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            settings,
            state,
            backoff,
            connectivity,
            launcher,
            host_store,
        }
    }

    fn local(&self, reason: FastPathReason) -> ShellOutcome {
        info!(entry = %self.settings.local_entry, %reason, "Serving bundled entry");
        ShellOutcome::Local {
            entry: self.settings.local_entry.clone(),
            reason,
        }
    }

    /// Decide where this tab goes.
    pub async fn open(&self) -> ShellOutcome {
        let use_remote = match self.state.load().await {
            Ok(state) => state.use_remote,
            Err(e) => {
                warn!("Failed to read update state: {}", e);
                false
            }
        };
        if !use_remote {
            return self.local(FastPathReason::NoRemote);
        }
        if !self.connectivity.is_online() {
            return self.local(FastPathReason::Offline);
        }
        if self.backoff.is_blocked().await {
            return self.local(FastPathReason::BackedOff);
        }

        match self.open_remote().await {
            Some(session) => {
                if let Err(e) = self.backoff.clear().await {
                    warn!("Failed to clear failure counters: {}", e);
                }
                info!(url = %session.url(), "Serving remote origin");
                ShellOutcome::Remote(session)
            }
            None => {
                match self.backoff.record_failure().await {
                    Ok(count) => debug!(failures = count, "Recorded remote failure"),
                    Err(e) => warn!("Failed to record remote failure: {}", e),
                }
                if let Err(e) = self.state.set_use_remote(false).await {
                    warn!("Failed to clear remote flag: {}", e);
                }
                self.local(FastPathReason::RemoteFailed)
            }
        }
    }

    async fn open_remote(&self) -> Option<RemoteSession> {
        let spec = FrameSpec::visible(self.settings.remote_url.clone(), self.settings.shell.clone());
        let expected_origin = spec.origin();
        let mut frame = match self.launcher.launch(spec).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to launch remote frame: {}", e);
                return None;
            }
        };

        let mut host = frame.take_host_endpoint().map(|endpoint| {
            StorageBridgeHost::new(Arc::clone(&self.host_store), expected_origin).spawn(endpoint)
        });

        let timeout = self.settings.remote_load_timeout;
        let failure = match tokio::time::timeout(timeout, frame.loaded()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no load within {}ms", timeout.as_millis())),
        };

        match failure {
            None => Some(RemoteSession { frame, host }),
            Some(reason) => {
                warn!(url = %frame.url(), "Remote frame failed: {}", reason);
                if let Some(host) = host.as_mut() {
                    host.stop();
                }
                frame.teardown().await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client::{StorageBridgeClient, HANDSHAKE_TIMEOUT};
    use crate::common::clock::ManualClock;
    use crate::shell::frame::testing::{LoadBehavior, ScriptedLauncher};
    use crate::shell::frame::Visibility;
    use crate::storage::store::{entry, keys, MemoryStore};
    use serde_json::json;

    struct Fixture {
        router: ShellRouter,
        state: UpdateStateStore,
        launcher: Arc<ScriptedLauncher>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn fixture(behavior: LoadBehavior, online: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let state = UpdateStateStore::new(store.clone());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let backoff = BackoffTracker::new(state.clone(), clock.clone());
        let launcher = Arc::new(ScriptedLauncher::new(behavior));
        let settings = RouterSettings {
            local_entry: "index.html".to_string(),
            remote_url: Url::parse("https://app.example.com/").unwrap(),
            remote_load_timeout: REMOTE_LOAD_TIMEOUT,
            shell: BrowsingContext::new("chrome-extension://tabshell"),
        };
        let router = ShellRouter::new(
            settings,
            state.clone(),
            backoff,
            Arc::new(StaticConnectivity(online)),
            launcher.clone(),
            store.clone(),
        );
        Fixture {
            router,
            state,
            launcher,
            clock,
            store,
        }
    }

    fn reason(outcome: &ShellOutcome) -> Option<FastPathReason> {
        match outcome {
            ShellOutcome::Local { reason, .. } => Some(*reason),
            ShellOutcome::Remote(_) => None,
        }
    }

    #[tokio::test]
    async fn test_no_remote_flag_takes_fast_path() {
        let fx = fixture(LoadBehavior::LoadAfter(Duration::ZERO), true);
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::NoRemote));
        assert_eq!(fx.launcher.launched(), 0);
    }

    #[tokio::test]
    async fn test_offline_takes_fast_path() {
        let fx = fixture(LoadBehavior::LoadAfter(Duration::ZERO), false);
        fx.state.set_use_remote(true).await.unwrap();
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::Offline));
        assert_eq!(fx.launcher.launched(), 0);
        // The flag survives an offline open.
        assert!(fx.state.load().await.unwrap().use_remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_load_clears_failures() {
        let fx = fixture(LoadBehavior::LoadAfter(Duration::from_millis(200)), true);
        fx.state.set_use_remote(true).await.unwrap();
        fx.state.write_failures(2, Some(999_000)).await.unwrap();

        let outcome = fx.router.open().await;
        assert!(outcome.is_remote());
        let loaded = fx.state.load().await.unwrap();
        assert!(loaded.use_remote);
        assert_eq!(loaded.fail_count, 0);

        let spec = fx.launcher.specs.lock().unwrap()[0].clone();
        assert_eq!(spec.visibility, Visibility::Visible);

        if let ShellOutcome::Remote(session) = outcome {
            assert!(session.is_bridged());
            session.close().await;
        }
        assert_eq!(fx.launcher.torn_down(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_falls_back_and_clears_flag() {
        let fx = fixture(LoadBehavior::LoadAfter(Duration::from_secs(2)), true);
        fx.state.set_use_remote(true).await.unwrap();

        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::RemoteFailed));
        let loaded = fx.state.load().await.unwrap();
        assert!(!loaded.use_remote);
        assert_eq!(loaded.fail_count, 1);
        assert_eq!(loaded.fail_timestamp, Some(1_000_000));
        assert_eq!(fx.launcher.torn_down(), 1);

        // Next open goes straight to the bundled entry.
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::NoRemote));
        assert_eq!(fx.launcher.launched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_error_counts_as_failure() {
        let fx = fixture(LoadBehavior::FailAfter(Duration::from_millis(50)), true);
        fx.state.set_use_remote(true).await.unwrap();
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::RemoteFailed));
        assert_eq!(fx.state.load().await.unwrap().fail_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failed_sessions_block_remote() {
        let fx = fixture(LoadBehavior::Never, true);

        for _ in 0..3 {
            fx.state.set_use_remote(true).await.unwrap();
            let outcome = fx.router.open().await;
            assert_eq!(reason(&outcome), Some(FastPathReason::RemoteFailed));
            fx.clock.advance(1_000);
        }
        assert_eq!(fx.launcher.launched(), 3);

        // Blocked regardless of the flag.
        fx.state.set_use_remote(true).await.unwrap();
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::BackedOff));
        assert_eq!(fx.launcher.launched(), 3);

        fx.clock.advance(4 * 60 * 1_000);
        let outcome = fx.router.open().await;
        assert_eq!(reason(&outcome), Some(FastPathReason::BackedOff));

        // Window elapsed: the remote origin is tried again.
        fx.clock.advance(60 * 1_000);
        fx.launcher.set_behavior(LoadBehavior::LoadAfter(Duration::from_millis(10)));
        let outcome = fx.router.open().await;
        assert!(outcome.is_remote());
        assert_eq!(fx.launcher.launched(), 4);
        assert_eq!(fx.state.load().await.unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_remote_frame_reaches_storage_through_bridge() {
        let fx = fixture(LoadBehavior::LoadAfter(Duration::ZERO), true);
        fx.state.set_use_remote(true).await.unwrap();
        fx.store.set(entry("theme", json!("dark"))).await.unwrap();

        let outcome = fx.router.open().await;
        assert!(outcome.is_remote());

        let frame_side = fx.launcher.frame_sides.lock().unwrap().pop().unwrap();
        let client = StorageBridgeClient::connect(frame_side, HANDSHAKE_TIMEOUT);
        client.wait_for_ready().await.unwrap();

        let data = client.get(keys(&["theme"])).await.unwrap();
        assert_eq!(data.get("theme"), Some(&json!("dark")));

        client.set(entry("clock", json!("24h"))).await.unwrap();
        assert_eq!(fx.store.snapshot().get("clock"), Some(&json!("24h")));

        if let ShellOutcome::Remote(session) = outcome {
            session.close().await;
        }
    }
}
