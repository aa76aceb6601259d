//! Background version check and precache.
//!
//! Runs once per session, some time after the page rendered, and only in a
//! top-level context. It never affects the current session: it only
//! prepares the next one by warming the remote origin and flipping the
//! "use remote" flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::manifest::ManifestSource;
use super::semver::Version;
use super::state::UpdateStateStore;
use crate::shell::frame::{FrameLauncher, FrameSpec};

pub const CHECK_DELAY: Duration = Duration::from_secs(3);
pub const PRECACHE_TIMEOUT: Duration = Duration::from_secs(15);
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Where the checker is in its per-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Idle,
    Checking,
    UpToDate,
    Precaching,
    Ready,
    Failed,
}

/// How a check ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Manifest or state unavailable; try again next session.
    Unavailable { reason: String },
    UpToDate { remote: Version },
    /// Remote version was warmed in an earlier session.
    AlreadyPrecached { version: Version },
    Ready { version: Version },
    Failed { version: Version, reason: String },
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "unavailable: {}", reason),
            Self::UpToDate { remote } => write!(f, "up to date (remote {})", remote),
            Self::AlreadyPrecached { version } => write!(f, "{} already precached", version),
            Self::Ready { version } => write!(f, "{} precached, will be used next time", version),
            Self::Failed { version, reason } => write!(f, "precache of {} failed: {}", version, reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub bundled_version: Version,
    pub remote_url: Url,
    pub check_delay: Duration,
    pub precache_timeout: Duration,
    pub teardown_grace: Duration,
}

impl CheckerSettings {
    pub fn new(bundled_version: Version, remote_url: Url) -> Self {
        Self {
            bundled_version,
            remote_url,
            check_delay: CHECK_DELAY,
            precache_timeout: PRECACHE_TIMEOUT,
            teardown_grace: TEARDOWN_GRACE,
        }
    }
}

pub struct VersionChecker {
    settings: CheckerSettings,
    manifest: Arc<dyn ManifestSource>,
    launcher: Arc<dyn FrameLauncher>,
    state: UpdateStateStore,
    phase: watch::Sender<CheckPhase>,
    scheduled: AtomicBool,
}

impl VersionChecker {
    pub fn new(
        settings: CheckerSettings,
        manifest: Arc<dyn ManifestSource>,
        launcher: Arc<dyn FrameLauncher>,
        state: UpdateStateStore,
    ) -> Self {
        let (phase, _) = watch::channel(CheckPhase::Idle);
        Self {
            settings,
            manifest,
            launcher,
            state,
            phase,
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> CheckPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<CheckPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, next: CheckPhase) {
        let prev = self.phase.send_replace(next);
        debug!(?prev, ?next, "Version checker transition");
    }

    /// Run the check after the configured delay, at most once per checker.
    ///
    /// Returns `None` in an embedded context, which never checks, and on
    /// every call after the first.
    pub fn schedule(self: Arc<Self>, embedded: bool) -> Option<JoinHandle<CheckOutcome>> {
        if embedded {
            debug!("Embedded context, skipping version check");
            return None;
        }
        if self.scheduled.swap(true, Ordering::SeqCst) {
            debug!("Version check already scheduled this session");
            return None;
        }
        let delay = self.settings.check_delay;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.check().await
        }))
    }

    /// Run one check now.
    pub async fn check(&self) -> CheckOutcome {
        self.enter(CheckPhase::Checking);

        let manifest = match self.manifest.fetch().await {
            Ok(manifest) => manifest,
            Err(e) => {
                info!("Version check skipped: {}", e);
                self.enter(CheckPhase::Idle);
                return CheckOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };
        let remote = Version::parse(&manifest.version);
        let bundled = self.settings.bundled_version;

        if remote <= bundled {
            info!(%remote, %bundled, "Bundled version is current");
            // Also covers a rollback of the remote origin.
            if let Err(e) = self.state.set_use_remote(false).await {
                warn!("Failed to clear remote flag: {}", e);
            }
            self.enter(CheckPhase::UpToDate);
            return CheckOutcome::UpToDate { remote };
        }

        self.enter(CheckPhase::Precaching);
        let state = match self.state.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read update state: {}", e);
                self.enter(CheckPhase::Idle);
                return CheckOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        if state.remote_version.as_deref().map(Version::parse) == Some(remote) {
            info!(%remote, "Remote version already precached");
            if let Err(e) = self.state.set_use_remote(true).await {
                warn!("Failed to set remote flag: {}", e);
            }
            self.enter(CheckPhase::Ready);
            return CheckOutcome::AlreadyPrecached { version: remote };
        }

        info!(%remote, %bundled, "Newer remote version, precaching");
        self.precache(remote, &manifest.version).await
    }

    async fn precache(&self, remote: Version, raw_version: &str) -> CheckOutcome {
        let spec = FrameSpec::precache(self.settings.remote_url.clone());
        let mut frame = match self.launcher.launch(spec).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to launch precache frame: {}", e);
                self.enter(CheckPhase::Failed);
                return CheckOutcome::Failed {
                    version: remote,
                    reason: e.to_string(),
                };
            }
        };

        let loaded = match tokio::time::timeout(self.settings.precache_timeout, frame.loaded()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no load within {}ms",
                self.settings.precache_timeout.as_millis()
            )),
        };

        match loaded {
            Ok(()) => {
                if let Err(e) = self.state.mark_ready(raw_version).await {
                    warn!("Failed to persist precached version: {}", e);
                }
                info!(%remote, "Precache complete");
                self.enter(CheckPhase::Ready);
                // Let in-flight background caching inside the frame settle.
                tokio::time::sleep(self.settings.teardown_grace).await;
                frame.teardown().await;
                CheckOutcome::Ready { version: remote }
            }
            Err(reason) => {
                warn!(%remote, "Precache failed: {}", reason);
                frame.teardown().await;
                self.enter(CheckPhase::Failed);
                CheckOutcome::Failed {
                    version: remote,
                    reason,
                }
            }
        }
    }
}
