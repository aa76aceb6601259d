//! Browsing frames the shell can open.
//!
//! This is the one piece tied to a browser host: something that can load a
//! remote origin in an isolated context, report when it finished loading,
//! and be torn down.

use async_trait::async_trait;
use url::Url;

use crate::bridge::channel::{BrowsingContext, Endpoint};
use crate::common::error::FrameResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Fills the tab.
    Visible,
    /// Off-screen and zero-size.
    Hidden,
}

/// How to open a frame.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub url: Url,
    pub visibility: Visibility,
    /// Sandbox tokens granted to the frame.
    pub sandbox: Vec<&'static str>,
    /// Excluded from focus and input.
    pub inert: bool,
    /// Context embedding the frame, when it should be able to reach us.
    pub parent: Option<BrowsingContext>,
}

impl FrameSpec {
    /// Frame the user sees, able to talk to `parent` through the bridge.
    pub fn visible(url: Url, parent: BrowsingContext) -> Self {
        Self {
            url,
            visibility: Visibility::Visible,
            sandbox: vec!["allow-scripts", "allow-same-origin", "allow-forms", "allow-popups"],
            inert: false,
            parent: Some(parent),
        }
    }

    /// Invisible frame used only to warm the remote origin's caches.
    pub fn precache(url: Url) -> Self {
        Self {
            url,
            visibility: Visibility::Hidden,
            sandbox: vec!["allow-scripts", "allow-same-origin"],
            inert: true,
            parent: None,
        }
    }

    /// Origin of the frame's document, as seen in posted messages.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

/// A launched frame.
#[async_trait]
pub trait Frame: Send {
    fn url(&self) -> &Url;

    /// Resolves when the frame signals load completion, or fails on a load error.
    async fn loaded(&mut self) -> FrameResult<()>;

    /// Parent-side bridge endpoint, if the frame's document can message us.
    fn take_host_endpoint(&mut self) -> Option<Endpoint>;

    async fn teardown(self: Box<Self>);
}

#[async_trait]
pub trait FrameLauncher: Send + Sync {
    async fn launch(&self, spec: FrameSpec) -> FrameResult<Box<dyn Frame>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted frames for router and checker tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::bridge::channel::link;
    use crate::common::error::FrameError;

    /// What a scripted frame does when asked whether it loaded.
    #[derive(Debug, Clone, Copy)]
    pub enum LoadBehavior {
        LoadAfter(Duration),
        FailAfter(Duration),
        Never,
    }

    #[derive(Default)]
    pub struct Counters {
        pub launched: AtomicUsize,
        pub torn_down: AtomicUsize,
    }

    pub struct ScriptedLauncher {
        pub behavior: Mutex<LoadBehavior>,
        pub counters: Arc<Counters>,
        pub specs: Mutex<Vec<FrameSpec>>,
        /// Frame-side endpoints handed out, for tests to act as the frame.
        pub frame_sides: Mutex<Vec<Endpoint>>,
    }

    impl ScriptedLauncher {
        pub fn new(behavior: LoadBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                counters: Arc::new(Counters::default()),
                specs: Mutex::new(Vec::new()),
                frame_sides: Mutex::new(Vec::new()),
            }
        }

        pub fn set_behavior(&self, behavior: LoadBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn launched(&self) -> usize {
            self.counters.launched.load(Ordering::SeqCst)
        }

        pub fn torn_down(&self) -> usize {
            self.counters.torn_down.load(Ordering::SeqCst)
        }
    }

    struct ScriptedFrame {
        url: Url,
        behavior: LoadBehavior,
        host_side: Option<Endpoint>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Frame for ScriptedFrame {
        fn url(&self) -> &Url {
            &self.url
        }

        async fn loaded(&mut self) -> FrameResult<()> {
            match self.behavior {
                LoadBehavior::LoadAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                LoadBehavior::FailAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(FrameError::LoadFailed {
                        url: self.url.to_string(),
                        message: "scripted failure".to_string(),
                    })
                }
                LoadBehavior::Never => std::future::pending().await,
            }
        }

        fn take_host_endpoint(&mut self) -> Option<Endpoint> {
            self.host_side.take()
        }

        async fn teardown(self: Box<Self>) {
            self.counters.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FrameLauncher for ScriptedLauncher {
        async fn launch(&self, spec: FrameSpec) -> FrameResult<Box<dyn Frame>> {
            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            let host_side = spec.parent.clone().map(|parent| {
                let (host_side, frame_side) = link(parent, BrowsingContext::new(spec.origin()));
                self.frame_sides.lock().unwrap().push(frame_side);
                host_side
            });
            let frame = ScriptedFrame {
                url: spec.url.clone(),
                behavior: *self.behavior.lock().unwrap(),
                host_side,
                counters: Arc::clone(&self.counters),
            };
            self.specs.lock().unwrap().push(spec);
            Ok(Box::new(frame))
        }
    }
}
