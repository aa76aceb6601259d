//! Frame launcher for hosts without a browser engine.
//!
//! "Loading" the remote origin means pulling its entry document and every
//! same-origin subresource it references through the `AssetCache`, which
//! leaves the cache warm for the next session.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use fancy_regex::Regex;
use futures::future::join_all;
use tracing::{debug, info, warn};
use url::Url;

use super::cache::AssetCache;
use super::frame::{Frame, FrameLauncher, FrameSpec, Visibility};
use crate::bridge::channel::Endpoint;
use crate::common::error::{FrameError, FrameResult};

/// Matches `src="..."` and `href="..."` attribute values.
const ASSET_REF_PATTERN: &str = r#"(?:src|href)\s*=\s*["']([^"'#]+)["']"#;

static ASSET_REF_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(ASSET_REF_PATTERN).ok());

/// Same-origin asset URLs referenced by an HTML document.
pub fn asset_refs(base: &Url, html: &str) -> Vec<Url> {
    let Some(re) = ASSET_REF_RE.as_ref() else {
        return Vec::new();
    };
    let mut out: Vec<Url> = Vec::new();
    for caps in re.captures_iter(html) {
        let Ok(caps) = caps else { continue };
        let Some(raw) = caps.get(1) else { continue };
        let Ok(url) = base.join(raw.as_str()) else {
            continue;
        };
        if url.origin() == base.origin() && !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

pub struct HttpWarmingLauncher {
    cache: Arc<AssetCache>,
}

impl HttpWarmingLauncher {
    pub fn new(cache: Arc<AssetCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl FrameLauncher for HttpWarmingLauncher {
    async fn launch(&self, spec: FrameSpec) -> FrameResult<Box<dyn Frame>> {
        if spec.url.origin() != self.cache.origin().origin() {
            return Err(FrameError::LaunchFailed {
                url: spec.url.to_string(),
                message: "outside the cached origin".to_string(),
            });
        }
        debug!(url = %spec.url, hidden = spec.visibility == Visibility::Hidden, "Launching warming frame");
        Ok(Box::new(WarmingFrame {
            url: spec.url,
            cache: Arc::clone(&self.cache),
        }))
    }
}

struct WarmingFrame {
    url: Url,
    cache: Arc<AssetCache>,
}

#[async_trait]
impl Frame for WarmingFrame {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn loaded(&mut self) -> FrameResult<()> {
        let load_failed = |message: String| FrameError::LoadFailed {
            url: self.url.to_string(),
            message,
        };

        let document = self
            .cache
            .fetch(&self.url)
            .await
            .map_err(|e| load_failed(e.to_string()))?;
        if !document.is_success() {
            return Err(load_failed(format!("status {}", document.status)));
        }

        let html = String::from_utf8_lossy(&document.body);
        let refs = asset_refs(&self.url, &html);
        let results = join_all(refs.iter().map(|url| self.cache.fetch(url))).await;

        let mut warmed = 0;
        for (url, result) in refs.iter().zip(results) {
            match result {
                Ok(asset) if asset.is_success() => warmed += 1,
                Ok(asset) => warn!(url = %url, status = asset.status, "Subresource not cached"),
                Err(e) => warn!(url = %url, "Subresource fetch failed: {}", e),
            }
        }
        info!(url = %self.url, warmed, total = refs.len(), "Remote origin loaded");
        Ok(())
    }

    fn take_host_endpoint(&mut self) -> Option<Endpoint> {
        None
    }

    async fn teardown(self: Box<Self>) {
        debug!(url = %self.url, "Warming frame torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::cache::testing::FakeOrigin;

    fn base() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    #[test]
    fn test_asset_refs_keep_same_origin_only() {
        let html = r##"
            <link rel="stylesheet" href="/assets/app.css">
            <script src='assets/app.js'></script>
            <script src="https://cdn.other.net/lib.js"></script>
            <a href="#top">top</a>
            <img src="/assets/app.js">
        "##;
        let refs: Vec<String> = asset_refs(&base(), html)
            .into_iter()
            .map(|u| u.path().to_string())
            .collect();
        assert_eq!(refs, vec!["/assets/app.css", "/assets/app.js"]);
    }

    #[tokio::test]
    async fn test_loading_warms_document_and_assets() {
        let origin = Arc::new(FakeOrigin::default());
        origin.serve("/", 200, r#"<script src="/main.js"></script><link href="/missing.css">"#);
        origin.serve("/main.js", 200, "console.log(1)");
        let cache = Arc::new(AssetCache::new(base(), "/version.json", origin.clone()));

        let launcher = HttpWarmingLauncher::new(cache.clone());
        let mut frame = launcher.launch(FrameSpec::precache(base())).await.unwrap();
        frame.loaded().await.unwrap();
        frame.teardown().await;

        assert!(cache.cached(&base()).is_some());
        assert!(cache.cached(&base().join("/main.js").unwrap()).is_some());
        assert!(cache.cached(&base().join("/missing.css").unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_missing_document_is_a_load_error() {
        let origin = Arc::new(FakeOrigin::default());
        let cache = Arc::new(AssetCache::new(base(), "/version.json", origin));
        let launcher = HttpWarmingLauncher::new(cache);
        let mut frame = launcher.launch(FrameSpec::precache(base())).await.unwrap();
        assert!(matches!(frame.loaded().await, Err(FrameError::LoadFailed { .. })));
    }

    #[tokio::test]
    async fn test_foreign_origin_is_refused() {
        let origin = Arc::new(FakeOrigin::default());
        let cache = Arc::new(AssetCache::new(base(), "/version.json", origin));
        let launcher = HttpWarmingLauncher::new(cache);
        let spec = FrameSpec::precache(Url::parse("https://elsewhere.example.org/").unwrap());
        assert!(matches!(launcher.launch(spec).await, Err(FrameError::LaunchFailed { .. })));
    }
}
