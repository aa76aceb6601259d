//! Asset cache fronting the remote origin.
//!
//! The version manifest is always fetched from the network. Everything else
//! is served stale-while-revalidate: a cached copy is returned at once while
//! a background fetch refreshes it. A cache opened on a directory keeps its
//! entries there, so a precache survives into later sessions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::common::error::{StorageError, StorageResult, UpdateError};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    NetworkOnly,
    StaleWhileRevalidate,
}

impl CachePolicy {
    pub fn for_path(path: &str, manifest_path: &str) -> Self {
        if path == manifest_path {
            CachePolicy::NetworkOnly
        } else {
            CachePolicy::StaleWhileRevalidate
        }
    }
}

/// A fetched response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Asset {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Asset, UpdateError>;
}

/// Fetches assets with reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Asset, UpdateError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(Asset {
            status,
            content_type,
            body,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    next_id: u64,
    entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    status: u16,
    content_type: Option<String>,
    /// Body file name inside the cache directory.
    file: String,
}

/// On-disk copy of the cache: one body file per entry plus a JSON index.
struct DiskCache {
    dir: PathBuf,
    index: tokio::sync::Mutex<CacheIndex>,
}

impl DiskCache {
    fn io_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Open `dir`, returning the cache and every entry whose body is readable.
    async fn open(dir: PathBuf) -> StorageResult<(Self, HashMap<String, Asset>)> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::io_error(&dir, e))?;

        let index_path = dir.join(INDEX_FILE);
        let mut index = match tokio::fs::read(&index_path).await {
            Ok(raw) => serde_json::from_slice::<CacheIndex>(&raw).unwrap_or_else(|e| {
                warn!(path = %index_path.display(), "Cache index is corrupt, starting empty: {}", e);
                CacheIndex::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
            Err(e) => return Err(Self::io_error(&index_path, e)),
        };

        let mut loaded = HashMap::new();
        let mut missing = Vec::new();
        for (key, entry) in &index.entries {
            match tokio::fs::read(dir.join(&entry.file)).await {
                Ok(body) => {
                    loaded.insert(
                        key.clone(),
                        Asset {
                            status: entry.status,
                            content_type: entry.content_type.clone(),
                            body: Bytes::from(body),
                        },
                    );
                }
                Err(e) => {
                    warn!(key = %key, "Dropping cache entry with unreadable body: {}", e);
                    missing.push(key.clone());
                }
            }
        }
        for key in missing {
            index.entries.remove(&key);
        }

        info!(dir = %dir.display(), entries = loaded.len(), "Asset cache opened");
        let disk = Self {
            dir,
            index: tokio::sync::Mutex::new(index),
        };
        Ok((disk, loaded))
    }

    async fn write_atomic(&self, name: &str, body: &[u8]) -> StorageResult<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))
    }

    async fn store(&self, key: &str, asset: &Asset) -> StorageResult<()> {
        let mut index = self.index.lock().await;
        let existing = index.entries.get(key).map(|e| e.file.clone());
        let file = match existing {
            Some(file) => file,
            None => {
                index.next_id += 1;
                format!("{}.body", index.next_id)
            }
        };
        self.write_atomic(&file, &asset.body).await?;
        index.entries.insert(
            key.to_string(),
            IndexEntry {
                status: asset.status,
                content_type: asset.content_type.clone(),
                file,
            },
        );
        let raw = serde_json::to_vec_pretty(&*index)?;
        self.write_atomic(INDEX_FILE, &raw).await
    }
}

/// Stale-while-revalidate cache for one origin.
pub struct AssetCache {
    origin: Url,
    manifest_path: String,
    fetcher: Arc<dyn AssetFetcher>,
    entries: Arc<Mutex<HashMap<String, Asset>>>,
    disk: Option<Arc<DiskCache>>,
}

impl AssetCache {
    /// In-memory cache, gone when dropped.
    pub fn new(origin: Url, manifest_path: impl Into<String>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            origin,
            manifest_path: manifest_path.into(),
            fetcher,
            entries: Arc::new(Mutex::new(HashMap::new())),
            disk: None,
        }
    }

    /// Cache kept in `dir`, starting with whatever an earlier session stored there.
    pub async fn open(
        origin: Url,
        manifest_path: impl Into<String>,
        fetcher: Arc<dyn AssetFetcher>,
        dir: impl Into<PathBuf>,
    ) -> StorageResult<Self> {
        let (disk, loaded) = DiskCache::open(dir.into()).await?;
        Ok(Self {
            origin,
            manifest_path: manifest_path.into(),
            fetcher,
            entries: Arc::new(Mutex::new(loaded)),
            disk: Some(Arc::new(disk)),
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve a path or absolute URL against the origin.
    pub fn resolve(&self, reference: &str) -> Result<Url, UpdateError> {
        Ok(self.origin.join(reference)?)
    }

    fn cache_key(url: &Url) -> String {
        match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        }
    }

    pub fn cached(&self, url: &Url) -> Option<Asset> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&Self::cache_key(url)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch `url` according to its cache policy.
    pub async fn fetch(&self, url: &Url) -> Result<Asset, UpdateError> {
        match CachePolicy::for_path(url.path(), &self.manifest_path) {
            CachePolicy::NetworkOnly => self.fetcher.fetch(url).await,
            CachePolicy::StaleWhileRevalidate => {
                if let Some(hit) = self.cached(url) {
                    debug!(url = %url, "Cache hit, revalidating in background");
                    self.revalidate(url.clone());
                    return Ok(hit);
                }
                let asset = self.fetcher.fetch(url).await?;
                store_if_success(&self.entries, self.disk.as_deref(), url, &asset).await;
                Ok(asset)
            }
        }
    }

    fn revalidate(&self, url: Url) {
        let fetcher = Arc::clone(&self.fetcher);
        let entries = Arc::clone(&self.entries);
        let disk = self.disk.clone();
        tokio::spawn(async move {
            match fetcher.fetch(&url).await {
                Ok(asset) => store_if_success(&entries, disk.as_deref(), &url, &asset).await,
                Err(e) => debug!(url = %url, "Background revalidation failed: {}", e),
            }
        });
    }
}

async fn store_if_success(
    entries: &Mutex<HashMap<String, Asset>>,
    disk: Option<&DiskCache>,
    url: &Url,
    asset: &Asset,
) {
    if !asset.is_success() {
        warn!(url = %url, status = asset.status, "Not caching unsuccessful response");
        return;
    }
    let key = AssetCache::cache_key(url);
    entries
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key.clone(), asset.clone());
    if let Some(disk) = disk {
        if let Err(e) = disk.store(&key, asset).await {
            warn!(url = %url, "Failed to persist cache entry: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeOrigin;
    use super::*;

    fn cache(origin: Arc<FakeOrigin>) -> AssetCache {
        AssetCache::new(
            Url::parse("https://app.example.com/").unwrap(),
            "/version.json",
            origin,
        )
    }

    #[test]
    fn test_policy_for_paths() {
        assert_eq!(
            CachePolicy::for_path("/version.json", "/version.json"),
            CachePolicy::NetworkOnly
        );
        assert_eq!(
            CachePolicy::for_path("/app.js", "/version.json"),
            CachePolicy::StaleWhileRevalidate
        );
    }

    #[tokio::test]
    async fn test_manifest_is_never_cached() {
        let origin = Arc::new(FakeOrigin::default());
        origin.serve("/version.json", 200, r#"{"version":"1.0.0"}"#);
        let cache = cache(origin.clone());
        let url = cache.resolve("/version.json").unwrap();

        cache.fetch(&url).await.unwrap();
        cache.fetch(&url).await.unwrap();
        assert_eq!(origin.request_count("/version.json"), 2);
        assert!(cache.cached(&url).is_none());
    }

    #[tokio::test]
    async fn test_hit_returns_stale_and_refreshes_in_background() {
        let origin = Arc::new(FakeOrigin::default());
        origin.serve("/app.js", 200, "v1");
        let cache = cache(origin.clone());
        let url = cache.resolve("app.js").unwrap();

        assert_eq!(cache.fetch(&url).await.unwrap().body, Bytes::from("v1"));

        origin.serve("/app.js", 200, "v2");
        // Served from cache immediately, old content.
        assert_eq!(cache.fetch(&url).await.unwrap().body, Bytes::from("v1"));

        // The background refetch overwrites the entry.
        while origin.request_count("/app.js") < 2 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(cache.cached(&url).unwrap().body, Bytes::from("v2"));
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("tabshell-cache-{}", rand::random::<u64>()))
    }

    async fn open(origin: Arc<FakeOrigin>, dir: &Path) -> AssetCache {
        AssetCache::open(
            Url::parse("https://app.example.com/").unwrap(),
            "/version.json",
            origin,
            dir,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = temp_dir();
        let origin = Arc::new(FakeOrigin::default());
        origin.serve("/app.js", 200, "v1");
        origin.serve("/version.json", 200, r#"{"version":"1.0.0"}"#);

        let first = open(origin.clone(), &dir).await;
        let url = first.resolve("/app.js").unwrap();
        let manifest = first.resolve("/version.json").unwrap();
        first.fetch(&url).await.unwrap();
        first.fetch(&manifest).await.unwrap();
        drop(first);

        // A later session, with the origin unreachable.
        let offline = Arc::new(FakeOrigin::default());
        let second = open(offline.clone(), &dir).await;
        assert_eq!(second.len(), 1);
        assert!(second.cached(&manifest).is_none());
        let hit = second.fetch(&url).await.unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from("v1"));

        // The failed revalidation keeps the stored copy.
        while offline.request_count("/app.js") < 1 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        drop(second);
        let third = open(offline, &dir).await;
        assert_eq!(third.cached(&url).unwrap().body, Bytes::from("v1"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INDEX_FILE), "{not json").unwrap();

        let cache = open(Arc::new(FakeOrigin::default()), &dir).await;
        assert!(cache.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let origin = Arc::new(FakeOrigin::default());
        let cache = cache(origin.clone());
        let url = cache.resolve("/missing.css").unwrap();

        let asset = cache.fetch(&url).await.unwrap();
        assert_eq!(asset.status, 404);
        assert!(cache.is_empty());
    }
}
