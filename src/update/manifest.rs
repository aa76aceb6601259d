//! Remote version manifest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use serde::Deserialize;
use url::Url;

use crate::common::error::UpdateError;

pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `{ "version": "<major>.<minor>.<patch>" }`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionManifest {
    pub version: String,
}

impl VersionManifest {
    pub fn parse(body: &[u8]) -> Result<Self, UpdateError> {
        let manifest: VersionManifest =
            serde_json::from_slice(body).map_err(|e| UpdateError::MalformedManifest {
                message: e.to_string(),
            })?;
        if manifest.version.trim().is_empty() {
            return Err(UpdateError::MalformedManifest {
                message: "empty version".to_string(),
            });
        }
        Ok(manifest)
    }
}

/// Where the remote version comes from.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self) -> Result<VersionManifest, UpdateError>;
}

/// Fetches the manifest over HTTP, bypassing caches.
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpManifestSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self) -> Result<VersionManifest, UpdateError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(CACHE_CONTROL, "no-cache, no-store")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpdateError::Timeout
                } else {
                    UpdateError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        VersionManifest::parse(&body)
    }
}
