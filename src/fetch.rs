//! Manifest transport and the stored copy used when offline.

use crate::error::FetchError;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Fetches the raw manifest over HTTP.
#[derive(Debug, Clone)]
pub struct ManifestFetcher {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl ManifestFetcher {
    pub fn new(client: reqwest::Client, url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let url = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch the current manifest bytes or fail within the timeout.
    pub async fn fetch(&self) -> Result<Bytes, FetchError> {
        tracing::debug!("Fetching manifest from {}", self.url);
        let response = self
            .client
            .get(self.url.clone())
            .timeout(self.timeout)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(FetchError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { status });
        }
        response.bytes().await.map_err(FetchError::Body)
    }
}

/// Last manifest that parsed successfully, kept on disk.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored manifest. Written to a temporary file first.
    pub async fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create manifest directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .context("Failed to write manifest")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("Failed to move manifest into place")?;
        Ok(())
    }

    /// The stored manifest, or `None` if nothing was ever saved.
    pub async fn load(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        }
    }
}
