//! Background download queue backing the offline content store.

use crate::availability::ContentAvailability;
use crate::cache::ContentCache;
use crate::config::CacheConfig;
use crate::manifest::{ContentItem, ContentKind};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use url::Url;

/// A queued download.
#[derive(Debug, Clone)]
struct DownloadJob {
    id: String,
    kind: ContentKind,
    url: Url,
}

/// Downloads playlist items into the [`ContentCache`] and answers
/// availability queries from it.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<DownloadJob>,
}

struct Shared {
    cache: RwLock<ContentCache>,
    in_flight: Mutex<HashSet<String>>,
    progress: Mutex<HashMap<String, f32>>,
    client: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl DownloadManager {
    /// Start the download worker. Must be called inside a tokio runtime.
    pub fn spawn(cache: ContentCache, client: reqwest::Client, config: &CacheConfig) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            cache: RwLock::new(cache),
            in_flight: Mutex::new(HashSet::new()),
            progress: Mutex::new(HashMap::new()),
            client,
            attempts: config.download_attempts.max(1),
            retry_delay: config.retry_delay(),
            timeout: config.download_timeout(),
        });

        let parallel = config.max_parallel_downloads.max(1);
        tokio::spawn(run_queue(shared.clone(), rx, parallel));

        Self { shared, jobs }
    }

    /// Number of downloads queued or running.
    pub fn pending(&self) -> usize {
        self.shared.in_flight().len()
    }
}

impl ContentAvailability for DownloadManager {
    fn is_available(&self, id: &str) -> bool {
        self.shared.read_cache().contains(id)
    }

    fn local_uri(&self, id: &str, kind: ContentKind) -> Option<Url> {
        let path = {
            let cache = self.shared.read_cache();
            let path = cache.lookup(id)?;
            if path.extension().and_then(|e| e.to_str()) != Some(kind.file_extension()) {
                tracing::debug!("Cached copy of {} does not match kind {}", id, kind);
                return None;
            }
            path.to_path_buf()
        };
        self.shared.write_cache().touch(id);
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        Url::from_file_path(&path).ok()
    }

    fn request_background_fetch(&self, item: &ContentItem) {
        if item.source_uri.is_empty() || self.is_available(&item.id) {
            return;
        }
        let url = match Url::parse(&item.source_uri) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Not downloading {}: invalid url {:?}: {}", item.id, item.source_uri, e);
                return;
            }
        };
        if !self.shared.in_flight().insert(item.id.clone()) {
            return;
        }

        tracing::debug!("Queueing download for {} ({})", item.id, item.kind);
        let job = DownloadJob {
            id: item.id.clone(),
            kind: item.kind,
            url,
        };
        if self.jobs.send(job).is_err() {
            tracing::warn!("Download queue stopped, dropping request for {}", item.id);
            self.shared.in_flight().remove(&item.id);
        }
    }

    fn download_progress(&self, id: &str) -> Option<f32> {
        self.shared.progress().get(id).copied()
    }
}

async fn run_queue(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<DownloadJob>, parallel: usize) {
    let permits = Arc::new(Semaphore::new(parallel));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            let _permit = permit;
            shared.download_with_retry(&job).await;
            shared.in_flight().remove(&job.id);
            shared.progress().remove(&job.id);
        });
    }
    tracing::debug!("Download queue closed");
}

impl Shared {
    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, ContentCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, ContentCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, HashMap<String, f32>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn download_with_retry(&self, job: &DownloadJob) {
        for attempt in 1..=self.attempts {
            match self.download(job).await {
                Ok(path) => {
                    tracing::info!("Downloaded {} to {:?}", job.id, path);
                    return;
                }
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(
                        "Download of {} failed (attempt {}/{}): {:#}, retrying in {:?}",
                        job.id,
                        attempt,
                        self.attempts,
                        e,
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!("Giving up on download of {}: {:#}", job.id, e);
                }
            }
        }
    }

    async fn download(&self, job: &DownloadJob) -> Result<PathBuf> {
        let (partial, target) = {
            let cache = self.read_cache();
            (
                cache.partial_path_for(&job.id, job.kind),
                cache.path_for(&job.id, job.kind),
            )
        };

        tracing::debug!("Downloading {} to {:?}", job.url, target);

        let response = self
            .client
            .get(job.url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?;
        let total = response.content_length().filter(|len| *len > 0);

        let mut file = tokio::fs::File::create(&partial)
            .await
            .context("Failed to create download file")?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read response")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write download file")?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                self.progress()
                    .insert(job.id.clone(), (written as f32 / total as f32).min(1.0));
            }
        }
        file.flush().await.context("Failed to flush download file")?;
        drop(file);

        tokio::fs::rename(&partial, &target)
            .await
            .context("Failed to move download into place")?;
        self.write_cache().insert(&job.id, target.clone(), written);

        Ok(target)
    }
}
