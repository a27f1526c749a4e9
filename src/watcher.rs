//! Manifest loading and the periodic update check.
//!
//! The watcher runs as its own task. It never touches playback state; it
//! posts [`ManifestEvent`]s and the orchestrator decides what to do.

use crate::availability::ContentAvailability;
use crate::config::ManifestConfig;
use crate::events::{ManifestEvent, ManifestOrigin, PlayerEvent};
use crate::fetch::{ManifestFetcher, ManifestStore};
use crate::manifest::{self, Fingerprint};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Result of one update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Same bytes as the playlist in use.
    Unchanged,
    /// A new playlist was handed to the orchestrator.
    Replaced,
    /// The server could not be reached; the next cycle retries.
    FetchFailed,
    /// The new manifest did not parse; the previous playlist stays.
    Rejected,
}

pub struct ManifestWatcher {
    fetcher: ManifestFetcher,
    store: ManifestStore,
    availability: Arc<dyn ContentAvailability>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    interval: Duration,
    force_offline: bool,
    fingerprint: Option<Fingerprint>,
    online: Option<bool>,
}

impl ManifestWatcher {
    pub fn new(
        fetcher: ManifestFetcher,
        store: ManifestStore,
        availability: Arc<dyn ContentAvailability>,
        events: mpsc::UnboundedSender<PlayerEvent>,
        config: &ManifestConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            availability,
            events,
            interval: config.refresh_interval(),
            force_offline: config.force_offline,
            fingerprint: None,
            online: None,
        }
    }

    /// Fingerprint of the remote manifest currently in use.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Load the first playlist: remote if possible, otherwise the stored
    /// manifest restricted to content available offline.
    pub async fn load_initial(&mut self) -> Option<ManifestOrigin> {
        if self.force_offline {
            tracing::info!("Offline mode forced, skipping manifest fetch");
        } else {
            match self.fetcher.fetch().await {
                Ok(bytes) => {
                    self.report_connectivity(true);
                    match manifest::parse_relative_to(&bytes, self.fetcher.url()) {
                        Ok(playlist) => {
                            tracing::info!("Loaded {} items from {}", playlist.len(), self.fetcher.url());
                            self.persist(&bytes).await;
                            self.fingerprint = Some(Fingerprint::of(&bytes));
                            self.send(ManifestEvent::Loaded {
                                playlist,
                                origin: ManifestOrigin::Remote,
                            });
                            return Some(ManifestOrigin::Remote);
                        }
                        Err(e) => {
                            tracing::warn!("Remote manifest rejected: {}, trying stored copy", e);
                        }
                    }
                }
                Err(e) => {
                    self.report_connectivity(false);
                    tracing::warn!("Failed to fetch manifest: {}, trying stored copy", e);
                }
            }
        }

        self.load_cached().await
    }

    async fn load_cached(&mut self) -> Option<ManifestOrigin> {
        let bytes = match self.store.load().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.send(ManifestEvent::Unavailable {
                    reason: "No playlist available".into(),
                });
                return None;
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                self.send(ManifestEvent::Unavailable {
                    reason: "Stored playlist could not be read".into(),
                });
                return None;
            }
        };

        let playlist = match manifest::parse_relative_to(&bytes, self.fetcher.url()) {
            Ok(playlist) => playlist,
            Err(e) => {
                tracing::error!("Stored manifest is invalid: {}", e);
                self.send(ManifestEvent::Unavailable {
                    reason: "Stored playlist is invalid".into(),
                });
                return None;
            }
        };

        let total = playlist.len();
        match playlist.retain_available(self.availability.as_ref()) {
            Some(playlist) => {
                tracing::info!("Playing {} of {} stored items offline", playlist.len(), total);
                self.send(ManifestEvent::Loaded {
                    playlist,
                    origin: ManifestOrigin::Cached,
                });
                Some(ManifestOrigin::Cached)
            }
            None => {
                self.send(ManifestEvent::Unavailable {
                    reason: "No offline content available".into(),
                });
                None
            }
        }
    }

    /// One update check.
    pub async fn refresh(&mut self) -> RefreshOutcome {
        let bytes = match self.fetcher.fetch().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_connectivity(false);
                tracing::warn!("Update check failed: {}", e);
                return RefreshOutcome::FetchFailed;
            }
        };
        self.report_connectivity(true);

        let fingerprint = Fingerprint::of(&bytes);
        if self.fingerprint == Some(fingerprint) {
            tracing::debug!("Manifest unchanged ({})", fingerprint);
            return RefreshOutcome::Unchanged;
        }

        match manifest::parse_relative_to(&bytes, self.fetcher.url()) {
            Ok(playlist) => {
                tracing::info!("Manifest changed ({}), {} items", fingerprint, playlist.len());
                self.persist(&bytes).await;
                self.fingerprint = Some(fingerprint);
                self.send(ManifestEvent::Loaded {
                    playlist,
                    origin: ManifestOrigin::Remote,
                });
                RefreshOutcome::Replaced
            }
            Err(e) => {
                tracing::warn!("Ignoring invalid manifest ({}): {}", fingerprint, e);
                RefreshOutcome::Rejected
            }
        }
    }

    /// Load the first playlist, then check for updates every interval while
    /// `foreground` is true. Returns when the player goes away.
    pub async fn run(mut self, mut foreground: watch::Receiver<bool>) {
        self.load_initial().await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.events.is_closed() {
                break;
            }
            if !*foreground.borrow_and_update() {
                tracing::debug!("Update checks suspended");
                if foreground.changed().await.is_err() {
                    break;
                }
                if *foreground.borrow() {
                    tracing::debug!("Update checks resumed");
                    ticker.reset();
                }
                continue;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                changed = foreground.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Manifest watcher stopped");
    }

    async fn persist(&self, bytes: &[u8]) {
        if let Err(e) = self.store.save(bytes).await {
            tracing::warn!("Failed to store manifest: {:#}", e);
        }
    }

    fn report_connectivity(&mut self, online: bool) {
        if self.online != Some(online) {
            self.online = Some(online);
            self.send(ManifestEvent::Connectivity { online });
        }
    }

    fn send(&self, event: ManifestEvent) {
        if self.events.send(PlayerEvent::Manifest(event)).is_err() {
            tracing::debug!("Player stopped, dropping manifest event");
        }
    }
}
