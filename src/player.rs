//! Wiring of the orchestrator and the manifest watcher into running tasks.

use crate::availability::ContentAvailability;
use crate::config::PlayerConfig;
use crate::events::{InputEvent, Lifecycle, PlayerEvent};
use crate::fetch::{ManifestFetcher, ManifestStore};
use crate::orchestrator::Orchestrator;
use crate::status::StatusDisplay;
use crate::surface::SurfaceSet;
use crate::watcher::ManifestWatcher;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Everything the player needs from the outside world.
pub struct Player {
    config: PlayerConfig,
    client: reqwest::Client,
    surfaces: SurfaceSet,
    availability: Arc<dyn ContentAvailability>,
    status: Box<dyn StatusDisplay>,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        client: reqwest::Client,
        surfaces: SurfaceSet,
        availability: Arc<dyn ContentAvailability>,
        status: Box<dyn StatusDisplay>,
    ) -> Self {
        Self {
            config,
            client,
            surfaces,
            availability,
            status,
        }
    }

    /// Spawn the orchestrator and the watcher. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<PlayerHandle> {
        let fetcher = ManifestFetcher::new(
            self.client,
            &self.config.manifest.url,
            self.config.manifest.fetch_timeout(),
        )
        .context("Invalid manifest configuration")?;
        let store = ManifestStore::new(self.config.cache.manifest_path());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (foreground_tx, foreground_rx) = watch::channel(true);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let watcher = ManifestWatcher::new(
            fetcher,
            store,
            self.availability.clone(),
            events_tx.clone(),
            &self.config.manifest,
        );

        let mut orchestrator = Orchestrator::new(
            self.config.playback.clone(),
            self.surfaces,
            self.availability,
            self.status,
            events_tx.clone(),
        );

        let orchestrator = tokio::spawn(async move {
            orchestrator.start();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        tracing::info!("Player shutdown requested");
                        break;
                    }
                    event = events_rx.recv() => match event {
                        Some(event) => orchestrator.handle(event),
                        None => break,
                    },
                }
            }
        });
        let watcher = tokio::spawn(watcher.run(foreground_rx));

        tracing::info!("Player started, manifest at {}", self.config.manifest.url);
        Ok(PlayerHandle {
            events: events_tx,
            foreground: foreground_tx,
            orchestrator,
            watcher,
            shutdown_tx,
        })
    }
}

/// Control surface of a running player.
pub struct PlayerHandle {
    events: mpsc::UnboundedSender<PlayerEvent>,
    foreground: watch::Sender<bool>,
    orchestrator: JoinHandle<()>,
    watcher: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl PlayerHandle {
    pub fn send_input(&self, input: InputEvent) {
        if self.events.send(PlayerEvent::Input(input)).is_err() {
            tracing::debug!("Player stopped, dropping input {:?}", input);
        }
    }

    /// Pause video and update checks while in the background.
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.send_replace(foreground);
        let lifecycle = if foreground {
            Lifecycle::Foreground
        } else {
            Lifecycle::Background
        };
        if self.events.send(PlayerEvent::Lifecycle(lifecycle)).is_err() {
            tracing::debug!("Player stopped, dropping lifecycle {:?}", lifecycle);
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.orchestrator.is_finished()
    }

    /// Stop both tasks and wait for playback to wind down.
    pub async fn stop(self) -> Result<()> {
        self.watcher.abort();
        let _ = self.shutdown_tx.send(());
        self.orchestrator
            .await
            .context("Player task failed")?;
        tracing::info!("Player stopped");
        Ok(())
    }
}
