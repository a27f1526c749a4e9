//! Still image surface.

use super::{fetch_bytes, Placement, Viewport, FETCH_TIMEOUT};
use crate::surface::{Surface, SurfaceSignal};
use anyhow::{Context, Result};
use image::RgbaImage;
use reqwest::header::HeaderMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use url::Url;

/// A decoded image ready to be drawn.
#[derive(Clone)]
pub struct DecodedFrame {
    pub pixels: Arc<RgbaImage>,
    pub placement: Placement,
}

/// Fetches and decodes images off the event loop.
pub struct DecodedImageSurface {
    name: String,
    client: reqwest::Client,
    viewport: Viewport,
    frame: Arc<Mutex<Option<DecodedFrame>>>,
    task: Option<JoinHandle<()>>,
    visible: bool,
}

impl DecodedImageSurface {
    pub fn new(name: impl Into<String>, client: reqwest::Client, viewport: Viewport) -> Self {
        Self {
            name: name.into(),
            client,
            viewport,
            frame: Arc::new(Mutex::new(None)),
            task: None,
            visible: false,
        }
    }

    /// The frame currently loaded, if any.
    pub fn frame(&self) -> Option<DecodedFrame> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    fn abort_pending(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn load_frame(client: &reqwest::Client, uri: &Url, viewport: Viewport) -> Result<DecodedFrame> {
    let data = fetch_bytes(client, uri, HeaderMap::new(), FETCH_TIMEOUT).await?;
    let pixels = tokio::task::spawn_blocking(move || {
        image::load_from_memory(&data)
            .map(|img| img.to_rgba8())
            .context("Failed to decode image")
    })
    .await
    .context("Image decoder panicked")??;

    let (width, height) = pixels.dimensions();
    Ok(DecodedFrame {
        placement: viewport.fit(width, height),
        pixels: Arc::new(pixels),
    })
}

impl Surface for DecodedImageSurface {
    fn prepare(&mut self, uri: &Url, signal: SurfaceSignal) {
        self.abort_pending();

        let client = self.client.clone();
        let viewport = self.viewport;
        let slot = self.frame.clone();
        let uri = uri.clone();
        let name = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            match load_frame(&client, &uri, viewport).await {
                Ok(frame) => {
                    tracing::debug!(
                        "{}: decoded {} ({}x{})",
                        name,
                        uri,
                        frame.pixels.width(),
                        frame.pixels.height()
                    );
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                    signal.ready();
                }
                Err(e) => {
                    tracing::warn!("{}: failed to load {}: {:#}", name, uri, e);
                    signal.failed(format!("{:#}", e));
                }
            }
        }));
    }

    fn show(&mut self) {
        if !self.visible {
            tracing::trace!("{}: show", self.name);
        }
        self.visible = true;
    }

    fn hide(&mut self) {
        self.visible = false;
    }

    fn clear(&mut self) {
        self.abort_pending();
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for DecodedImageSurface {
    fn drop(&mut self) {
        self.abort_pending();
    }
}
