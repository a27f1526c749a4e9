use anyhow::{bail, Context, Result};
use signage_player::cache::ContentCache;
use signage_player::downloads::DownloadManager;
use signage_player::events::InputEvent;
use signage_player::manifest::ContentKind;
use signage_player::status::TracingStatusDisplay;
use signage_player::surface::{SurfacePool, SurfaceSet};
use signage_player::surfaces::{DecodedImageSurface, FetchedDocumentSurface, Viewport};
use signage_player::{Player, PlayerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PlayerConfig::load(config_path()?.as_deref())?;
    tracing::info!("Manifest: {}", config.manifest.url);
    tracing::info!("Cache: {:?} ({} MB)", config.cache.dir, config.cache.max_size_mb);

    let client = reqwest::Client::builder()
        .connect_timeout(config.manifest.fetch_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let cache = ContentCache::open(config.cache.content_dir(), config.cache.max_size_mb)?;
    let downloads = DownloadManager::spawn(cache, client.clone(), &config.cache);
    let surfaces = build_surfaces(&client)?;

    let player = Player::new(
        config,
        client,
        surfaces,
        Arc::new(downloads),
        Box::new(TracingStatusDisplay::default()),
    );
    let handle = player.start()?;

    tracing::info!("Keys: n/right next, p/left previous, space/enter select, i info, b background, q quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut foreground = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let key = line.trim().to_lowercase();
                    match key.as_str() {
                        "q" | "quit" => break,
                        "b" | "background" => {
                            foreground = !foreground;
                            handle.set_foreground(foreground);
                        }
                        _ => match InputEvent::from_key(&key) {
                            Some(input) => handle.send_input(input),
                            None => tracing::debug!("Unknown key {:?}", key),
                        },
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read input: {}", e);
                    stdin_open = false;
                }
            },
        }

        if !handle.is_alive() {
            bail!("Player stopped unexpectedly");
        }
    }

    handle.stop().await
}

/// `--config <path>`, or the `SIGNAGE_CONFIG` environment variable.
fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args_os().skip(1);
    match args.next() {
        None => Ok(std::env::var_os("SIGNAGE_CONFIG").map(PathBuf::from)),
        Some(flag) if flag == "--config" => {
            let path = args.next().context("--config requires a path")?;
            Ok(Some(PathBuf::from(path)))
        }
        Some(other) => bail!("Unexpected argument {:?}", other),
    }
}

fn build_surfaces(client: &reqwest::Client) -> Result<SurfaceSet> {
    let viewport = Viewport::default();
    let image = SurfacePool::new(
        ContentKind::Image,
        Box::new(DecodedImageSurface::new("image-0", client.clone(), viewport)),
        Box::new(DecodedImageSurface::new("image-1", client.clone(), viewport)),
    );
    let document = SurfacePool::new(
        ContentKind::Document,
        Box::new(FetchedDocumentSurface::new("document-0", client.clone())),
        Box::new(FetchedDocumentSurface::new("document-1", client.clone())),
    );
    Ok(SurfaceSet::new(video_pool()?, document, image))
}

#[cfg(feature = "gstreamer")]
fn video_pool() -> Result<SurfacePool> {
    use signage_player::surfaces::GstVideoSurface;

    Ok(SurfacePool::new(
        ContentKind::Video,
        Box::new(GstVideoSurface::new("video-0")?),
        Box::new(GstVideoSurface::new("video-1")?),
    ))
}

#[cfg(not(feature = "gstreamer"))]
fn video_pool() -> Result<SurfacePool> {
    use signage_player::surfaces::UnsupportedVideoSurface;

    tracing::warn!("Built without the gstreamer feature, video items will be skipped");
    Ok(SurfacePool::new(
        ContentKind::Video,
        Box::new(UnsupportedVideoSurface),
        Box::new(UnsupportedVideoSurface),
    ))
}
