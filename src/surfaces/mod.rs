//! Concrete rendering surfaces.
//!
//! These are headless: they load and hold content in memory and track
//! visibility, leaving the actual drawing to whatever window system embeds
//! the player.

pub mod document;
pub mod image;
pub mod video;

pub use self::document::FetchedDocumentSurface;
pub use self::image::DecodedImageSurface;
#[cfg(feature = "gstreamer")]
pub use self::video::GstVideoSurface;
pub use self::video::UnsupportedVideoSurface;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use std::time::Duration;
use url::Url;

/// Limit on a whole document or image transfer.
pub(crate) const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Output area content is fitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Where a frame lands inside the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Largest centered rectangle with the content's aspect ratio.
    pub fn fit(&self, width: u32, height: u32) -> Placement {
        if width == 0 || height == 0 {
            return Placement {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
            };
        }
        let screen_ratio = self.width as f32 / self.height as f32;
        let ratio = width as f32 / height as f32;

        let (fit_width, fit_height) = if ratio > screen_ratio {
            (self.width, (self.width as f32 / ratio) as u32)
        } else {
            ((self.height as f32 * ratio) as u32, self.height)
        };

        Placement {
            x: (self.width - fit_width.min(self.width)) / 2,
            y: (self.height - fit_height.min(self.height)) / 2,
            width: fit_width,
            height: fit_height,
        }
    }
}

/// Read content from a `file://` path or an http(s) URL.
pub(crate) async fn fetch_bytes(
    client: &reqwest::Client,
    uri: &Url,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<Bytes> {
    match uri.scheme() {
        "file" => {
            let path = uri
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("Invalid file url {}", uri))?;
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            Ok(Bytes::from(data))
        }
        "http" | "https" => {
            let response = client
                .get(uri.clone())
                .headers(headers)
                .timeout(timeout)
                .send()
                .await
                .context("Failed to send request")?
                .error_for_status()
                .context("Server returned error")?;
            response.bytes().await.context("Failed to read response")
        }
        other => bail!("Unsupported url scheme {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_letterboxes_wide_content() {
        let viewport = Viewport {
            width: 1920,
            height: 1080,
        };
        let placement = viewport.fit(4000, 1000);
        assert_eq!(placement.width, 1920);
        assert_eq!(placement.height, 480);
        assert_eq!(placement.x, 0);
        assert_eq!(placement.y, 300);
    }

    #[test]
    fn fit_pillarboxes_tall_content() {
        let viewport = Viewport::default();
        let placement = viewport.fit(1000, 2000);
        assert_eq!(placement.height, 1080);
        assert_eq!(placement.width, 540);
        assert_eq!(placement.x, 690);
        assert_eq!(placement.y, 0);
    }

    #[tokio::test]
    async fn reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<h1>hi</h1>").unwrap();
        let uri = Url::from_file_path(&path).unwrap();

        let client = reqwest::Client::new();
        let bytes = fetch_bytes(&client, &uri, HeaderMap::new(), FETCH_TIMEOUT).await.unwrap();
        assert_eq!(&bytes[..], b"<h1>hi</h1>");

        let missing = Url::from_file_path(dir.path().join("missing.html")).unwrap();
        assert!(fetch_bytes(&client, &missing, HeaderMap::new(), FETCH_TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn stalled_server_times_out() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/slow.jpg", server.uri())).unwrap();
        let started = std::time::Instant::now();
        let result = fetch_bytes(
            &reqwest::Client::new(),
            &uri,
            HeaderMap::new(),
            Duration::from_millis(300),
        )
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
