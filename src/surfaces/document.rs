//! Web document surface.

use super::{fetch_bytes, FETCH_TIMEOUT};
use crate::surface::{Surface, SurfaceSignal};
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use url::Url;

/// Some signage pages refuse non-browser clients.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// A loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDocument {
    pub uri: Url,
    pub title: Option<String>,
    pub html: String,
}

/// Loads documents into memory; a page is ready once its body arrived.
pub struct FetchedDocumentSurface {
    name: String,
    client: reqwest::Client,
    document: Arc<Mutex<Option<LoadedDocument>>>,
    task: Option<JoinHandle<()>>,
    visible: bool,
}

impl FetchedDocumentSurface {
    pub fn new(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            client,
            document: Arc::new(Mutex::new(None)),
            task: None,
            visible: false,
        }
    }

    pub fn document(&self) -> Option<LoadedDocument> {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
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

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

/// Text of the first `<title>` element, if any.
fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = html[start..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}

impl Surface for FetchedDocumentSurface {
    fn prepare(&mut self, uri: &Url, signal: SurfaceSignal) {
        self.abort_pending();

        let client = self.client.clone();
        let slot = self.document.clone();
        let uri = uri.clone();
        let name = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            match fetch_bytes(&client, &uri, browser_headers(), FETCH_TIMEOUT).await {
                Ok(body) => {
                    let html = String::from_utf8_lossy(&body).into_owned();
                    let document = LoadedDocument {
                        title: extract_title(&html),
                        uri,
                        html,
                    };
                    tracing::debug!("{}: loaded {} ({:?})", name, document.uri, document.title);
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(document);
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
        self.visible = true;
    }

    fn hide(&mut self) {
        self.visible = false;
    }

    fn clear(&mut self) {
        self.abort_pending();
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for FetchedDocumentSurface {
    fn drop(&mut self) {
        self.abort_pending();
    }
}
