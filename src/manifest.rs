//! Playlist model and manifest decoding.
//!
//! The manifest is a bare JSON array; the only change signal is the
//! fingerprint of its raw bytes.

use crate::availability::ContentAvailability;
use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU32;
use url::Url;

/// Content category; decides which surface pool and timing rule apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    #[serde(rename = "html")]
    Document,
    Image,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [ContentKind::Video, ContentKind::Document, ContentKind::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Document => "html",
            ContentKind::Image => "image",
        }
    }

    /// Extension used for the locally stored copy.
    pub fn file_extension(&self) -> &'static str {
        match self {
            ContentKind::Video => "mp4",
            ContentKind::Document => "html",
            ContentKind::Image => "jpg",
        }
    }

    /// Whether the item is shown for a fixed time rather than until it ends.
    pub fn is_timed(&self) -> bool {
        !matches!(self, ContentKind::Video)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offline overlay, refreshed on every manifest load and before each play.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineStatus {
    pub available: bool,
    pub local_uri: Option<Url>,
}

/// One entry of the playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    /// Remote location; may be empty for items that only exist offline.
    pub source_uri: String,
    pub title: String,
    pub kind: ContentKind,
    /// Display time for documents and images. Ignored for video.
    pub display_seconds: Option<NonZeroU32>,
    pub offline: OfflineStatus,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, source_uri: impl Into<String>, kind: ContentKind) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            source_uri: source_uri.into(),
            kind,
            display_seconds: None,
            offline: OfflineStatus::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_display_seconds(mut self, seconds: u32) -> Self {
        self.display_seconds = NonZeroU32::new(seconds);
        self
    }

    /// Re-query the oracle for this item's local copy.
    pub fn refresh_offline(&mut self, availability: &dyn ContentAvailability) {
        let available = availability.is_available(&self.id);
        self.offline = OfflineStatus {
            available,
            local_uri: if available {
                availability.local_uri(&self.id, self.kind)
            } else {
                None
            },
        };
    }
}

/// Non-empty, ordered, circular sequence of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    items: Vec<ContentItem>,
}

impl Playlist {
    pub fn new(items: Vec<ContentItem>) -> Result<Self, ParseError> {
        if items.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut seen = HashSet::new();
        for (position, item) in items.iter().enumerate() {
            if item.id.is_empty() {
                return Err(ParseError::EmptyId { position });
            }
            if !seen.insert(item.id.as_str()) {
                return Err(ParseError::DuplicateId { id: item.id.clone() });
            }
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ContentItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ContentItem> {
        self.items.get_mut(index)
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ContentItem> {
        self.items.iter_mut()
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn wrap(&self, index: usize) -> usize {
        index % self.items.len()
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.items.len()
    }

    pub fn previous_index(&self, index: usize) -> usize {
        let len = self.items.len();
        (index % len + len - 1) % len
    }

    /// Rewrite relative item urls against the manifest's own location.
    /// Absolute and empty urls are left alone.
    pub fn resolve_urls(&mut self, base: &Url) {
        for item in self.items.iter_mut() {
            if item.source_uri.is_empty() {
                continue;
            }
            match Url::parse(&item.source_uri) {
                Ok(_) => {}
                Err(url::ParseError::RelativeUrlWithoutBase) => match base.join(&item.source_uri) {
                    Ok(url) => item.source_uri = url.into(),
                    Err(e) => tracing::warn!("Cannot resolve url of {}: {}", item.id, e),
                },
                Err(e) => tracing::warn!("Item {} has an invalid url: {}", item.id, e),
            }
        }
    }

    /// Keep only items with a local copy. Returns `None` if nothing is left.
    pub fn retain_available(mut self, availability: &dyn ContentAvailability) -> Option<Self> {
        for item in self.items.iter_mut() {
            item.refresh_offline(availability);
        }
        self.items.retain(|item| item.offline.available);
        if self.items.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// Wire representation of a manifest element.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<ContentKind>,
    #[serde(default)]
    time: Option<u32>,
}

/// Decode raw manifest bytes. Any structural problem rejects the whole document.
pub fn parse(bytes: &[u8]) -> Result<Playlist, ParseError> {
    let entries: Vec<ManifestEntry> = serde_json::from_slice(bytes)?;
    let mut items = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        let display_seconds = match entry.time {
            None => None,
            Some(seconds) => Some(
                NonZeroU32::new(seconds)
                    .ok_or_else(|| ParseError::InvalidDisplayTime { id: entry.id.clone() })?,
            ),
        };
        items.push(ContentItem {
            title: entry.title.unwrap_or_else(|| format!("Item {}", i + 1)),
            id: entry.id,
            source_uri: entry.url,
            kind: entry.kind.unwrap_or(ContentKind::Video),
            display_seconds,
            offline: OfflineStatus::default(),
        });
    }
    Playlist::new(items)
}

/// [`parse`], with relative item urls resolved against `base`.
pub fn parse_relative_to(bytes: &[u8], base: &Url) -> Result<Playlist, ParseError> {
    let mut playlist = parse(bytes)?;
    playlist.resolve_urls(base);
    Ok(playlist)
}

/// SHA-256 digest of the raw manifest bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
