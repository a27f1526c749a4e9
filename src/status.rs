//! User-visible status layer.
//!
//! The orchestrator reports loading, errors, offline mode and the info
//! overlay through [`StatusDisplay`]. The default implementation logs.

use crate::manifest::{ContentItem, ContentKind};
use std::fmt;

/// Where the item on screen is being played from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AvailabilityLabel {
    /// A complete local copy exists.
    Offline,
    /// A download is in progress, with the fraction done.
    Downloading(f32),
    Online,
    Unavailable,
}

impl AvailabilityLabel {
    /// Label for an item given the oracle's answers and current connectivity.
    pub fn for_item(item: &ContentItem, progress: Option<f32>, online: bool) -> Self {
        if item.offline.available {
            return AvailabilityLabel::Offline;
        }
        if let Some(progress) = progress.filter(|p| *p > 0.0 && *p < 1.0) {
            return AvailabilityLabel::Downloading(progress);
        }
        if online {
            AvailabilityLabel::Online
        } else {
            AvailabilityLabel::Unavailable
        }
    }
}

impl fmt::Display for AvailabilityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityLabel::Offline => f.write_str("Offline"),
            AvailabilityLabel::Downloading(p) => write!(f, "Downloading {}%", (p * 100.0) as u32),
            AvailabilityLabel::Online => f.write_str("Online"),
            AvailabilityLabel::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Transient information about the current item.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusOverlay {
    pub title: String,
    /// One-based position in the playlist.
    pub position: usize,
    pub total: usize,
    pub kind: ContentKind,
    pub display_seconds: Option<u32>,
    pub availability: AvailabilityLabel,
    pub paused: bool,
}

impl fmt::Display for StatusOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} / {}] {}", self.title, self.position, self.total, self.kind)?;
        if let Some(seconds) = self.display_seconds {
            write!(f, " ({}s)", seconds)?;
        }
        write!(f, " ({})", self.availability)?;
        if self.paused {
            f.write_str(" paused")?;
        }
        Ok(())
    }
}

pub trait StatusDisplay: Send {
    fn show_loading(&mut self, message: &str);
    fn hide_loading(&mut self);
    /// Playback halted; stays up until the next successful start.
    fn show_error(&mut self, message: &str);
    fn show_overlay(&mut self, overlay: &StatusOverlay);
    fn set_offline_indicator(&mut self, offline: bool);
}

/// Writes status changes to the log.
#[derive(Debug, Default)]
pub struct TracingStatusDisplay {
    offline: bool,
}

impl StatusDisplay for TracingStatusDisplay {
    fn show_loading(&mut self, message: &str) {
        tracing::info!("Loading: {}", message);
    }

    fn hide_loading(&mut self) {
        tracing::debug!("Loading finished");
    }

    fn show_error(&mut self, message: &str) {
        tracing::error!("Playback halted: {}", message);
    }

    fn show_overlay(&mut self, overlay: &StatusOverlay) {
        tracing::info!("{}", overlay);
    }

    fn set_offline_indicator(&mut self, offline: bool) {
        if offline != self.offline {
            if offline {
                tracing::warn!("Offline mode: playing cached content");
            } else {
                tracing::info!("Back online");
            }
        }
        self.offline = offline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_label_prefers_local_copy() {
        let mut item = ContentItem::new("a", "https://example.com/a.mp4", ContentKind::Video);
        assert_eq!(AvailabilityLabel::for_item(&item, None, true), AvailabilityLabel::Online);
        assert_eq!(AvailabilityLabel::for_item(&item, None, false), AvailabilityLabel::Unavailable);
        assert_eq!(
            AvailabilityLabel::for_item(&item, Some(0.5), true).to_string(),
            "Downloading 50%"
        );

        item.offline.available = true;
        assert_eq!(AvailabilityLabel::for_item(&item, Some(0.5), false), AvailabilityLabel::Offline);
    }

    #[test]
    fn overlay_text() {
        let overlay = StatusOverlay {
            title: "Menu".into(),
            position: 2,
            total: 5,
            kind: ContentKind::Document,
            display_seconds: Some(7),
            availability: AvailabilityLabel::Online,
            paused: false,
        };
        assert_eq!(overlay.to_string(), "Menu [2 / 5] html (7s) (Online)");
    }
}
