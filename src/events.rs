//! Messages delivered to the orchestrator's single event queue.
//!
//! Renderer callbacks, timers, the manifest watcher and user input all post
//! here; only the orchestrator task mutates playback state.

use crate::manifest::{ContentKind, Playlist};
use crate::surface::Slot;

#[derive(Debug)]
pub enum PlayerEvent {
    Surface(SurfaceEvent),
    Timer(TimerEvent),
    Input(InputEvent),
    Lifecycle(Lifecycle),
    Manifest(ManifestEvent),
}

/// Outcome reported by a rendering surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    pub kind: ContentKind,
    pub slot: Slot,
    pub token: u64,
    pub signal: SurfaceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceOutcome {
    Ready,
    Failed(String),
    /// Natural end of a video stream.
    Ended,
}

/// A timer armed for a given playback generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub generation: u64,
    pub purpose: TimerPurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    /// Display time elapsed, or error backoff done: move to the next item.
    Advance,
    /// Force-clear a transition that never completed.
    TransitionDeadline,
    /// The active surface never reported ready or failed.
    PrepareDeadline,
}

/// Discrete user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Next,
    Previous,
    /// Toggle pause for video, otherwise just show the status overlay.
    Select,
    Info,
}

impl InputEvent {
    /// Map a key name, as typed on a console, to an input event.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_lowercase().as_str() {
            "n" | "right" | "next" => Some(InputEvent::Next),
            "p" | "left" | "prev" | "previous" => Some(InputEvent::Previous),
            "" | " " | "space" | "enter" | "ok" => Some(InputEvent::Select),
            "i" | "up" | "down" | "info" => Some(InputEvent::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Foreground,
    Background,
}

/// Where a loaded playlist came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOrigin {
    Remote,
    /// Stored manifest, filtered to items available offline.
    Cached,
}

#[derive(Debug)]
pub enum ManifestEvent {
    Loaded { playlist: Playlist, origin: ManifestOrigin },
    /// No playlist could be obtained, online or offline.
    Unavailable { reason: String },
    Connectivity { online: bool },
}
