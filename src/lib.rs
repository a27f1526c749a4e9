//! Digital signage player.
//!
//! Plays a remotely managed playlist of videos, web documents and images in
//! a loop, prefetching the next item, caching content for offline use and
//! skipping whatever fails to play.

pub mod availability;
pub mod cache;
pub mod config;
pub mod downloads;
pub mod error;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod orchestrator;
pub mod player;
pub mod status;
pub mod surface;
pub mod surfaces;
mod timer;
pub mod watcher;

pub use crate::config::PlayerConfig;
pub use crate::player::{Player, PlayerHandle};
