//! Query surface of the offline content store.
//!
//! The orchestrator only reads through this trait. Downloads it requests
//! are fire-and-forget; completion shows up as `is_available` turning true
//! on a later query.

use crate::manifest::{ContentItem, ContentKind};
use url::Url;

pub trait ContentAvailability: Send + Sync {
    /// Whether a complete local copy of the item exists.
    fn is_available(&self, id: &str) -> bool;

    /// Location of the local copy, if it exists and matches `kind`.
    fn local_uri(&self, id: &str, kind: ContentKind) -> Option<Url>;

    /// Ask the store to fetch the item in the background.
    fn request_background_fetch(&self, item: &ContentItem);

    /// Fraction downloaded so far for an in-flight item.
    fn download_progress(&self, _id: &str) -> Option<f32> {
        None
    }
}
