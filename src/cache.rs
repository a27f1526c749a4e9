//! LRU store for offline content.
//!
//! One file per playlist item, named after the URL-encoded item id, so the
//! index can be rebuilt from a directory scan after a restart.

use crate::manifest::ContentKind;
use anyhow::{Context, Result};
use lru::LruCache;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Suffix of files that are still being written.
const PARTIAL_SUFFIX: &str = "part";

/// Metadata for a cached item.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
}

/// LRU cache of downloaded items.
pub struct ContentCache {
    /// Directory holding the content files.
    dir: PathBuf,
    /// Maximum cache size in bytes.
    max_size: u64,
    /// Current cache size in bytes.
    current_size: u64,
    /// Entries keyed by item id, least recently used first out.
    lru: LruCache<String, CacheEntry>,
}

impl ContentCache {
    /// Open (or create) the cache directory and index what is already there.
    pub fn open(dir: PathBuf, max_size_mb: u64) -> Result<Self> {
        fs::create_dir_all(&dir).context("Failed to create content cache directory")?;

        let mut cache = Self {
            dir,
            max_size: max_size_mb * 1024 * 1024,
            current_size: 0,
            lru: LruCache::unbounded(),
        };
        cache.scan_existing();

        tracing::info!(
            "Content cache ready: {} items, {:.2} MB / {} MB",
            cache.lru.len(),
            cache.current_size as f64 / 1024.0 / 1024.0,
            max_size_mb
        );

        Ok(cache)
    }

    /// Populate the index from files on disk, dropping leftover partial files.
    fn scan_existing(&mut self) {
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();

            if path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_SUFFIX) {
                tracing::debug!("Removing partial download {:?}", path);
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(id) = id_from_path(&path) else {
                tracing::debug!("Ignoring unknown file in cache: {:?}", path);
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            self.current_size += size;
            self.lru.put(id, CacheEntry { path, size });
        }
    }

    /// Final location of an item's local copy.
    pub fn path_for(&self, id: &str, kind: ContentKind) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(id), kind.file_extension()))
    }

    /// Location used while the item is being downloaded.
    pub fn partial_path_for(&self, id: &str, kind: ContentKind) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}",
            urlencoding::encode(id),
            kind.file_extension(),
            PARTIAL_SUFFIX
        ))
    }

    /// Path of the cached copy, if it is indexed and still on disk.
    pub fn lookup(&self, id: &str) -> Option<&Path> {
        self.lru
            .peek(id)
            .map(|entry| entry.path.as_path())
            .filter(|path| path.exists())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Mark an item as recently used.
    pub fn touch(&mut self, id: &str) {
        let _ = self.lru.get(id);
    }

    /// Register a completed file, evicting older items to stay under the limit.
    pub fn insert(&mut self, id: &str, path: PathBuf, size: u64) {
        if let Some(previous) = self.lru.pop(id) {
            self.current_size = self.current_size.saturating_sub(previous.size);
            if previous.path != path {
                let _ = fs::remove_file(&previous.path);
            }
        }

        while self.current_size + size > self.max_size {
            if !self.evict_lru() {
                tracing::warn!("Content cache full and nothing left to evict, keeping {}", id);
                break;
            }
        }

        self.lru.put(id.to_string(), CacheEntry { path, size });
        self.current_size += size;

        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            id,
            size as f64 / 1024.0,
            self.current_size as f64 / 1024.0 / 1024.0
        );
    }

    /// Evict the least recently used item.
    fn evict_lru(&mut self) -> bool {
        let Some((id, entry)) = self.lru.pop_lru() else {
            return false;
        };
        tracing::debug!("Evicting {} ({:?})", id, entry.path);
        if entry.path.exists() {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove cached file: {}", e);
            }
        }
        self.current_size = self.current_size.saturating_sub(entry.size);
        true
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            current_size: self.current_size,
            max_size: self.max_size,
            item_count: self.lru.len(),
        }
    }
}

/// Recover the item id from `<encoded id>.<ext>`.
fn id_from_path(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?;
    if !ContentKind::ALL
        .iter()
        .any(|kind| kind.file_extension() == extension)
    {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    urlencoding::decode(stem).ok().map(|id| id.into_owned())
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn rebuilds_index_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("clip%201.mp4"), 10);
        write(&dir.path().join("page.html"), 5);
        write(&dir.path().join("stale.jpg.part"), 5);
        write(&dir.path().join("notes.txt"), 5);

        let cache = ContentCache::open(dir.path().to_path_buf(), 1).unwrap();

        assert!(cache.contains("clip 1"));
        assert!(cache.contains("page"));
        assert!(!cache.contains("notes"));
        assert!(!dir.path().join("stale.jpg.part").exists());
        assert_eq!(cache.stats().item_count, 2);
        assert_eq!(cache.stats().current_size, 15);
    }

    #[test]
    fn paths_round_trip_ids_with_separators() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path().to_path_buf(), 1).unwrap();

        let path = cache.path_for("promo/2024", ContentKind::Image);
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(id_from_path(&path).as_deref(), Some("promo/2024"));
    }

    #[test]
    fn evicts_least_recently_used_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ContentCache::open(dir.path().to_path_buf(), 1).unwrap();
        let chunk = 400 * 1024;

        for id in ["a", "b"] {
            let path = cache.path_for(id, ContentKind::Video);
            write(&path, chunk);
            cache.insert(id, path, chunk as u64);
        }
        cache.touch("a");

        let path = cache.path_for("c", ContentKind::Video);
        write(&path, chunk);
        cache.insert("c", path, chunk as u64);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(!cache.path_for("b", ContentKind::Video).exists());
    }
}
