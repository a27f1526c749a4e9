//! Player configuration.
//!
//! Values come from an optional TOML file, overridden by environment
//! variables such as `SIGNAGE__MANIFEST__URL`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// File looked up in the working directory when no path is given.
const DEFAULT_CONFIG_NAME: &str = "signage";
const ENV_PREFIX: &str = "SIGNAGE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub manifest: ManifestConfig,
    pub playback: PlaybackConfig,
    pub cache: CacheConfig,
}

/// Where the playlist comes from and how often it is re-checked.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub url: String,
    pub refresh_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Start from the stored manifest without trying the network.
    pub force_offline: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/playlist.json".into(),
            refresh_interval_secs: 60,
            fetch_timeout_secs: 30,
            force_offline: false,
        }
    }
}

impl ManifestConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Timing rules of the playback state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Display time for documents and images without an explicit `time`.
    pub default_display_secs: u64,
    /// Upper bound on how long a transition may hold the guard.
    pub transition_deadline_secs: u64,
    /// Pause before skipping an item that failed to prepare.
    pub error_backoff_ms: u64,
    /// An item whose surface has not reported back by then counts as failed.
    pub prepare_timeout_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_display_secs: 10,
            transition_deadline_secs: 10,
            error_backoff_ms: 1000,
            prepare_timeout_secs: 30,
        }
    }
}

impl PlaybackConfig {
    pub fn default_display(&self) -> Duration {
        Duration::from_secs(self.default_display_secs)
    }

    pub fn transition_deadline(&self) -> Duration {
        Duration::from_secs(self.transition_deadline_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }
}

/// Offline store and download queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_size_mb: u64,
    pub max_parallel_downloads: usize,
    pub download_attempts: u32,
    pub retry_delay_secs: u64,
    /// Whole-transfer limit for a single download attempt.
    pub download_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            max_size_mb: 1024,
            max_parallel_downloads: 2,
            download_attempts: 3,
            retry_delay_secs: 5,
            download_timeout_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn content_dir(&self) -> PathBuf {
        self.dir.join("content")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }
}

impl PlayerConfig {
    /// Load configuration from `path` (or `signage.toml` if present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config: PlayerConfig = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.manifest.url)
            .with_context(|| format!("manifest.url {:?} is not a valid URL", self.manifest.url))?;
        if self.manifest.refresh_interval_secs == 0 {
            bail!("manifest.refresh_interval_secs must be greater than zero");
        }
        if self.manifest.fetch_timeout_secs == 0 {
            bail!("manifest.fetch_timeout_secs must be greater than zero");
        }
        if self.playback.default_display_secs == 0 {
            bail!("playback.default_display_secs must be greater than zero");
        }
        if self.playback.transition_deadline_secs == 0 {
            bail!("playback.transition_deadline_secs must be greater than zero");
        }
        if self.playback.prepare_timeout_secs == 0 {
            bail!("playback.prepare_timeout_secs must be greater than zero");
        }
        if self.cache.download_timeout_secs == 0 {
            bail!("cache.download_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
