use chrono::Duration as ChronoDuration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::{DEFAULT_GENERATION_PREFIX, DEFAULT_MANIFEST};

/// Application name used for config/data directory paths
const APP_NAME: &str = "offcache";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application, e.g. https://app.example.com
  pub origin: String,
  /// Deployed build version; names the cache generation
  pub version: String,
  /// Where the databases live (defaults to the platform data directory)
  pub data_dir: Option<PathBuf>,
  pub worker: WorkerConfig,
  pub feed: FeedConfig,
  pub sync: SyncConfig,
  /// Timeout for every outgoing HTTP request
  pub request_timeout_secs: u64,

  /// File this configuration was read from
  #[serde(skip)]
  source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub generation_prefix: String,
  /// Path prefix of dynamic endpoints (network-first)
  pub api_prefix: String,
  /// Resources precached at install
  pub manifest: Vec<String>,
  pub skip_waiting_on_install: bool,
  /// Refuse offline fallbacks older than this (unset = serve any age)
  pub fallback_max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
  /// Path of the feed endpoint, relative to the origin
  pub path: String,
  pub ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Path of the pending-mutation count endpoint, relative to the origin
  pub pending_path: String,
  pub interval_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      version: "v1".to_string(),
      data_dir: None,
      worker: WorkerConfig::default(),
      feed: FeedConfig::default(),
      sync: SyncConfig::default(),
      request_timeout_secs: 30,
      source: None,
    }
  }
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      generation_prefix: DEFAULT_GENERATION_PREFIX.to_string(),
      api_prefix: "/api/".to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      skip_waiting_on_install: true,
      fallback_max_age_secs: None,
    }
  }
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      path: "/api/feed".to_string(),
      ttl_secs: crate::feed::FEED_TTL_SECS,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      pending_path: "/api/sync/pending".to_string(),
      interval_secs: crate::sync::DEFAULT_POLL_INTERVAL.as_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config.source = Some(path.to_path_buf());

    Ok(config)
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if !self.worker.api_prefix.starts_with('/') {
      return Err(eyre!(
        "worker.api_prefix must start with '/': {}",
        self.worker.api_prefix
      ));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be positive"));
    }
    self.feed_ttl()?;
    self.fallback_max_age()?;
    Ok(())
  }

  /// Re-read the file this configuration came from.
  ///
  /// Consumers rebuild whatever depends on the changed values; nothing is
  /// restarted behind their back. A configuration built from defaults
  /// reloads to itself.
  pub fn reload(&self) -> Result<Self> {
    match &self.source {
      Some(path) => Self::load_from_path(path),
      None => Ok(self.clone()),
    }
  }

  pub fn source(&self) -> Option<&Path> {
    self.source.as_deref()
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Absolute URL for a path on the origin.
  pub fn resolve(&self, path: &str) -> Result<String> {
    self
      .origin_url()?
      .join(path)
      .map(|u| u.to_string())
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join(APP_NAME))
  }

  /// Database holding the cache generations.
  pub fn worker_cache_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("worker-cache.db"))
  }

  /// Database holding the feed snapshot.
  pub fn local_store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("local-store.db"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Staleness window of the feed snapshot.
  pub fn feed_ttl(&self) -> Result<ChronoDuration> {
    if self.feed.ttl_secs < 0 {
      return Err(eyre!("feed.ttl_secs must not be negative: {}", self.feed.ttl_secs));
    }
    ChronoDuration::try_seconds(self.feed.ttl_secs)
      .ok_or_else(|| eyre!("feed.ttl_secs is out of range: {}", self.feed.ttl_secs))
  }

  /// Age limit for offline fallbacks, if configured.
  pub fn fallback_max_age(&self) -> Result<Option<ChronoDuration>> {
    let Some(secs) = self.worker.fallback_max_age_secs else {
      return Ok(None);
    };
    i64::try_from(secs)
      .ok()
      .and_then(ChronoDuration::try_seconds)
      .map(Some)
      .ok_or_else(|| eyre!("worker.fallback_max_age_secs is out of range: {}", secs))
  }
}
