use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheTier;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub app: AppConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub storage: StorageConfig,
  pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the document store (collections live below it)
  pub base_url: String,
  /// Path probed by the connectivity monitor. A leading `/` is resolved
  /// against the server root; otherwise it is appended to `base_url`.
  pub health_path: String,
  /// Seconds between connectivity probes
  pub probe_interval_secs: u64,
}

impl RemoteConfig {
  /// URL probed by the connectivity monitor, see `health_path`.
  pub fn health_url(&self) -> Result<url::Url, url::ParseError> {
    let mut base = url::Url::parse(&self.base_url)?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    base.join(&self.health_path)
  }
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/v1/documents".to_string(),
      health_path: "/health".to_string(),
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Origin whose GET traffic goes through the cache
  pub origin: String,
  /// Path prefix routed network-first
  pub api_prefix: String,
  /// Static asset allow-list; a trailing `*` matches a prefix
  pub static_assets: Vec<String>,
  /// Shell page served to navigations when nothing else is available
  pub shell_path: String,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      api_prefix: "/api/".to_string(),
      static_assets: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/static/*".to_string(),
        "/icons/*".to_string(),
      ],
      shell_path: "/index.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Suffix of the tier names; entries of other versions are dropped on activate
  pub version: String,
  #[serde(rename = "static")]
  pub static_tier: TierConfig,
  #[serde(rename = "dynamic")]
  pub dynamic_tier: TierConfig,
  /// Byte-budget eviction stops at this fraction of `max_bytes`
  pub evict_to_ratio: f64,
  /// Quota checks above this usage ratio trigger a cleanup
  pub quota_cleanup_ratio: f64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      static_tier: TierConfig {
        max_entries: 100,
        max_bytes: 50 * 1024 * 1024,
        ttl_secs: 24 * 60 * 60,
        max_stale_secs: 30 * 24 * 60 * 60,
      },
      dynamic_tier: TierConfig {
        max_entries: 50,
        max_bytes: 10 * 1024 * 1024,
        ttl_secs: 60 * 60,
        max_stale_secs: 7 * 24 * 60 * 60,
      },
      evict_to_ratio: 0.8,
      quota_cleanup_ratio: 0.9,
    }
  }
}

impl CacheConfig {
  pub fn tier(&self, tier: CacheTier) -> &TierConfig {
    match tier {
      CacheTier::Static => &self.static_tier,
      CacheTier::Dynamic => &self.dynamic_tier,
    }
  }

  /// Storage name of a tier, e.g. `fitsync-static-v1`
  pub fn cache_name(&self, tier: CacheTier) -> String {
    format!("fitsync-{}-{}", tier, self.version)
  }
}

/// Upper bound for tier ages, about a century.
const MAX_TIER_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
  pub max_entries: usize,
  pub max_bytes: u64,
  /// Entries younger than this are fresh
  pub ttl_secs: u64,
  /// Cleanup drops entries older than this
  pub max_stale_secs: u64,
}

impl TierConfig {
  pub fn ttl(&self) -> chrono::Duration {
    age(self.ttl_secs)
  }

  pub fn max_stale(&self) -> chrono::Duration {
    age(self.max_stale_secs)
  }
}

// Clamped so date arithmetic around `now` cannot overflow
fn age(secs: u64) -> chrono::Duration {
  chrono::Duration::seconds(secs.min(MAX_TIER_AGE_SECS) as i64)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_attempts: u32,
  /// Pause between two queued records during a drain
  pub record_delay_ms: u64,
  /// Deadline for a single remote write or cache-managed fetch
  pub network_timeout_ms: u64,
  /// Seconds between periodic drains
  pub interval_secs: u64,
  /// Oldest records are evicted past this many queued writes
  pub queue_max_items: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      record_delay_ms: 100,
      network_timeout_ms: 10_000,
      interval_secs: 300,
      queue_max_items: 500,
    }
  }
}

impl SyncConfig {
  pub fn record_delay(&self) -> Duration {
    Duration::from_millis(self.record_delay_ms)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/fitsync/fitsync.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// How long a foreground caller waits for the worker's reply
  pub reply_timeout_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      reply_timeout_ms: 5000,
    }
  }
}

impl WorkerConfig {
  pub fn reply_timeout(&self) -> Duration {
    Duration::from_millis(self.reply_timeout_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fitsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fitsync/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
    let local = PathBuf::from("fitsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fitsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !(0.0..=1.0).contains(&self.cache.evict_to_ratio) {
      return Err(eyre!(
        "cache.evict_to_ratio must be between 0 and 1, got {}",
        self.cache.evict_to_ratio
      ));
    }
    if self.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    for tier in CacheTier::ALL {
      let limits = self.cache.tier(tier);
      for (field, secs) in [("ttl_secs", limits.ttl_secs), ("max_stale_secs", limits.max_stale_secs)] {
        if secs > MAX_TIER_AGE_SECS {
          return Err(eyre!(
            "cache.{}.{} must be at most {}, got {}",
            tier,
            field,
            MAX_TIER_AGE_SECS,
            secs
          ));
        }
      }
    }
    url::Url::parse(&self.app.origin)
      .map_err(|e| eyre!("app.origin is not a valid URL ({}): {}", self.app.origin, e))?;
    url::Url::parse(&self.remote.base_url)
      .map_err(|e| eyre!("remote.base_url is not a valid URL ({}): {}", self.remote.base_url, e))?;
    Ok(())
  }

  /// Path of the SQLite database holding the queue and both cache tiers.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("fitsync.db"))
  }
}

/// Per-user data directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("fitsync"))
}
