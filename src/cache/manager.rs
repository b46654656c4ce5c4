//! Cache manager that routes each request to a strategy and keeps the
//! tiers within budget.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::eviction::{self, Budget};
use super::storage::CacheStorage;
use super::strategy::{Route, Router, Strategy};
use super::types::{
  request_key, CacheEntry, CacheResult, CacheTier, EntryMeta, ResponseSource, CACHED_AT_HEADER,
};
use crate::config::{AppConfig, CacheConfig};
use crate::db::{format_timestamp, StorageError};
use crate::net::{fetch_with_timeout, Network, Request, Response};

/// Usage of one tier against its limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierUsage {
  pub tier: String,
  pub cache_name: String,
  pub entries: usize,
  pub bytes: u64,
  pub max_entries: usize,
  pub max_bytes: u64,
}

/// Intercepts GET traffic and serves it from the network and the cache tiers.
///
/// `handle` never fails: every error ends in a network response, a cached
/// response or a synthetic offline response.
pub struct CacheManager<S: CacheStorage + 'static, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  router: Arc<Router>,
  config: Arc<CacheConfig>,
  shell_url: Url,
  timeout: Duration,
  /// Background refreshes started by stale-while-revalidate
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage + 'static, N: Network> Clone for CacheManager<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      router: Arc::clone(&self.router),
      config: Arc::clone(&self.config),
      shell_url: self.shell_url.clone(),
      timeout: self.timeout,
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}

impl<S: CacheStorage + 'static, N: Network> CacheManager<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    app: &AppConfig,
    config: CacheConfig,
    timeout: Duration,
  ) -> Result<Self, url::ParseError> {
    let router = Router::from_config(app)?;
    let shell_url = router.origin().join(&app.shell_path)?;
    Ok(Self {
      storage,
      network,
      router: Arc::new(router),
      config: Arc::new(config),
      shell_url,
      timeout,
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    })
  }

  /// Serve a request according to its route.
  pub async fn handle(&self, request: Request) -> CacheResult {
    match self.router.route(&request) {
      Route::Passthrough => self.passthrough(&request).await,
      Route::Cached(strategy) => {
        let tier = strategy.tier();
        match strategy {
          Strategy::CacheFirst => self.cache_first(tier, &request).await,
          Strategy::NetworkFirst => self.network_first(tier, &request).await,
          Strategy::StaleWhileRevalidate => self.stale_while_revalidate(tier, &request).await,
        }
      }
    }
  }

  async fn passthrough(&self, request: &Request) -> CacheResult {
    match self.network.fetch(request).await {
      Ok(response) => CacheResult::new(response, ResponseSource::Passthrough),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Passthrough request failed");
        CacheResult::new(offline_text(), ResponseSource::Synthetic)
      }
    }
  }

  /// Fresh static entry, else network (cached), else stale entry, else offline.
  async fn cache_first(&self, tier: CacheTier, request: &Request) -> CacheResult {
    let cached = self.lookup(tier, &request.url);
    let ttl = self.config.tier(tier).ttl();

    if let Some(entry) = &cached {
      if entry.is_fresh(ttl, Utc::now()) {
        return CacheResult::new(entry.response.clone(), ResponseSource::Cache);
      }
    }

    match fetch_with_timeout(self.network.as_ref(), request, self.timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.store(tier, &request.url, &response);
        }
        CacheResult::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Static fetch failed");
        match cached {
          Some(entry) => CacheResult::new(entry.response, ResponseSource::StaleCache),
          None => self.offline_response(request),
        }
      }
    }
  }

  /// Network with timeout; cached copy or an offline JSON error on failure.
  async fn network_first(&self, tier: CacheTier, request: &Request) -> CacheResult {
    match fetch_with_timeout(self.network.as_ref(), request, self.timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.store(tier, &request.url, &response);
        }
        CacheResult::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "API fetch failed, trying cache");
        match self.lookup(tier, &request.url) {
          Some(entry) => CacheResult::new(entry.response, ResponseSource::StaleCache),
          None => CacheResult::new(offline_json(&e.to_string()), ResponseSource::Synthetic),
        }
      }
    }
  }

  /// Cached copy now and a background refresh; network when nothing is cached.
  async fn stale_while_revalidate(&self, tier: CacheTier, request: &Request) -> CacheResult {
    if let Some(entry) = self.lookup(tier, &request.url) {
      let manager = self.clone();
      let request = request.clone();
      {
        let mut refreshes = self.lock_refreshes();
        // Reap finished refreshes so the set only holds running ones
        while refreshes.try_join_next().is_some() {}
        refreshes.spawn(async move {
          manager.revalidate(tier, &request).await;
        });
      }
      return CacheResult::new(entry.response, ResponseSource::Cache);
    }

    match fetch_with_timeout(self.network.as_ref(), request, self.timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.store(tier, &request.url, &response);
        }
        CacheResult::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Page fetch failed");
        self.offline_response(request)
      }
    }
  }

  /// Wait for every background refresh started so far.
  ///
  /// The runtime cancels spawned tasks when it shuts down, so short-lived
  /// callers flush before exiting to keep the refreshed entries.
  pub async fn flush(&self) {
    let mut pending = std::mem::take(&mut *self.lock_refreshes());
    let mut flushed = 0;
    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Background refresh did not finish");
      }
      flushed += 1;
    }
    if flushed > 0 {
      debug!(flushed, "Flushed background refreshes");
    }
  }

  fn lock_refreshes(&self) -> MutexGuard<'_, JoinSet<()>> {
    // The set stays usable even if a holder panicked
    self.refreshes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  async fn revalidate(&self, tier: CacheTier, request: &Request) {
    match fetch_with_timeout(self.network.as_ref(), request, self.timeout).await {
      Ok(response) if response.is_success() => {
        self.store(tier, &request.url, &response);
        debug!(url = %request.url, "Revalidated cached response");
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Revalidation returned an error status");
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Revalidation failed");
      }
    }
  }

  /// Cached shell page for navigations, a plain 503 otherwise.
  fn offline_response(&self, request: &Request) -> CacheResult {
    if request.navigation {
      if let Some(shell) = self.lookup(CacheTier::Static, &self.shell_url) {
        return CacheResult::new(shell.response, ResponseSource::Shell);
      }
    }
    CacheResult::new(offline_text(), ResponseSource::Synthetic)
  }

  /// Read an entry, treating storage errors as a miss.
  fn lookup(&self, tier: CacheTier, url: &Url) -> Option<CacheEntry> {
    let cache_name = self.config.cache_name(tier);
    match self.storage.get_entry(&cache_name, &request_key("GET", url.as_str())) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%tier, %url, error = %e, "Failed to read cache entry");
        None
      }
    }
  }

  /// Write a response with its freshness header, then enforce the tier budget.
  fn store(&self, tier: CacheTier, url: &Url, response: &Response) {
    let cache_name = self.config.cache_name(tier);
    let cached_at = Utc::now();
    let mut response = response.clone();
    response.set_header(CACHED_AT_HEADER, format_timestamp(&cached_at));

    let entry = CacheEntry {
      request_key: request_key("GET", url.as_str()),
      url: url.to_string(),
      response,
      cached_at,
    };

    let result = match self.storage.put_entry(&cache_name, &entry) {
      Err(StorageError::Full) => {
        warn!(%tier, "Local storage full, evicting before retry");
        self.make_room(tier);
        self.storage.put_entry(&cache_name, &entry)
      }
      other => other,
    };

    if let Err(e) = result {
      warn!(%tier, %url, error = %e, "Failed to cache response");
      return;
    }
    self.enforce_budget(tier);
  }

  fn budget(&self, tier: CacheTier) -> Budget {
    let tier_config = self.config.tier(tier);
    Budget {
      max_entries: tier_config.max_entries,
      max_bytes: tier_config.max_bytes,
      evict_to_ratio: self.config.evict_to_ratio,
    }
  }

  /// Evict oldest entries of a tier until it fits its budget.
  pub fn enforce_budget(&self, tier: CacheTier) -> usize {
    let cache_name = self.config.cache_name(tier);
    let entries = match self.storage.entries_oldest_first(&cache_name) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(%tier, error = %e, "Failed to list cache entries for eviction");
        return 0;
      }
    };

    let victims = eviction::plan(&entries, &self.budget(tier));
    let evicted = self.evict(&cache_name, &entries, &victims);
    if evicted > 0 {
      info!(%tier, evicted, remaining = entries.len() - evicted, "Evicted cache entries");
    }
    evicted
  }

  /// Shrink a tier to the eviction ratio of its byte budget, or of its
  /// current size when that is smaller.
  fn make_room(&self, tier: CacheTier) -> usize {
    let cache_name = self.config.cache_name(tier);
    let entries = match self.storage.entries_oldest_first(&cache_name) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(%tier, error = %e, "Failed to list cache entries");
        return 0;
      }
    };

    let bytes: u64 = entries.iter().map(|e| e.size).sum();
    let budget = self.budget(tier);
    let target = budget.byte_target().min((bytes as f64 * budget.evict_to_ratio) as u64);
    let victims = eviction::shrink(&entries, bytes, target);
    self.evict(&cache_name, &entries, &victims)
  }

  /// Delete the `victims` among `entries`, returning how many were removed.
  fn evict(&self, cache_name: &str, entries: &[EntryMeta], victims: &[String]) -> usize {
    let victims: HashSet<&str> = victims.iter().map(String::as_str).collect();
    entries
      .iter()
      .filter(|entry| victims.contains(entry.request_key.as_str()))
      .filter(|entry| match self.storage.delete_entry(cache_name, &entry.request_key) {
        Ok(deleted) => {
          debug!(cache_name, url = %entry.url, size = entry.size, "Evicted cache entry");
          deleted
        }
        Err(e) => {
          warn!(cache_name, url = %entry.url, error = %e, "Failed to evict cache entry");
          false
        }
      })
      .count()
  }

  /// Fetch every precacheable static asset into the static tier.
  ///
  /// Individual failures are logged and skipped. Returns how many were cached.
  pub async fn precache(&self) -> usize {
    let urls = self.router.precache_urls();
    let fetches = urls.into_iter().map(|url| async move {
      let request = Request::get(url);
      let result = fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await;
      (request.url, result)
    });

    let mut cached = 0;
    for (url, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_success() => {
          self.store(CacheTier::Static, &url, &response);
          cached += 1;
        }
        Ok(response) => warn!(%url, status = response.status, "Precache fetch returned an error status"),
        Err(e) => warn!(%url, error = %e, "Precache fetch failed"),
      }
    }

    info!(cached, "Precached static assets");
    cached
  }

  /// Delete the tiers of other cache versions. Returns the entries removed.
  pub fn activate(&self) -> usize {
    let current: Vec<String> = CacheTier::ALL.iter().map(|t| self.config.cache_name(*t)).collect();
    let names = match self.storage.cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list caches");
        return 0;
      }
    };

    let mut removed = 0;
    for name in names.iter().filter(|n| n.starts_with("fitsync-") && !current.contains(*n)) {
      match self.storage.clear(name) {
        Ok(n) => {
          info!(cache_name = %name, entries = n, "Deleted outdated cache");
          removed += n;
        }
        Err(e) => warn!(cache_name = %name, error = %e, "Failed to delete outdated cache"),
      }
    }
    removed
  }

  /// Drop entries older than each tier's maximum staleness, then enforce
  /// budgets. Returns the entries removed.
  pub fn cleanup(&self) -> usize {
    let now = Utc::now();
    let mut removed = 0;

    for tier in CacheTier::ALL {
      let cache_name = self.config.cache_name(tier);
      let cutoff = now - self.config.tier(tier).max_stale();
      match self.storage.delete_older_than(&cache_name, cutoff) {
        Ok(n) => removed += n,
        Err(e) => warn!(%tier, error = %e, "Failed to drop stale entries"),
      }
      removed += self.enforce_budget(tier);
    }

    info!(removed, "Cache cleanup finished");
    removed
  }

  /// Delete every cached entry of every cache. Returns the entries removed.
  pub fn clear(&self) -> usize {
    let names = self.storage.cache_names().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to list caches");
      Vec::new()
    });

    names
      .iter()
      .map(|name| {
        self.storage.clear(name).unwrap_or_else(|e| {
          warn!(cache_name = %name, error = %e, "Failed to clear cache");
          0
        })
      })
      .sum()
  }

  /// Usage of each tier against its limits.
  pub fn usage(&self) -> Vec<TierUsage> {
    CacheTier::ALL
      .iter()
      .map(|&tier| {
        let cache_name = self.config.cache_name(tier);
        let usage = self.storage.usage(&cache_name).unwrap_or_else(|e| {
          warn!(%tier, error = %e, "Failed to read cache usage");
          Default::default()
        });
        let limits = self.config.tier(tier);
        TierUsage {
          tier: tier.to_string(),
          cache_name,
          entries: usage.entries,
          bytes: usage.bytes,
          max_entries: limits.max_entries,
          max_bytes: limits.max_bytes,
        }
      })
      .collect()
  }

  /// Bytes used over bytes allowed, across all tiers.
  pub fn usage_ratio(usage: &[TierUsage]) -> f64 {
    let max: u64 = usage.iter().map(|u| u.max_bytes).sum();
    if max == 0 {
      return 0.0;
    }
    usage.iter().map(|u| u.bytes).sum::<u64>() as f64 / max as f64
  }

  pub fn quota_cleanup_ratio(&self) -> f64 {
    self.config.quota_cleanup_ratio
  }
}

fn offline_text() -> Response {
  Response::new(503, "Offline").with_header("content-type", "text/plain")
}

fn offline_json(error: &str) -> Response {
  let body = serde_json::json!({ "error": error, "offline": true });
  Response::new(503, body.to_string()).with_header("content-type", "application/json")
}
