//! Core types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::Response;

/// Header injected into every stored response, holding its `cached_at`.
pub const CACHED_AT_HEADER: &str = "x-fitsync-cached-at";

/// Named partition of the cache with its own budget and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
  /// Application shell and static assets
  Static,
  /// API responses and other pages
  Dynamic,
}

impl CacheTier {
  pub const ALL: [CacheTier; 2] = [CacheTier::Static, CacheTier::Dynamic];
}

impl fmt::Display for CacheTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheTier::Static => write!(f, "static"),
      CacheTier::Dynamic => write!(f, "dynamic"),
    }
  }
}

/// Stable, fixed-length storage key for a request.
pub fn request_key(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.to_ascii_uppercase().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub request_key: String,
  pub url: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn size(&self) -> u64 {
    self.response.body.len() as u64
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.cached_at
  }

  pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
    self.age(now) < ttl
  }
}

/// What eviction needs to know about an entry, without its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
  pub request_key: String,
  pub url: String,
  pub size: u64,
  pub cached_at: DateTime<Utc>,
}

/// Entry count and byte total of one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
  pub entries: usize,
  pub bytes: u64,
}

/// Result of handling a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: ResponseSource,
}

impl CacheResult {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Request was not intercepted
  Passthrough,
  /// Cached entry within its TTL (or served while revalidating)
  Cache,
  /// Cached entry served because the network failed
  StaleCache,
  /// Cached shell page served to an offline navigation
  Shell,
  /// Generated offline response, nothing cached
  Synthetic,
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_request_key_is_stable_and_method_insensitive() {
    let a = request_key("GET", "http://app.test/api/workouts");
    let b = request_key("get", "http://app.test/api/workouts");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert_ne!(a, request_key("GET", "http://app.test/api/programs"));
  }

  #[test]
  fn test_entry_freshness() {
    let now = Utc::now();
    let entry = CacheEntry {
      request_key: "k".to_string(),
      url: "http://app.test/".to_string(),
      response: Response::new(200, "body"),
      cached_at: now - Duration::minutes(61),
    };
    assert!(!entry.is_fresh(Duration::minutes(60), now));
    assert!(entry.is_fresh(Duration::minutes(90), now));
    assert_eq!(entry.size(), 4);
  }
}
