//! Per-request strategy selection.

use url::Url;

use super::types::CacheTier;
use crate::config::AppConfig;
use crate::net::Request;

/// How a cached request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Fresh cache wins; otherwise network, then stale cache
  CacheFirst,
  /// Network with timeout; cache only as a fallback
  NetworkFirst,
  /// Serve cache immediately, refresh in the background
  StaleWhileRevalidate,
}

impl Strategy {
  pub fn tier(self) -> CacheTier {
    match self {
      Strategy::CacheFirst => CacheTier::Static,
      Strategy::NetworkFirst | Strategy::StaleWhileRevalidate => CacheTier::Dynamic,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted: non-GET or cross-origin
  Passthrough,
  Cached(Strategy),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AssetPattern {
  Exact(String),
  Prefix(String),
}

impl AssetPattern {
  fn parse(pattern: &str) -> Self {
    match pattern.strip_suffix('*') {
      Some(prefix) => AssetPattern::Prefix(prefix.to_string()),
      None => AssetPattern::Exact(pattern.to_string()),
    }
  }

  fn matches(&self, path: &str) -> bool {
    match self {
      AssetPattern::Exact(p) => p == path,
      AssetPattern::Prefix(p) => path.starts_with(p.as_str()),
    }
  }
}

/// Pure routing from request to strategy.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  api_prefix: String,
  static_assets: Vec<AssetPattern>,
}

impl Router {
  pub fn new(origin: Url, api_prefix: &str, static_assets: &[String]) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.to_string(),
      static_assets: static_assets.iter().map(|p| AssetPattern::parse(p)).collect(),
    }
  }

  pub fn from_config(app: &AppConfig) -> Result<Self, url::ParseError> {
    Ok(Self::new(
      Url::parse(&app.origin)?,
      &app.api_prefix,
      &app.static_assets,
    ))
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Static asset paths that can be fetched ahead of time (no wildcards).
  pub fn precache_urls(&self) -> Vec<Url> {
    self
      .static_assets
      .iter()
      .filter_map(|p| match p {
        AssetPattern::Exact(path) => self.origin.join(path).ok(),
        AssetPattern::Prefix(_) => None,
      })
      .collect()
  }

  /// Checked in order: static allow-list, API prefix, everything else.
  pub fn route(&self, request: &Request) -> Route {
    if !request.is_get() || request.url.origin() != self.origin.origin() {
      return Route::Passthrough;
    }

    let path = request.url.path();
    if self.static_assets.iter().any(|p| p.matches(path)) {
      Route::Cached(Strategy::CacheFirst)
    } else if path.starts_with(&self.api_prefix) {
      Route::Cached(Strategy::NetworkFirst)
    } else {
      Route::Cached(Strategy::StaleWhileRevalidate)
    }
  }
}
