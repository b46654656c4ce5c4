//! Tiered response cache with per-request strategies.
//!
//! This module provides:
//! - Routing of GET requests to cache-first, network-first or
//!   stale-while-revalidate handling
//! - Two named tiers (static, dynamic), each with its own TTL and budget
//! - Oldest-first eviction by entry count and by bytes, with hysteresis
//! - Offline fallbacks: stale entries, the cached shell page, synthetic 503s

mod eviction;
mod manager;
mod storage;
mod strategy;
mod types;

pub use manager::{CacheManager, TierUsage};
pub use storage::CacheStorage;
pub use types::{CacheResult, CacheTier, ResponseSource, CACHED_AT_HEADER};
