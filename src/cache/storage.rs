//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{CacheEntry, EntryMeta, Usage};
use crate::db::{format_timestamp, parse_timestamp, SqliteStorage, StorageError, StorageResult};
use crate::net::Response;

/// Trait for cache storage backends.
///
/// `cache_name` identifies a tier of a given cache version
/// (e.g. `fitsync-static-v1`). Every method is a single atomic operation.
pub trait CacheStorage: Send + Sync {
  /// Get an entry by request key.
  fn get_entry(&self, cache_name: &str, request_key: &str) -> StorageResult<Option<CacheEntry>>;

  /// Insert or replace an entry. A replaced entry becomes the newest one.
  fn put_entry(&self, cache_name: &str, entry: &CacheEntry) -> StorageResult<()>;

  /// Delete an entry, returning whether it existed.
  fn delete_entry(&self, cache_name: &str, request_key: &str) -> StorageResult<bool>;

  /// Entry metadata ordered oldest first.
  fn entries_oldest_first(&self, cache_name: &str) -> StorageResult<Vec<EntryMeta>>;

  /// Entry count and total body bytes.
  fn usage(&self, cache_name: &str) -> StorageResult<Usage>;

  /// Delete entries cached before `cutoff`.
  fn delete_older_than(&self, cache_name: &str, cutoff: DateTime<Utc>) -> StorageResult<usize>;

  /// Names of every cache that holds at least one entry.
  fn cache_names(&self) -> StorageResult<Vec<String>>;

  /// Delete every entry of a cache.
  fn clear(&self, cache_name: &str) -> StorageResult<usize>;
}

impl CacheStorage for SqliteStorage {
  fn get_entry(&self, cache_name: &str, request_key: &str) -> StorageResult<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request_key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    match row {
      Some((url, status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| StorageError::Corrupt(format!("Bad headers for {}: {}", url, e)))?;
        Ok(Some(CacheEntry {
          request_key: request_key.to_string(),
          url,
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_timestamp(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, cache_name: &str, entry: &CacheEntry) -> StorageResult<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&entry.response.headers)?;

    conn.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, url, status, headers, body, size, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache_name,
        entry.request_key,
        entry.url,
        entry.response.status,
        headers,
        entry.response.body,
        entry.size() as i64,
        format_timestamp(&entry.cached_at),
      ],
    )?;

    Ok(())
  }

  fn delete_entry(&self, cache_name: &str, request_key: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ? AND request_key = ?",
      params![cache_name, request_key],
    )?;
    Ok(deleted > 0)
  }

  fn entries_oldest_first(&self, cache_name: &str) -> StorageResult<Vec<EntryMeta>> {
    let conn = self.lock()?;

    // rowid breaks ties between entries written within the same microsecond
    let mut stmt = conn.prepare(
      "SELECT request_key, url, size, cached_at FROM cache_entries
       WHERE cache_name = ?
       ORDER BY cached_at, rowid",
    )?;

    let rows = stmt
      .query_map(params![cache_name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(request_key, url, size, cached_at)| -> StorageResult<EntryMeta> {
        Ok(EntryMeta {
          request_key,
          url,
          size: size.max(0) as u64,
          cached_at: parse_timestamp(&cached_at)?,
        })
      })
      .collect()
  }

  fn usage(&self, cache_name: &str) -> StorageResult<Usage> {
    let conn = self.lock()?;
    let (entries, bytes): (i64, i64) = conn.query_row(
      "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Usage {
      entries: entries.max(0) as usize,
      bytes: bytes.max(0) as u64,
    })
  }

  fn delete_older_than(&self, cache_name: &str, cutoff: DateTime<Utc>) -> StorageResult<usize> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ? AND cached_at < ?",
      params![cache_name, format_timestamp(&cutoff)],
    )?;
    Ok(deleted)
  }

  fn cache_names(&self) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn clear(&self, cache_name: &str) -> StorageResult<usize> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )?;
    Ok(deleted)
  }
}
