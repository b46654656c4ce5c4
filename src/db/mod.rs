//! SQLite-backed persistence for the offline queue and the cache tiers.
//!
//! Both stores live in one database file. Every trait operation takes the
//! connection lock once, so each read or write is atomic per key.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Local storage is full")]
  Full,

  #[error("Corrupt persisted state: {0}")]
  Corrupt(String),

  #[error("Serialization failed: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("SQLite error: {0}")]
  Sqlite(rusqlite::Error),

  #[error("Storage lock poisoned")]
  LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(ErrorCode::DiskFull) => StorageError::Full,
      Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
        StorageError::Corrupt(e.to_string())
      }
      _ => StorageError::Sqlite(e),
    }
  }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// SQLite storage shared by the queue and the cache.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Corrupt(format!(
          "Failed to create storage directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn in_memory() -> StorageResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> StorageResult<()> {
    self.lock()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  pub(crate) fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

/// Format a timestamp so that lexical order equals chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("Failed to parse timestamp '{}': {}", s, e)))
}
