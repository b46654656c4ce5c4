//! Queue storage trait and SQLite implementation.

use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use super::record::{QueuedRecord, RecordKind};
use crate::db::{format_timestamp, parse_timestamp, SqliteStorage, StorageError, StorageResult};

/// Namespace the pending writes are stored under.
pub const QUEUE_NAMESPACE: &str = "pending_writes";

/// Trait for offline queue backends.
pub trait QueueStorage: Send + Sync {
  /// Insert a record, or replace the payload of the record with the same
  /// local id. When more than `max_items` records are held afterwards the
  /// oldest others are deleted and their local ids returned.
  fn push(&self, record: &QueuedRecord, max_items: usize) -> StorageResult<Vec<String>>;

  /// All records in enqueue order. Rows that cannot be decoded are skipped.
  fn records(&self) -> StorageResult<Vec<QueuedRecord>>;

  fn get(&self, local_id: &str) -> StorageResult<Option<QueuedRecord>>;

  /// Delete a record, returning whether it existed.
  fn delete(&self, local_id: &str) -> StorageResult<bool>;

  fn count(&self) -> StorageResult<usize>;

  /// Store a failed attempt.
  fn record_failure(&self, local_id: &str, attempts: u32, error: &str) -> StorageResult<()>;

  /// Store the id the remote store assigned.
  fn set_remote_id(&self, local_id: &str, remote_id: &str) -> StorageResult<()>;
}

const SELECT_RECORD: &str = "SELECT local_id, remote_id, kind, payload, enqueued_at, attempts, last_error
   FROM offline_queue";

/// Raw row, decoded outside the rusqlite closure so corruption is typed.
struct RawRecord {
  local_id: String,
  remote_id: Option<String>,
  kind: String,
  payload: String,
  enqueued_at: String,
  attempts: i64,
  last_error: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      local_id: row.get(0)?,
      remote_id: row.get(1)?,
      kind: row.get(2)?,
      payload: row.get(3)?,
      enqueued_at: row.get(4)?,
      attempts: row.get(5)?,
      last_error: row.get(6)?,
    })
  }

  fn decode(self) -> StorageResult<QueuedRecord> {
    let kind: RecordKind = self.kind.parse().map_err(StorageError::Corrupt)?;
    let payload = serde_json::from_str(&self.payload).map_err(|e| {
      StorageError::Corrupt(format!("Bad payload for {}: {}", self.local_id, e))
    })?;
    Ok(QueuedRecord {
      enqueued_at: parse_timestamp(&self.enqueued_at)?,
      local_id: self.local_id,
      remote_id: self.remote_id,
      kind,
      payload,
      attempts: self.attempts.clamp(0, u32::MAX as i64) as u32,
      last_error: self.last_error,
    })
  }
}

impl QueueStorage for SqliteStorage {
  fn push(&self, record: &QueuedRecord, max_items: usize) -> StorageResult<Vec<String>> {
    let payload = serde_json::to_string(&record.payload)?;
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT INTO offline_queue (namespace, local_id, remote_id, kind, payload, enqueued_at, attempts, last_error)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT(namespace, local_id) DO UPDATE SET kind = excluded.kind, payload = excluded.payload",
      params![
        QUEUE_NAMESPACE,
        record.local_id,
        record.remote_id,
        record.kind.to_string(),
        payload,
        format_timestamp(&record.enqueued_at),
        record.attempts,
        record.last_error,
      ],
    )?;

    let count: i64 = tx.query_row(
      "SELECT COUNT(*) FROM offline_queue WHERE namespace = ?",
      params![QUEUE_NAMESPACE],
      |row| row.get(0),
    )?;

    let overflow = (count.max(0) as usize).saturating_sub(max_items);
    let mut evicted = Vec::new();
    if overflow > 0 {
      let mut stmt = tx.prepare(
        "SELECT local_id FROM offline_queue
         WHERE namespace = ? AND local_id != ?
         ORDER BY seq LIMIT ?",
      )?;
      evicted = stmt
        .query_map(
          params![QUEUE_NAMESPACE, record.local_id, overflow as i64],
          |row| row.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
      drop(stmt);

      for local_id in &evicted {
        tx.execute(
          "DELETE FROM offline_queue WHERE namespace = ? AND local_id = ?",
          params![QUEUE_NAMESPACE, local_id],
        )?;
      }
    }

    tx.commit()?;
    Ok(evicted)
  }

  fn records(&self) -> StorageResult<Vec<QueuedRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!("{} WHERE namespace = ? ORDER BY seq", SELECT_RECORD))?;
    let rows = stmt
      .query_map(params![QUEUE_NAMESPACE], RawRecord::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for raw in rows {
      let local_id = raw.local_id.clone();
      match raw.decode() {
        Ok(record) => records.push(record),
        Err(e) => warn!(local_id = %local_id, error = %e, "Skipping unreadable queued record"),
      }
    }
    Ok(records)
  }

  fn get(&self, local_id: &str) -> StorageResult<Option<QueuedRecord>> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("{} WHERE namespace = ? AND local_id = ?", SELECT_RECORD),
        params![QUEUE_NAMESPACE, local_id],
        RawRecord::from_row,
      )
      .optional()?;
    raw.map(RawRecord::decode).transpose()
  }

  fn delete(&self, local_id: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let deleted = conn.execute(
      "DELETE FROM offline_queue WHERE namespace = ? AND local_id = ?",
      params![QUEUE_NAMESPACE, local_id],
    )?;
    Ok(deleted > 0)
  }

  fn count(&self) -> StorageResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM offline_queue WHERE namespace = ?",
      params![QUEUE_NAMESPACE],
      |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
  }

  fn record_failure(&self, local_id: &str, attempts: u32, error: &str) -> StorageResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE offline_queue SET attempts = ?, last_error = ?
       WHERE namespace = ? AND local_id = ?",
      params![attempts, error, QUEUE_NAMESPACE, local_id],
    )?;
    Ok(())
  }

  fn set_remote_id(&self, local_id: &str, remote_id: &str) -> StorageResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE offline_queue SET remote_id = ? WHERE namespace = ? AND local_id = ?",
      params![remote_id, QUEUE_NAMESPACE, local_id],
    )?;
    Ok(())
  }
}
