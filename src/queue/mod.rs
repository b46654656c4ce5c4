//! Durable queue of writes the remote store has not confirmed yet.
//!
//! The public operations never fail. Storage problems are logged and
//! degrade to a no-op (writes) or an empty result (reads).

mod record;
mod storage;

pub use record::{new_local_id, QueuedRecord, RecordKind};
pub use storage::QueueStorage;

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::StorageError;
use crate::remote::RemoteError;

/// Offline queue over a shared storage backend.
pub struct OfflineQueue<S: QueueStorage> {
  storage: Arc<S>,
  max_items: usize,
}

impl<S: QueueStorage> Clone for OfflineQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      max_items: self.max_items,
    }
  }
}

impl<S: QueueStorage> OfflineQueue<S> {
  pub fn new(storage: Arc<S>, max_items: usize) -> Self {
    Self {
      storage,
      max_items: max_items.max(1),
    }
  }

  /// Queue a payload under a fresh local id and return that id.
  pub fn enqueue<T: Serialize>(&self, kind: RecordKind, payload: &T) -> String {
    let local_id = new_local_id();
    self.enqueue_with_id(&local_id, kind, payload);
    local_id
  }

  /// Queue a payload under a caller-chosen local id.
  ///
  /// Returns whether the record was stored. Enqueueing an id that is already
  /// queued replaces its payload.
  pub fn enqueue_with_id<T: Serialize>(&self, local_id: &str, kind: RecordKind, payload: &T) -> bool {
    let payload = match serde_json::to_value(payload) {
      Ok(value) => value,
      Err(e) => {
        warn!(local_id, error = %e, "Failed to serialize queued payload, dropping it");
        return false;
      }
    };

    let record = QueuedRecord::new(local_id.to_string(), kind, payload);
    match self.storage.push(&record, self.max_items) {
      Ok(evicted) => {
        if !evicted.is_empty() {
          warn!(
            evicted = evicted.len(),
            max_items = self.max_items,
            "Offline queue full, dropped oldest records"
          );
        }
        debug!(local_id, %kind, "Queued record");
        true
      }
      Err(StorageError::Full) => {
        warn!(local_id, "Local storage full, dropping newest queued record");
        false
      }
      Err(e) => {
        warn!(local_id, error = %e, "Failed to persist queued record");
        false
      }
    }
  }

  /// Pending records, oldest first.
  pub fn list(&self) -> Vec<QueuedRecord> {
    self.storage.records().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to read offline queue, treating it as empty");
      Vec::new()
    })
  }

  #[cfg(test)]
  pub fn get(&self, local_id: &str) -> Option<QueuedRecord> {
    self.storage.get(local_id).unwrap_or_else(|e| {
      warn!(local_id, error = %e, "Failed to read queued record");
      None
    })
  }

  /// Delete a record. Removing an unknown id is not an error.
  pub fn remove(&self, local_id: &str) -> bool {
    match self.storage.delete(local_id) {
      Ok(existed) => existed,
      Err(e) => {
        warn!(local_id, error = %e, "Failed to remove queued record");
        false
      }
    }
  }

  pub fn count(&self) -> usize {
    self.storage.count().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to count offline queue");
      0
    })
  }

  /// Store a failed attempt and return the new attempt count.
  ///
  /// Permanent rejections jump straight to `max_attempts`; the count never
  /// exceeds it.
  pub fn record_failure(
    &self,
    local_id: &str,
    previous_attempts: u32,
    error: &RemoteError,
    max_attempts: u32,
  ) -> u32 {
    let attempts = if error.is_permanent() {
      max_attempts
    } else {
      previous_attempts.saturating_add(1).min(max_attempts)
    };

    if let Err(e) = self.storage.record_failure(local_id, attempts, &error.to_string()) {
      warn!(local_id, error = %e, "Failed to record sync failure");
    }
    attempts
  }

  /// Mark a record as persisted remotely: remember its remote id, then
  /// remove it.
  pub fn confirm(&self, local_id: &str, remote_id: &str) {
    if let Err(e) = self.storage.set_remote_id(local_id, remote_id) {
      warn!(local_id, error = %e, "Failed to store remote id");
    }
    if self.remove(local_id) {
      info!(local_id, remote_id, "Queued record confirmed");
    }
  }
}
