use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::queue::{new_local_id, OfflineQueue, QueueStorage, RecordKind};
use crate::remote::{upsert_with_timeout, RemoteStore};

/// Where a submitted record ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
  /// Written to the remote store right away
  Persisted { local_id: String, remote_id: String },
  /// Queued for a later drain
  Queued { local_id: String },
  /// Neither written nor queued (local storage unavailable)
  Dropped { local_id: String },
}

/// Write-through entry point for new workouts and programs.
pub struct Outbox<S: QueueStorage, R: RemoteStore> {
  queue: OfflineQueue<S>,
  remote: Arc<R>,
  config: SyncConfig,
}

impl<S: QueueStorage, R: RemoteStore> Clone for Outbox<S, R> {
  fn clone(&self) -> Self {
    Self {
      queue: self.queue.clone(),
      remote: Arc::clone(&self.remote),
      config: self.config.clone(),
    }
  }
}

impl<S: QueueStorage, R: RemoteStore> Outbox<S, R> {
  pub fn new(queue: OfflineQueue<S>, remote: Arc<R>, config: SyncConfig) -> Self {
    Self {
      queue,
      remote,
      config,
    }
  }

  /// Try the remote write; queue the record under the same id if it fails.
  ///
  /// The local id doubles as the remote client id, so a write that landed
  /// despite a lost response is updated, not duplicated, by the later drain.
  pub async fn submit(&self, kind: RecordKind, payload: Value) -> SubmitOutcome {
    let local_id = new_local_id();
    let timeout = self.config.network_timeout();

    let error = match upsert_with_timeout(self.remote.as_ref(), kind, &local_id, &payload, timeout).await {
      Ok(remote_id) => {
        info!(local_id = %local_id, remote_id = %remote_id, %kind, "Record persisted");
        return SubmitOutcome::Persisted { local_id, remote_id };
      }
      Err(e) => e,
    };

    warn!(local_id = %local_id, %kind, error = %error, "Remote write failed, queueing record");
    if !self.queue.enqueue_with_id(&local_id, kind, &payload) {
      return SubmitOutcome::Dropped { local_id };
    }
    if error.is_permanent() {
      self
        .queue
        .record_failure(&local_id, 0, &error, self.config.max_attempts);
    }
    SubmitOutcome::Queued { local_id }
  }
}
