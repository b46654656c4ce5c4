//! Background drain of the offline queue against the remote store.

mod outbox;

pub use outbox::{Outbox, SubmitOutcome};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::queue::{OfflineQueue, QueueStorage};
use crate::remote::{upsert_with_timeout, RemoteStore};

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  /// Connectivity came back
  Connectivity,
  /// Periodic background tick
  Periodic,
  /// Explicit user request; also retries exhausted records
  Manual,
}

impl fmt::Display for DrainTrigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DrainTrigger::Connectivity => write!(f, "connectivity"),
      DrainTrigger::Periodic => write!(f, "periodic"),
      DrainTrigger::Manual => write!(f, "manual"),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
  NothingToSync,
  /// Another drain was in progress; this trigger was dropped
  AlreadyRunning,
  Completed(SyncReport),
}

/// Holds the drain flag; clears it when dropped.
struct DrainGuard {
  flag: Arc<AtomicBool>,
}

impl DrainGuard {
  fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self {
        flag: Arc::clone(flag),
      })
  }
}

impl Drop for DrainGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

/// Drains queued writes in FIFO order, one at a time.
pub struct SyncCoordinator<S: QueueStorage, R: RemoteStore> {
  queue: OfflineQueue<S>,
  remote: Arc<R>,
  config: SyncConfig,
  running: Arc<AtomicBool>,
}

impl<S: QueueStorage, R: RemoteStore> Clone for SyncCoordinator<S, R> {
  fn clone(&self) -> Self {
    Self {
      queue: self.queue.clone(),
      remote: Arc::clone(&self.remote),
      config: self.config.clone(),
      running: Arc::clone(&self.running),
    }
  }
}

impl<S: QueueStorage, R: RemoteStore> SyncCoordinator<S, R> {
  pub fn new(queue: OfflineQueue<S>, remote: Arc<R>, config: SyncConfig) -> Self {
    Self {
      queue,
      remote,
      config,
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Push every pending record to the remote store.
  ///
  /// Successful records are removed; failed ones stay queued with their
  /// attempt count raised. Records that used up their attempts are only
  /// retried by a manual trigger. A drain that starts while another one is
  /// running returns `AlreadyRunning` without touching the queue.
  pub async fn drain(&self, trigger: DrainTrigger) -> SyncOutcome {
    let Some(_guard) = DrainGuard::acquire(&self.running) else {
      debug!(%trigger, "Drain already in progress, ignoring trigger");
      return SyncOutcome::AlreadyRunning;
    };

    let records = self.queue.list();
    if records.is_empty() {
      debug!(%trigger, "Nothing to sync");
      return SyncOutcome::NothingToSync;
    }

    info!(%trigger, pending = records.len(), "Draining offline queue");
    let max_attempts = self.config.max_attempts;
    let timeout = self.config.network_timeout();
    let mut report = SyncReport::default();
    let mut attempted = 0usize;

    for record in records {
      if record.is_exhausted(max_attempts) && trigger != DrainTrigger::Manual {
        debug!(local_id = %record.local_id, "Skipping exhausted record");
        report.failed += 1;
        continue;
      }

      if attempted > 0 {
        tokio::time::sleep(self.config.record_delay()).await;
      }
      attempted += 1;

      let result = upsert_with_timeout(
        self.remote.as_ref(),
        record.kind,
        &record.local_id,
        &record.payload,
        timeout,
      )
      .await;

      match result {
        Ok(remote_id) => {
          self.queue.confirm(&record.local_id, &remote_id);
          report.synced += 1;
        }
        Err(e) => {
          let attempts = self
            .queue
            .record_failure(&record.local_id, record.attempts, &e, max_attempts);
          warn!(
            local_id = %record.local_id,
            attempts,
            max_attempts,
            error = %e,
            "Failed to sync record"
          );
          report.failed += 1;
        }
      }
    }

    info!(%trigger, synced = report.synced, failed = report.failed, "Drain finished");
    SyncOutcome::Completed(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::SqliteStorage;
  use crate::queue::RecordKind;
  use crate::remote::RemoteError;
  use crate::testing::{test_config, FakeRemote, WriteBehavior};
  use serde_json::json;

  fn coordinator() -> (
    SyncCoordinator<SqliteStorage, FakeRemote>,
    OfflineQueue<SqliteStorage>,
    Arc<FakeRemote>,
  ) {
    let config = test_config();
    let queue = OfflineQueue::new(
      Arc::new(SqliteStorage::in_memory().unwrap()),
      config.sync.queue_max_items,
    );
    let remote = Arc::new(FakeRemote::new());
    let coordinator = SyncCoordinator::new(queue.clone(), Arc::clone(&remote), config.sync);
    (coordinator, queue, remote)
  }

  fn unavailable() -> WriteBehavior {
    WriteBehavior::Fail(RemoteError::from_status(503, "maintenance"))
  }

  #[tokio::test]
  async fn test_empty_queue_has_nothing_to_sync() {
    let (coordinator, _, _) = coordinator();
    assert_eq!(coordinator.drain(DrainTrigger::Manual).await, SyncOutcome::NothingToSync);
  }

  #[tokio::test]
  async fn test_all_writes_succeed() {
    let (coordinator, queue, remote) = coordinator();
    for n in 0..5 {
      queue.enqueue(RecordKind::Workout, &json!({ "n": n }));
    }

    let outcome = coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 5, failed: 0 }));
    assert_eq!(queue.count(), 0);
    assert_eq!(remote.document_count(), 5);
  }

  #[tokio::test]
  async fn test_one_success_one_timeout() {
    let (coordinator, queue, remote) = coordinator();
    queue.enqueue_with_id("a1", RecordKind::Workout, &json!({"name": "push"}));
    queue.enqueue_with_id("a2", RecordKind::Workout, &json!({"name": "pull"}));
    remote.script("a2", vec![WriteBehavior::Hang]);

    let outcome = coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 1, failed: 1 }));

    let pending = queue.list();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].local_id, "a2");
    assert_eq!(pending[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_lost_response_then_retry_creates_no_duplicate() {
    let (coordinator, queue, remote) = coordinator();
    queue.enqueue_with_id("a1", RecordKind::Program, &json!({"weeks": 4}));
    remote.script("a1", vec![WriteBehavior::LoseResponse]);

    let first = coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(first, SyncOutcome::Completed(SyncReport { synced: 0, failed: 1 }));
    assert_eq!(remote.count_for("a1"), 1);

    let second = coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(second, SyncOutcome::Completed(SyncReport { synced: 1, failed: 0 }));
    assert_eq!(remote.count_for("a1"), 1);
    assert_eq!(queue.count(), 0);
  }

  #[tokio::test]
  async fn test_record_failing_every_attempt_stays_queued() {
    let (coordinator, queue, remote) = coordinator();
    queue.enqueue_with_id("a1", RecordKind::Workout, &json!({}));
    remote.script("a1", vec![unavailable(), unavailable(), unavailable()]);

    for _ in 0..3 {
      let outcome = coordinator.drain(DrainTrigger::Periodic).await;
      assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 0, failed: 1 }));
    }
    assert_eq!(remote.write_count(), 3);

    // Exhausted: automatic drains count it as failed without a write
    let outcome = coordinator.drain(DrainTrigger::Periodic).await;
    assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 0, failed: 1 }));
    assert_eq!(remote.write_count(), 3);
    let record = queue.get("a1").unwrap();
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.unwrap().contains("503"));

    // The user's retry goes through
    let outcome = coordinator.drain(DrainTrigger::Manual).await;
    assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 1, failed: 0 }));
    assert_eq!(queue.count(), 0);
  }

  #[tokio::test]
  async fn test_permanent_rejection_is_parked() {
    let (coordinator, queue, remote) = coordinator();
    queue.enqueue_with_id("bad", RecordKind::Workout, &json!({"sets": -1}));
    queue.enqueue_with_id("good", RecordKind::Workout, &json!({"sets": 3}));
    remote.script(
      "bad",
      vec![WriteBehavior::Fail(RemoteError::from_status(422, "sets must be positive"))],
    );

    let outcome = coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(outcome, SyncOutcome::Completed(SyncReport { synced: 1, failed: 1 }));
    assert!(queue.get("bad").unwrap().is_exhausted(3));

    coordinator.drain(DrainTrigger::Connectivity).await;
    assert_eq!(remote.write_count(), 2);
  }

  #[tokio::test]
  async fn test_overlapping_drains_are_coalesced() {
    let (coordinator, queue, remote) = coordinator();
    queue.enqueue_with_id("a1", RecordKind::Workout, &json!({}));
    remote.script("a1", vec![WriteBehavior::Hang]);

    let (first, second) = tokio::join!(
      coordinator.drain(DrainTrigger::Connectivity),
      coordinator.drain(DrainTrigger::Manual)
    );
    assert_eq!(first, SyncOutcome::Completed(SyncReport { synced: 0, failed: 1 }));
    assert_eq!(second, SyncOutcome::AlreadyRunning);
    assert!(!coordinator.is_running());

    // The flag is released, so a later drain runs
    let third = coordinator.drain(DrainTrigger::Manual).await;
    assert_eq!(third, SyncOutcome::Completed(SyncReport { synced: 1, failed: 0 }));
  }
}
