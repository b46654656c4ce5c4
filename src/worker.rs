//! Background worker and the request/response protocol used to talk to it.
//!
//! The worker owns the cache manager, the offline queue and the sync
//! coordinator. Foreground callers hold a `WorkerHandle`; every request
//! carries its own reply channel and a correlation id for logging.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheResult, CacheStorage, TierUsage};
use crate::connectivity::ConnectivityEvent;
use crate::net::{Network, Request};
use crate::queue::{OfflineQueue, QueueStorage, QueuedRecord, RecordKind};
use crate::remote::RemoteStore;
use crate::sync::{DrainTrigger, Outbox, SubmitOutcome, SyncCoordinator, SyncOutcome};

/// Capacity of the request channel
const REQUEST_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub enum WorkerRequest {
  ListQueue,
  RemoveQueued { local_id: String },
  QueueCount,
  /// Drain now, retrying exhausted records
  ForceSync,
  CheckQuota,
  Cleanup,
  ClearCache,
  Precache,
  Submit { kind: RecordKind, payload: Value },
  Fetch { request: Request },
}

#[derive(Debug, Clone)]
pub enum WorkerResponse {
  Queue(Vec<QueuedRecord>),
  Removed(bool),
  Count(usize),
  Sync(SyncOutcome),
  Quota(QuotaReport),
  CleanedUp { removed: usize },
  Cleared { removed: usize },
  Precached { cached: usize },
  Submitted(SubmitOutcome),
  Fetched(CacheResult),
}

/// Storage usage as reported to the foreground.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaReport {
  pub tiers: Vec<TierUsage>,
  pub queue_length: usize,
  /// Cached bytes over the sum of the tier byte budgets
  pub usage_ratio: f64,
  /// Entries removed by the automatic cleanup, when one ran
  pub cleaned_up: Option<usize>,
}

/// A request in flight to the worker.
pub struct Envelope {
  pub id: u64,
  pub request: WorkerRequest,
  pub reply: oneshot::Sender<WorkerResponse>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
  #[error("Worker is not running")]
  Closed,

  #[error("No reply from worker within {0:?}")]
  Timeout(Duration),
}

/// Foreground side of the worker channel.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<Envelope>,
  next_id: Arc<AtomicU64>,
  reply_timeout: Duration,
}

impl WorkerHandle {
  /// Create a handle and the receiver the worker reads from.
  pub fn channel(reply_timeout: Duration) -> (Self, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    let handle = Self {
      tx,
      next_id: Arc::new(AtomicU64::new(1)),
      reply_timeout,
    };
    (handle, rx)
  }

  /// Send a request and wait for its reply under the configured timeout.
  pub async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
    self.call_with_timeout(request, self.reply_timeout).await
  }

  pub async fn call_with_timeout(
    &self,
    request: WorkerRequest,
    timeout: Duration,
  ) -> Result<WorkerResponse, WorkerError> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (reply, rx) = oneshot::channel();

    let exchange = async {
      self
        .tx
        .send(Envelope { id, request, reply })
        .await
        .map_err(|_| WorkerError::Closed)?;
      rx.await.map_err(|_| WorkerError::Closed)
    };

    match tokio::time::timeout(timeout, exchange).await {
      Ok(result) => result,
      Err(_) => {
        warn!(id, ?timeout, "Worker reply timed out");
        Err(WorkerError::Timeout(timeout))
      }
    }
  }
}

/// Everything a request handler needs. Handlers never fail; errors are
/// logged inside the services and show up as empty or zero results.
pub struct Services<S, N, R>
where
  S: CacheStorage + QueueStorage + 'static,
  N: Network,
  R: RemoteStore,
{
  pub cache: CacheManager<S, N>,
  pub queue: OfflineQueue<S>,
  pub coordinator: SyncCoordinator<S, R>,
  pub outbox: Outbox<S, R>,
}

impl<S, N, R> Clone for Services<S, N, R>
where
  S: CacheStorage + QueueStorage + 'static,
  N: Network,
  R: RemoteStore,
{
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      coordinator: self.coordinator.clone(),
      outbox: self.outbox.clone(),
    }
  }
}

impl<S, N, R> Services<S, N, R>
where
  S: CacheStorage + QueueStorage + 'static,
  N: Network,
  R: RemoteStore,
{
  pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
    match request {
      WorkerRequest::ListQueue => WorkerResponse::Queue(self.queue.list()),
      WorkerRequest::RemoveQueued { local_id } => WorkerResponse::Removed(self.queue.remove(&local_id)),
      WorkerRequest::QueueCount => WorkerResponse::Count(self.queue.count()),
      WorkerRequest::ForceSync => WorkerResponse::Sync(self.coordinator.drain(DrainTrigger::Manual).await),
      WorkerRequest::CheckQuota => WorkerResponse::Quota(self.check_quota()),
      WorkerRequest::Cleanup => WorkerResponse::CleanedUp {
        removed: self.cache.cleanup(),
      },
      WorkerRequest::ClearCache => WorkerResponse::Cleared {
        removed: self.cache.clear(),
      },
      WorkerRequest::Precache => WorkerResponse::Precached {
        cached: self.cache.precache().await,
      },
      WorkerRequest::Submit { kind, payload } => {
        WorkerResponse::Submitted(self.outbox.submit(kind, payload).await)
      }
      WorkerRequest::Fetch { request } => WorkerResponse::Fetched(self.cache.handle(request).await),
    }
  }

  /// Report usage, cleaning up first when over the cleanup threshold.
  fn check_quota(&self) -> QuotaReport {
    let mut tiers = self.cache.usage();
    let mut usage_ratio = CacheManager::<S, N>::usage_ratio(&tiers);
    let mut cleaned_up = None;

    if usage_ratio > self.cache.quota_cleanup_ratio() {
      info!(usage_ratio, "Cache usage above threshold, cleaning up");
      cleaned_up = Some(self.cache.cleanup());
      tiers = self.cache.usage();
      usage_ratio = CacheManager::<S, N>::usage_ratio(&tiers);
    }

    QuotaReport {
      tiers,
      queue_length: self.queue.count(),
      usage_ratio,
      cleaned_up,
    }
  }
}

/// Event loop over requests, connectivity changes and the periodic sync tick.
pub struct Worker<S, N, R>
where
  S: CacheStorage + QueueStorage + 'static,
  N: Network,
  R: RemoteStore,
{
  services: Services<S, N, R>,
  sync_interval: Duration,
}

impl<S, N, R> Worker<S, N, R>
where
  S: CacheStorage + QueueStorage + 'static,
  N: Network,
  R: RemoteStore,
{
  pub fn new(services: Services<S, N, R>, sync_interval: Duration) -> Self {
    Self {
      services,
      sync_interval,
    }
  }

  /// Drop caches of other versions and fetch the static assets.
  pub async fn install(&self) {
    self.services.cache.activate();
    self.services.cache.precache().await;
  }

  /// Run until `shutdown` resolves or every `WorkerHandle` is dropped.
  pub async fn run(
    self,
    mut requests: mpsc::Receiver<Envelope>,
    mut connectivity: mpsc::UnboundedReceiver<ConnectivityEvent>,
    shutdown: impl Future<Output = ()>,
  ) {
    let mut ticker = tokio::time::interval(self.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; startup drains come from connectivity
    ticker.tick().await;
    tokio::pin!(shutdown);

    info!("Worker started");
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("Worker shutting down");
          break;
        }
        envelope = requests.recv() => match envelope {
          Some(envelope) => self.dispatch(envelope),
          None => {
            debug!("All worker handles dropped");
            break;
          }
        },
        Some(event) = connectivity.recv() => match event {
          ConnectivityEvent::Restored => self.spawn_drain(DrainTrigger::Connectivity),
          ConnectivityEvent::Lost => info!("Offline, writes will be queued"),
        },
        _ = ticker.tick() => self.spawn_drain(DrainTrigger::Periodic),
      }
    }
    self.services.cache.flush().await;
  }

  fn dispatch(&self, envelope: Envelope) {
    let Envelope { id, request, reply } = envelope;
    debug!(id, ?request, "Worker request");
    let services = self.services.clone();

    tokio::spawn(async move {
      let response = services.handle(request).await;
      if reply.send(response).is_err() {
        debug!(id, "Caller stopped waiting for reply");
      }
    });
  }

  fn spawn_drain(&self, trigger: DrainTrigger) {
    if self.services.coordinator.is_running() {
      debug!(%trigger, "Drain already in progress");
      return;
    }
    let coordinator = self.services.coordinator.clone();
    tokio::spawn(async move {
      coordinator.drain(trigger).await;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use crate::db::SqliteStorage;
  use crate::net::Response;
  use crate::remote::RemoteError;
  use crate::testing::{test_config, FakeNetwork, FakeRemote};
  use serde_json::json;
  use url::Url;

  struct Harness {
    handle: WorkerHandle,
    events: mpsc::UnboundedSender<ConnectivityEvent>,
    network: Arc<FakeNetwork>,
    remote: Arc<FakeRemote>,
  }

  fn start() -> Harness {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let remote = Arc::new(FakeRemote::new());

    let queue = OfflineQueue::new(Arc::clone(&storage), config.sync.queue_max_items);
    let services = Services {
      cache: CacheManager::new(
        Arc::clone(&storage),
        Arc::clone(&network),
        &config.app,
        config.cache.clone(),
        config.sync.network_timeout(),
      )
      .unwrap(),
      queue: queue.clone(),
      coordinator: SyncCoordinator::new(queue.clone(), Arc::clone(&remote), config.sync.clone()),
      outbox: Outbox::new(queue, Arc::clone(&remote), config.sync.clone()),
    };

    let (handle, requests) = WorkerHandle::channel(config.worker.reply_timeout());
    let (events, connectivity) = mpsc::unbounded_channel();
    let worker = Worker::new(services, Duration::from_secs(3600));
    tokio::spawn(worker.run(requests, connectivity, std::future::pending()));

    Harness {
      handle,
      events,
      network,
      remote,
    }
  }

  async fn count(handle: &WorkerHandle) -> usize {
    match handle.call(WorkerRequest::QueueCount).await.unwrap() {
      WorkerResponse::Count(n) => n,
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_submit_then_list_and_remove() {
    let h = start();
    h.remote.set_failure(Some(RemoteError::Network("offline".to_string())));

    let submitted = h
      .handle
      .call(WorkerRequest::Submit {
        kind: RecordKind::Workout,
        payload: json!({"name": "squat"}),
      })
      .await
      .unwrap();
    let local_id = match submitted {
      WorkerResponse::Submitted(SubmitOutcome::Queued { local_id }) => local_id,
      other => panic!("unexpected {:?}", other),
    };

    match h.handle.call(WorkerRequest::ListQueue).await.unwrap() {
      WorkerResponse::Queue(records) => {
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].local_id, local_id);
      }
      other => panic!("unexpected {:?}", other),
    }

    let removed = h
      .handle
      .call(WorkerRequest::RemoveQueued { local_id })
      .await
      .unwrap();
    assert!(matches!(removed, WorkerResponse::Removed(true)));
    assert_eq!(count(&h.handle).await, 0);
  }

  #[tokio::test]
  async fn test_force_sync_drains_queue() {
    let h = start();
    h.remote.set_failure(Some(RemoteError::Network("offline".to_string())));
    for n in 0..2 {
      h.handle
        .call(WorkerRequest::Submit {
          kind: RecordKind::Program,
          payload: json!({ "n": n }),
        })
        .await
        .unwrap();
    }
    h.remote.set_failure(None);

    match h.handle.call(WorkerRequest::ForceSync).await.unwrap() {
      WorkerResponse::Sync(outcome) => {
        assert_eq!(outcome, SyncOutcome::Completed(crate::sync::SyncReport { synced: 2, failed: 0 }))
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.remote.document_count(), 2);
  }

  #[tokio::test]
  async fn test_connectivity_restored_triggers_drain() {
    let h = start();
    h.remote.set_failure(Some(RemoteError::Network("offline".to_string())));
    h.handle
      .call(WorkerRequest::Submit {
        kind: RecordKind::Workout,
        payload: json!({}),
      })
      .await
      .unwrap();
    h.remote.set_failure(None);

    h.events.send(ConnectivityEvent::Restored).unwrap();
    let mut drained = false;
    for _ in 0..100 {
      if count(&h.handle).await == 0 {
        drained = true;
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "queue was not drained after reconnect");
  }

  #[tokio::test]
  async fn test_fetch_goes_through_cache_manager() {
    let h = start();
    h.network.respond("http://app.test/api/stats", Response::new(200, "{}"));
    let request = Request::get(Url::parse("http://app.test/api/stats").unwrap());

    match h.handle.call(WorkerRequest::Fetch { request }).await.unwrap() {
      WorkerResponse::Fetched(result) => assert_eq!(result.source, ResponseSource::Network),
      other => panic!("unexpected {:?}", other),
    }

    match h.handle.call(WorkerRequest::CheckQuota).await.unwrap() {
      WorkerResponse::Quota(report) => {
        assert_eq!(report.tiers.len(), 2);
        assert_eq!(report.tiers[1].entries, 1);
        assert_eq!(report.cleaned_up, None);
      }
      other => panic!("unexpected {:?}", other),
    }

    match h.handle.call(WorkerRequest::ClearCache).await.unwrap() {
      WorkerResponse::Cleared { removed } => assert_eq!(removed, 1),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_quota_above_threshold_runs_cleanup() {
    let h = start();
    // Both tiers exactly at their 1000 byte budgets: ratio 1.0
    for path in ["/", "/index.html"] {
      let url = format!("http://app.test{}", path);
      h.network.respond(&url, Response::new(200, vec![b'x'; 500]));
    }
    match h.handle.call(WorkerRequest::Precache).await.unwrap() {
      WorkerResponse::Precached { cached } => assert_eq!(cached, 2),
      other => panic!("unexpected {:?}", other),
    }
    h.network.respond("http://app.test/api/big", Response::new(200, vec![b'y'; 1000]));
    let request = Request::get(Url::parse("http://app.test/api/big").unwrap());
    h.handle.call(WorkerRequest::Fetch { request }).await.unwrap();

    match h.handle.call(WorkerRequest::CheckQuota).await.unwrap() {
      WorkerResponse::Quota(report) => {
        // Nothing is stale or over budget, so the cleanup finds nothing to drop
        assert_eq!(report.cleaned_up, Some(0));
        assert!((report.usage_ratio - 1.0).abs() < f64::EPSILON);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_call_times_out_without_worker_reply() {
    let (handle, _requests) = WorkerHandle::channel(Duration::from_millis(20));
    let result = handle.call(WorkerRequest::QueueCount).await;
    assert_eq!(result.unwrap_err(), WorkerError::Timeout(Duration::from_millis(20)));
  }

  #[tokio::test]
  async fn test_call_fails_when_worker_is_gone() {
    let (handle, requests) = WorkerHandle::channel(Duration::from_millis(20));
    drop(requests);
    let result = handle.call(WorkerRequest::QueueCount).await;
    assert_eq!(result.unwrap_err(), WorkerError::Closed);
  }
}
