//! Test doubles for the network and the remote store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Config;
use crate::net::{Network, NetworkError, Request, Response};
use crate::db::{SqliteStorage, StorageError, StorageResult};
use crate::queue::{QueueStorage, QueuedRecord, RecordKind};
use crate::remote::{RemoteError, RemoteStore};

/// Config pointing at `http://app.test` with small budgets and short timeouts.
pub fn test_config() -> Config {
  let mut config = Config::default();
  config.app.origin = "http://app.test".to_string();
  config.app.static_assets = vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/static/*".to_string(),
  ];
  config.cache.dynamic_tier.max_entries = 10;
  config.cache.dynamic_tier.max_bytes = 1000;
  config.cache.static_tier.max_entries = 10;
  config.cache.static_tier.max_bytes = 1000;
  config.sync.record_delay_ms = 1;
  config.sync.network_timeout_ms = 100;
  config.worker.reply_timeout_ms = 2000;
  config
}

/// Scripted network: fixed responses per URL, optional latency, offline switch.
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
  offline: AtomicBool,
  latency: Duration,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      offline: AtomicBool::new(false),
      latency: Duration::ZERO,
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.responses.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn call_count(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Connection("network unreachable".to_string()));
    }

    let response = self.responses.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}

/// What the next write for a client id does.
#[derive(Debug, Clone)]
pub enum WriteBehavior {
  /// Fail without writing
  Fail(RemoteError),
  /// Write the document, then never answer
  LoseResponse,
  /// Never answer and never write
  Hang,
}

#[derive(Debug, Clone)]
struct Document {
  remote_id: String,
  kind: RecordKind,
  client_id: String,
  payload: Value,
}

/// In-memory document store with per-client-id failure scripts.
pub struct FakeRemote {
  documents: Mutex<Vec<Document>>,
  scripts: Mutex<HashMap<String, VecDeque<WriteBehavior>>>,
  /// Applies to the next write of any client id, ahead of the scripts
  next_write: Mutex<Option<WriteBehavior>>,
  /// Every call fails with this error while set
  failure: Mutex<Option<RemoteError>>,
  next_id: AtomicU64,
  writes: AtomicU64,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      documents: Mutex::new(Vec::new()),
      scripts: Mutex::new(HashMap::new()),
      next_write: Mutex::new(None),
      failure: Mutex::new(None),
      next_id: AtomicU64::new(1),
      writes: AtomicU64::new(0),
    }
  }

  /// Queue behaviors for the next writes of `client_id`; later writes succeed.
  pub fn script(&self, client_id: &str, behaviors: Vec<WriteBehavior>) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(client_id.to_string())
      .or_default()
      .extend(behaviors);
  }

  /// Make the next write land but never answer, whatever its client id.
  pub fn lose_next_response(&self) {
    *self.next_write.lock().unwrap() = Some(WriteBehavior::LoseResponse);
  }

  pub fn set_failure(&self, failure: Option<RemoteError>) {
    *self.failure.lock().unwrap() = failure;
  }

  fn check_failure(&self) -> Result<(), RemoteError> {
    match self.failure.lock().unwrap().clone() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  pub fn count_for(&self, client_id: &str) -> usize {
    self
      .documents
      .lock()
      .unwrap()
      .iter()
      .filter(|d| d.client_id == client_id)
      .count()
  }

  pub fn payload_for(&self, client_id: &str) -> Option<Value> {
    self
      .documents
      .lock()
      .unwrap()
      .iter()
      .find(|d| d.client_id == client_id)
      .map(|d| d.payload.clone())
  }

  pub fn document_count(&self) -> usize {
    self.documents.lock().unwrap().len()
  }

  /// Number of insert/update calls, including failed ones.
  pub fn write_count(&self) -> u64 {
    self.writes.load(Ordering::SeqCst)
  }

  fn next_behavior(&self, client_id: &str) -> Option<WriteBehavior> {
    if let Some(behavior) = self.next_write.lock().unwrap().take() {
      return Some(behavior);
    }
    self
      .scripts
      .lock()
      .unwrap()
      .get_mut(client_id)
      .and_then(|q| q.pop_front())
  }

  /// Apply the scripted behavior around `write`.
  async fn scripted_write<T>(
    &self,
    client_id: &str,
    write: impl FnOnce() -> T,
  ) -> Result<T, RemoteError> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.check_failure()?;
    match self.next_behavior(client_id) {
      None => Ok(write()),
      Some(WriteBehavior::Fail(e)) => Err(e),
      Some(WriteBehavior::LoseResponse) => {
        write();
        std::future::pending::<()>().await;
        unreachable!()
      }
      Some(WriteBehavior::Hang) => {
        std::future::pending::<()>().await;
        unreachable!()
      }
    }
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn find_by_client_id(
    &self,
    kind: RecordKind,
    client_id: &str,
  ) -> Result<Option<String>, RemoteError> {
    self.check_failure()?;
    Ok(
      self
        .documents
        .lock()
        .unwrap()
        .iter()
        .find(|d| d.kind == kind && d.client_id == client_id)
        .map(|d| d.remote_id.clone()),
    )
  }

  async fn insert(
    &self,
    kind: RecordKind,
    client_id: &str,
    payload: &Value,
  ) -> Result<String, RemoteError> {
    self
      .scripted_write(client_id, || {
        let remote_id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.documents.lock().unwrap().push(Document {
          remote_id: remote_id.clone(),
          kind,
          client_id: client_id.to_string(),
          payload: payload.clone(),
        });
        remote_id
      })
      .await
  }

  async fn update(
    &self,
    _kind: RecordKind,
    remote_id: &str,
    client_id: &str,
    payload: &Value,
  ) -> Result<(), RemoteError> {
    self
      .scripted_write(client_id, || {
        if let Some(doc) = self
          .documents
          .lock()
          .unwrap()
          .iter_mut()
          .find(|d| d.remote_id == remote_id)
        {
          doc.payload = payload.clone();
        }
      })
      .await
  }
}

/// Queue storage on a disk with no space left: reads work, writes fail.
pub struct FullQueueStorage {
  inner: SqliteStorage,
}

impl FullQueueStorage {
  /// Wrap `inner`, keeping whatever it already holds.
  pub fn new(inner: SqliteStorage) -> Self {
    Self { inner }
  }
}

impl QueueStorage for FullQueueStorage {
  fn push(&self, _record: &QueuedRecord, _max_items: usize) -> StorageResult<Vec<String>> {
    Err(StorageError::Full)
  }
  fn records(&self) -> StorageResult<Vec<QueuedRecord>> {
    self.inner.records()
  }
  fn get(&self, local_id: &str) -> StorageResult<Option<QueuedRecord>> {
    self.inner.get(local_id)
  }
  fn delete(&self, local_id: &str) -> StorageResult<bool> {
    self.inner.delete(local_id)
  }
  fn count(&self) -> StorageResult<usize> {
    self.inner.count()
  }
  fn record_failure(&self, local_id: &str, attempts: u32, error: &str) -> StorageResult<()> {
    self.inner.record_failure(local_id, attempts, error)
  }
  fn set_remote_id(&self, local_id: &str, remote_id: &str) -> StorageResult<()> {
    self.inner.set_remote_id(local_id, remote_id)
  }
}
