//! Remote document store seam.
//!
//! The store is an external CRUD API. Writes are made retry-safe by keying
//! every document with the client-generated local id and upserting on it.

mod http;

pub use http::HttpRemoteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::queue::RecordKind;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  #[error("Remote write timed out after {0:?}")]
  Timeout(Duration),

  #[error("Network error: {0}")]
  Network(String),

  #[error("Rejected by remote store ({status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("Remote store unavailable ({status}): {message}")]
  Unavailable { status: u16, message: String },

  #[error("Invalid response: {0}")]
  InvalidResponse(String),
}

impl RemoteError {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
  }

  pub fn from_status(status: u16, body: &str) -> Self {
    let message = Self::truncate_body(body);
    match status {
      408 | 429 | 500..=599 => RemoteError::Unavailable { status, message },
      400..=499 => RemoteError::Rejected { status, message },
      _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, message)),
    }
  }

  /// Retrying cannot succeed without changing the payload.
  pub fn is_permanent(&self) -> bool {
    matches!(self, RemoteError::Rejected { .. })
  }
}

/// Document-level access to the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
  /// Remote id of the document written for `client_id`, if any.
  async fn find_by_client_id(
    &self,
    kind: RecordKind,
    client_id: &str,
  ) -> Result<Option<String>, RemoteError>;

  /// Create a document, returning its remote id.
  async fn insert(&self, kind: RecordKind, client_id: &str, payload: &Value)
    -> Result<String, RemoteError>;

  /// Replace the document `remote_id`.
  async fn update(
    &self,
    kind: RecordKind,
    remote_id: &str,
    client_id: &str,
    payload: &Value,
  ) -> Result<(), RemoteError>;
}

/// Update the document keyed by `client_id` if it exists, create it otherwise.
///
/// A retry after a lost response finds the document the first attempt created
/// and updates it, so no duplicate appears.
pub async fn upsert<R: RemoteStore + ?Sized>(
  remote: &R,
  kind: RecordKind,
  client_id: &str,
  payload: &Value,
) -> Result<String, RemoteError> {
  match remote.find_by_client_id(kind, client_id).await? {
    Some(remote_id) => {
      remote.update(kind, &remote_id, client_id, payload).await?;
      Ok(remote_id)
    }
    None => remote.insert(kind, client_id, payload).await,
  }
}

/// `upsert` under a deadline; an elapsed deadline is `RemoteError::Timeout`.
pub async fn upsert_with_timeout<R: RemoteStore + ?Sized>(
  remote: &R,
  kind: RecordKind,
  client_id: &str,
  payload: &Value,
  timeout: Duration,
) -> Result<String, RemoteError> {
  match tokio::time::timeout(timeout, upsert(remote, kind, client_id, payload)).await {
    Ok(result) => result,
    Err(_) => Err(RemoteError::Timeout(timeout)),
  }
}
