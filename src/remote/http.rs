use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::queue::RecordKind;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentBody<'a> {
  client_id: &'a str,
  data: &'a Value,
}

#[derive(Debug, Deserialize)]
struct DocumentRef {
  id: String,
}

/// REST client for the document store.
///
/// Layout: `GET {base}/{collection}?clientId=..` lists matching documents,
/// `POST {base}/{collection}` creates one, `PUT {base}/{collection}/{id}`
/// replaces one.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: Client,
  base_url: Url,
}

impl HttpRemoteStore {
  pub fn new(base_url: &str) -> Result<Self, RemoteError> {
    let mut base_url = Url::parse(base_url)
      .map_err(|e| RemoteError::InvalidResponse(format!("Invalid base URL {}: {}", base_url, e)))?;
    // Make joins append to the path instead of replacing its last segment
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = Client::builder()
      .build()
      .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  fn collection_url(&self, kind: RecordKind) -> Result<Url, RemoteError> {
    self
      .base_url
      .join(kind.collection())
      .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
  }

  fn document_url(&self, kind: RecordKind, remote_id: &str) -> Result<Url, RemoteError> {
    let mut url = self.collection_url(kind)?;
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::InvalidResponse("Base URL cannot have path segments".to_string()))?
      .push(remote_id);
    Ok(url)
  }

  /// Check if response is successful, returning an error with body if not.
  async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    if response.status().is_success() {
      Ok(response)
    } else {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      Err(RemoteError::from_status(status, &body))
    }
  }
}

fn network_error(e: reqwest::Error) -> RemoteError {
  RemoteError::Network(e.to_string())
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn find_by_client_id(
    &self,
    kind: RecordKind,
    client_id: &str,
  ) -> Result<Option<String>, RemoteError> {
    let mut url = self.collection_url(kind)?;
    url.query_pairs_mut().append_pair("clientId", client_id);

    let response = self
      .client
      .get(url)
      .header(header::ACCEPT, "application/json")
      .send()
      .await
      .map_err(network_error)?;
    let response = Self::check_response(response).await?;

    let documents: Vec<DocumentRef> = response
      .json()
      .await
      .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse query result: {}", e)))?;

    debug!(%kind, client_id, matches = documents.len(), "Queried remote store");
    Ok(documents.into_iter().next().map(|d| d.id))
  }

  async fn insert(
    &self,
    kind: RecordKind,
    client_id: &str,
    payload: &Value,
  ) -> Result<String, RemoteError> {
    let response = self
      .client
      .post(self.collection_url(kind)?)
      .json(&DocumentBody {
        client_id,
        data: payload,
      })
      .send()
      .await
      .map_err(network_error)?;
    let response = Self::check_response(response).await?;

    let created: DocumentRef = response
      .json()
      .await
      .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse insert result: {}", e)))?;
    Ok(created.id)
  }

  async fn update(
    &self,
    kind: RecordKind,
    remote_id: &str,
    client_id: &str,
    payload: &Value,
  ) -> Result<(), RemoteError> {
    let response = self
      .client
      .put(self.document_url(kind, remote_id)?)
      .json(&DocumentBody {
        client_id,
        data: payload,
      })
      .send()
      .await
      .map_err(network_error)?;
    Self::check_response(response).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_urls_append_to_base_path() {
    let store = HttpRemoteStore::new("https://store.example/v1/documents").unwrap();
    assert_eq!(
      store.collection_url(RecordKind::Workout).unwrap().as_str(),
      "https://store.example/v1/documents/workouts"
    );
    assert_eq!(
      store.document_url(RecordKind::Program, "doc 7").unwrap().as_str(),
      "https://store.example/v1/documents/programs/doc%207"
    );
  }

  #[test]
  fn test_invalid_base_url_rejected() {
    assert!(HttpRemoteStore::new("not a url").is_err());
  }
}
