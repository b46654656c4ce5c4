//! Outbound request/response types and the network seam used by the cache.

mod http;

pub use http::HttpNetwork;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Connection failed: {0}")]
  Connection(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

/// An outbound request as seen by the cache.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  /// Top-level page navigation (eligible for the shell fallback)
  pub navigation: bool,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      navigation: false,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      navigation: true,
      ..Self::get(url)
    }
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// A response body plus the metadata worth persisting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.set_header(name, value);
    self
  }

  /// Replace any existing header with the same (case-insensitive) name.
  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Performs real network fetches. Callers apply their own timeouts.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Run `fetch` with a deadline; an elapsed deadline aborts the request.
pub async fn fetch_with_timeout<N: Network + ?Sized>(
  network: &N,
  request: &Request,
  timeout: Duration,
) -> Result<Response, NetworkError> {
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(NetworkError::Timeout(timeout)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeNetwork;

  #[test]
  fn test_set_header_replaces_case_insensitively() {
    let mut response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    response.set_header("content-type", "text/html");
    assert_eq!(response.headers.len(), 1);
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
  }

  #[tokio::test]
  async fn test_timeout_turns_into_network_error() {
    let network = FakeNetwork::new().with_latency(Duration::from_millis(200));
    network.respond("http://app.test/slow", Response::new(200, "late"));

    let request = Request::get(Url::parse("http://app.test/slow").unwrap());
    let result = fetch_with_timeout(&network, &request, Duration::from_millis(20)).await;
    assert_eq!(result, Err(NetworkError::Timeout(Duration::from_millis(20))));
  }
}
