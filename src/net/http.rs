use async_trait::async_trait;
use reqwest::{Client, Method};

use super::{Network, NetworkError, Request, Response};

/// Network implementation backed by reqwest.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self, NetworkError> {
    let client = Client::builder()
      .build()
      .map_err(|e| NetworkError::Connection(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| NetworkError::Connection(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Connection(format!("Failed to read body: {}", e)))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
