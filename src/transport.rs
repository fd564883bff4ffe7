//! Network transport to the remote resource API.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::http::{Outbound, Response};

/// Errors that mean the request never produced an HTTP response.
#[derive(Debug, Error)]
pub enum TransportError {
  /// No response within the allowed time
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The remote host could not be reached
  #[error("connection failed: {0}")]
  Connect(String),

  /// The request could not be built or sent
  #[error("request failed: {0}")]
  Request(String),

  /// The response body could not be read
  #[error("failed to read response body: {0}")]
  Body(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      // reqwest does not report which limit fired
      Self::Timeout(Duration::ZERO)
    } else if err.is_connect() {
      Self::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
      Self::Body(err.to_string())
    } else {
      Self::Request(err.to_string())
    }
  }
}

/// Anything that can deliver an [`Outbound`] request and return the response.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Outbound) -> Result<Response, TransportError>;
}

/// Send through `transport`, giving up after `limit`.
pub async fn send_with_timeout(
  transport: &dyn Transport,
  request: &Outbound,
  limit: Duration,
) -> Result<Response, TransportError> {
  match tokio::time::timeout(limit, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(TransportError::Timeout(limit)),
  }
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(timeout: Duration, token: Option<String>) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Request(e.to_string()))?;

    Ok(Self { client, token })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Outbound) -> Result<Response, TransportError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let has_auth = request
      .headers
      .iter()
      .any(|(k, _)| k.eq_ignore_ascii_case("authorization"));
    if let (Some(token), false) = (&self.token, has_auth) {
      builder = builder.bearer_auth(token);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response::new(status, headers, body))
  }
}
