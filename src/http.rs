//! Request and response types passed between callers, the router and the
//! transport.

use futures::stream::{BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

pub use reqwest::Method;

/// Ordered header list. Names compare case-insensitively.
pub type Headers = Vec<(String, String)>;

/// Find a header value by case-insensitive name.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// How the caller issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// A full document load
  Navigate,
  /// Any programmatic request
  #[default]
  Fetch,
}

/// A request body. Stream bodies can be read exactly once.
#[derive(Default)]
pub enum Body {
  #[default]
  Empty,
  Bytes(Vec<u8>),
  Stream(BoxStream<'static, std::io::Result<Vec<u8>>>),
}

impl Body {
  /// Read the whole body into memory. `None` means there was no body.
  pub async fn capture(self) -> std::io::Result<Option<Vec<u8>>> {
    match self {
      Body::Empty => Ok(None),
      Body::Bytes(bytes) => Ok(Some(bytes)),
      Body::Stream(mut stream) => {
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
          buf.extend_from_slice(&chunk?);
        }
        Ok(Some(buf))
      }
    }
  }
}

impl std::fmt::Debug for Body {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Body::Empty => write!(f, "Empty"),
      Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
      Body::Stream(_) => write!(f, "Stream"),
    }
  }
}

/// A request as issued by the caller.
#[derive(Debug)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Body,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Body::Empty,
      mode: RequestMode::Fetch,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A document navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Body::Bytes(body.into());
    self
  }

  pub fn with_stream(mut self, stream: BoxStream<'static, std::io::Result<Vec<u8>>>) -> Self {
    self.body = Body::Stream(stream);
    self
  }

  /// Serialize `value` as the JSON body and set the content type.
  pub fn with_json<T: Serialize>(self, value: &T) -> serde_json::Result<Self> {
    let body = serde_json::to_vec(value)?;
    Ok(
      self
        .with_header("content-type", "application/json")
        .with_body(body),
    )
  }
}

/// A fully buffered request, ready to be sent (or re-sent) by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Outbound {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
    self.body = body;
    self
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the network
  Network,
  /// Served from cache without touching the network
  CacheFresh,
  /// Served from cache because the network could not be reached
  CacheStale,
  /// Synthesized because neither network nor cache could answer
  Offline,
  /// Synthesized acknowledgment for a write that was queued
  Queued,
}

/// A response returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  fn synthesized(status: u16, content_type: &str, body: Vec<u8>, source: ResponseSource) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), content_type.to_string())],
      body,
      source,
    }
  }

  /// 503 for a read that could be answered neither by network nor cache.
  /// Callers treat this as "no data", not as a failure.
  pub fn offline_read() -> Self {
    let body = serde_json::json!({ "error": "Offline", "offline": true });
    Self::synthesized(
      503,
      "application/json",
      body.to_string().into_bytes(),
      ResponseSource::Offline,
    )
  }

  /// 202 acknowledgment for a write that was queued for later replay.
  pub fn queued() -> Self {
    let body = serde_json::json!({ "success": true, "queued": true });
    Self::synthesized(
      202,
      "application/json",
      body.to_string().into_bytes(),
      ResponseSource::Queued,
    )
  }

  /// Last-resort document for a navigation with no network and no app shell.
  pub fn offline_document() -> Self {
    Self::synthesized(
      503,
      "text/html; charset=utf-8",
      OFFLINE_DOCUMENT.as_bytes().to_vec(),
      ResponseSource::Offline,
    )
  }

  /// Empty 503 for a static asset missing from cache while offline.
  pub fn unavailable() -> Self {
    Self {
      status: 503,
      headers: Vec::new(),
      body: Vec::new(),
      source: ResponseSource::Offline,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether this is the synthesized offline marker rather than real data.
  pub fn is_offline(&self) -> bool {
    self.source == ResponseSource::Offline
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    header(&self.headers, name)
  }

  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }
}

const OFFLINE_DOCUMENT: &str = "<!doctype html><html><head><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline yet.</p></body></html>";

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_capture_stream_body() {
    let chunks = vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())];
    let body = Body::Stream(futures::stream::iter(chunks).boxed());
    assert_eq!(body.capture().await.unwrap(), Some(b"abcd".to_vec()));
    assert_eq!(Body::Empty.capture().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_capture_stream_error() {
    let chunks = vec![
      Ok(b"ab".to_vec()),
      Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
    ];
    let body = Body::Stream(futures::stream::iter(chunks).boxed());
    assert!(body.capture().await.is_err());
  }

  #[test]
  fn test_synthesized_bodies() {
    let offline: serde_json::Value = Response::offline_read().json().unwrap();
    assert_eq!(offline["offline"], true);
    assert_eq!(offline["error"], "Offline");

    let queued = Response::queued();
    assert_eq!(queued.status, 202);
    assert_eq!(queued.json::<serde_json::Value>().unwrap()["queued"], true);
    assert_eq!(queued.header("Content-Type"), Some("application/json"));
  }
}
