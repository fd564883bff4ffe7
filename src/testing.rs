//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::http::{Outbound, Response};
use crate::transport::{Transport, TransportError};

pub const API_BASE: &str = "https://api.example.com/rest/v1/";

pub fn config() -> Config {
  let mut config = Config::new(Url::parse(API_BASE).unwrap());
  config.network_timeout_ms = 200;
  config
}

pub fn api(path: &str) -> Url {
  Url::parse(API_BASE).unwrap().join(path).unwrap()
}

/// Scripted transport that records everything it is asked to send.
///
/// Unless told otherwise it answers 200 with an empty JSON object. While
/// "offline" every request fails with a connect error.
pub struct FakeTransport {
  online: AtomicBool,
  sent: Mutex<Vec<Outbound>>,
  responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
  failing: Mutex<HashMap<String, usize>>,
  delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      sent: Mutex::new(Vec::new()),
      responses: Mutex::new(HashMap::new()),
      failing: Mutex::new(HashMap::new()),
      delay: Mutex::new(None),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Answer requests to `url` with this status and body.
  pub fn respond(&self, url: &Url, status: u16, body: &[u8]) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), (status, body.to_vec()));
  }

  /// Fail the next `times` requests to `url` with a connect error.
  pub fn fail(&self, url: &Url, times: usize) {
    self.failing.lock().unwrap().insert(url.to_string(), times);
  }

  /// Delay every response, to exercise timeouts.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn sent(&self) -> Vec<Outbound> {
    self.sent.lock().unwrap().clone()
  }

  pub fn sent_count(&self) -> usize {
    self.sent.lock().unwrap().len()
  }

  pub fn clear_sent(&self) {
    self.sent.lock().unwrap().clear();
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: &Outbound) -> Result<Response, TransportError> {
    self.sent.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(TransportError::Connect("network unreachable".to_string()));
    }

    let key = request.url.to_string();
    {
      let mut failing = self.failing.lock().unwrap();
      if let Some(remaining) = failing.get_mut(&key) {
        if *remaining > 0 {
          *remaining -= 1;
          return Err(TransportError::Connect("connection reset".to_string()));
        }
      }
    }

    let (status, body) = self
      .responses
      .lock()
      .unwrap()
      .get(&key)
      .cloned()
      .unwrap_or((200, b"{}".to_vec()));

    Ok(Response::new(
      status,
      vec![("content-type".to_string(), "application/json".to_string())],
      body,
    ))
  }
}
