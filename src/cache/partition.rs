//! A named cache partition of stored responses.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::key::RequestKey;
use crate::http::{Headers, Response, ResponseSource};
use crate::store::codec::hex_bytes;
use crate::store::{DurableStore, Record};

/// A stored snapshot of a prior read response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub request_key: String,
  pub status: u16,
  pub headers: Headers,
  #[serde(with = "hex_bytes")]
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(key: &RequestKey, response: &Response) -> Self {
    Self {
      request_key: key.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Whether the entry is younger than `ttl`.
  pub fn is_fresh(&self, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
      Ok(ttl) => Utc::now() - self.stored_at < ttl,
      Err(_) => true,
    }
  }

  pub fn into_response(self, source: ResponseSource) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
      source,
    }
  }
}

/// One cache partition. At most one entry per request key.
#[derive(Clone)]
pub struct CachePartition {
  store: Arc<dyn DurableStore>,
  name: String,
}

impl CachePartition {
  pub fn new(store: Arc<dyn DurableStore>, name: impl Into<String>) -> Self {
    Self {
      store,
      name: name.into(),
    }
  }

  /// Look up an entry. Entries that no longer decode are treated as misses.
  pub fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let record = match self.store.get(&self.name, key.as_str())? {
      Some(r) => r,
      None => return Ok(None),
    };

    match serde_json::from_slice(&record.value) {
      Ok(entry) => Ok(Some(entry)),
      Err(e) => {
        warn!(partition = %self.name, key = %key, error = %e, "Discarding undecodable cache entry");
        self.store.delete(&self.name, key.as_str())?;
        Ok(None)
      }
    }
  }

  pub fn put(&self, entry: &CacheEntry) -> Result<()> {
    let value =
      serde_json::to_vec(entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;
    let record = Record::new(entry.request_key.clone(), entry.stored_at.to_rfc3339(), value);
    self.store.put(&self.name, &record)
  }

  /// Store a response under `key`.
  pub fn store_response(&self, key: &RequestKey, response: &Response) -> Result<()> {
    self.put(&CacheEntry::from_response(key, response))
  }

  /// Evict every entry whose key starts with `prefix`.
  pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
    self.store.delete_prefix(&self.name, prefix)
  }

  pub fn len(&self) -> Result<usize> {
    self.store.count(&self.name)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}
