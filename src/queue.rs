//! Durable FIFO of writes waiting to reach the resource API.
//!
//! Entries are appended by the router when a write cannot be delivered and
//! removed by the coordinator once a replay succeeds. Nothing is ever
//! reordered: the only in-place change is the retry counter.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use crate::http::{Headers, Method, Outbound};
use crate::store::codec::opt_hex_bytes;
use crate::store::{DurableStore, Record};

pub const QUEUE_PARTITION: &str = "mutation-queue";
pub const DEAD_LETTER_PARTITION: &str = "mutation-dead-letter";

/// What a queued write does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  /// Kind for a mutating method; `None` for safe methods.
  pub fn from_method(method: &Method) -> Option<Self> {
    if *method == Method::POST {
      Some(Self::Create)
    } else if *method == Method::PUT || *method == Method::PATCH {
      Some(Self::Update)
    } else if *method == Method::DELETE {
      Some(Self::Delete)
    } else {
      None
    }
  }
}

impl std::fmt::Display for MutationKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Create => write!(f, "create"),
      Self::Update => write!(f, "update"),
      Self::Delete => write!(f, "delete"),
    }
  }
}

/// A pending write awaiting remote application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
  /// Assigned on enqueue when empty
  pub id: String,
  pub kind: MutationKind,
  pub method: String,
  pub url: Url,
  /// Target path relative to the API base, without query
  pub resource_path: String,
  /// Captured request body; `None` when there was none or it was unreadable
  #[serde(with = "opt_hex_bytes")]
  pub payload: Option<Vec<u8>>,
  pub headers: Headers,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueuedMutation {
  pub fn new(kind: MutationKind, method: &Method, url: Url, resource_path: impl Into<String>) -> Self {
    Self {
      id: String::new(),
      kind,
      method: method.as_str().to_string(),
      url,
      resource_path: resource_path.into(),
      payload: None,
      headers: Vec::new(),
      enqueued_at: Utc::now(),
      retry_count: 0,
    }
  }

  pub fn with_payload(mut self, payload: Option<Vec<u8>>) -> Self {
    self.payload = payload;
    self
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers = headers;
    self
  }

  /// The request to send when replaying this mutation.
  pub fn to_outbound(&self) -> Result<Outbound> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {} in mutation {}: {}", self.method, self.id, e))?;

    Ok(
      Outbound::new(method, self.url.clone())
        .with_headers(self.headers.clone())
        .with_body(self.payload.clone()),
    )
  }

  fn to_record(&self) -> Result<Record> {
    let value =
      serde_json::to_vec(self).map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;
    Ok(Record::new(self.id.clone(), order_stamp(&self.enqueued_at), value))
  }
}

/// A mutation that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub mutation: QueuedMutation,
  pub dropped_at: DateTime<Utc>,
  pub last_error: String,
}

/// Result of recording a failed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
  /// Still queued; will be retried on the next drain
  Retrying { retry_count: u32 },
  /// Retry cap reached; moved to the dead-letter partition
  DeadLettered,
  /// No such entry
  Missing,
}

/// The persistent mutation queue.
#[derive(Clone)]
pub struct MutationQueue {
  store: Arc<dyn DurableStore>,
  max_retries: u32,
}

impl MutationQueue {
  pub fn new(store: Arc<dyn DurableStore>, max_retries: u32) -> Self {
    Self { store, max_retries }
  }

  /// Append a mutation. Once this returns, the mutation is on disk.
  pub fn enqueue(&self, mut mutation: QueuedMutation) -> Result<QueuedMutation> {
    if mutation.id.is_empty() {
      mutation.id = new_id(&mutation.enqueued_at);
    }
    mutation.retry_count = 0;

    self.store.put(QUEUE_PARTITION, &mutation.to_record()?)?;

    info!(
      id = %mutation.id,
      kind = %mutation.kind,
      path = %mutation.resource_path,
      "Queued mutation"
    );
    Ok(mutation)
  }

  /// All queued mutations, oldest first.
  pub fn list_pending(&self) -> Result<Vec<QueuedMutation>> {
    self
      .store
      .scan_by_index(QUEUE_PARTITION)?
      .into_iter()
      .map(|record| {
        serde_json::from_slice(&record.value)
          .map_err(|e| eyre!("Corrupt queue entry {}: {}", record.key, e))
      })
      .collect()
  }

  pub fn get(&self, id: &str) -> Result<Option<QueuedMutation>> {
    match self.store.get(QUEUE_PARTITION, id)? {
      Some(record) => serde_json::from_slice(&record.value)
        .map(Some)
        .map_err(|e| eyre!("Corrupt queue entry {}: {}", id, e)),
      None => Ok(None),
    }
  }

  /// Delete an entry after its replay succeeded.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self.store.delete(QUEUE_PARTITION, id)?;
    debug!(id, removed, "Removed mutation from queue");
    Ok(removed)
  }

  /// Record a failed replay. Once `max_retries` failures have accumulated the
  /// entry leaves the queue for the dead-letter partition.
  pub fn bump_retry(&self, id: &str, last_error: &str) -> Result<RetryOutcome> {
    let mut mutation = match self.get(id)? {
      Some(m) => m,
      None => return Ok(RetryOutcome::Missing),
    };

    mutation.retry_count += 1;

    if mutation.retry_count >= self.max_retries {
      let letter = DeadLetter {
        mutation,
        dropped_at: Utc::now(),
        last_error: last_error.to_string(),
      };
      let value = serde_json::to_vec(&letter)
        .map_err(|e| eyre!("Failed to serialize dead letter: {}", e))?;
      let record = Record::new(id, order_stamp(&letter.dropped_at), value);
      self
        .store
        .transfer(QUEUE_PARTITION, id, DEAD_LETTER_PARTITION, &record)?;

      error!(
        id,
        kind = %letter.mutation.kind,
        path = %letter.mutation.resource_path,
        attempts = letter.mutation.retry_count,
        error = last_error,
        "Dropped mutation after exhausting retries"
      );
      return Ok(RetryOutcome::DeadLettered);
    }

    self.store.put(QUEUE_PARTITION, &mutation.to_record()?)?;
    debug!(id, retry_count = mutation.retry_count, "Replay failed, will retry");

    Ok(RetryOutcome::Retrying {
      retry_count: mutation.retry_count,
    })
  }

  pub fn len(&self) -> Result<usize> {
    self.store.count(QUEUE_PARTITION)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Mutations dropped after exhausting retries, oldest drop first.
  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    self
      .store
      .scan_by_index(DEAD_LETTER_PARTITION)?
      .into_iter()
      .map(|record| {
        serde_json::from_slice(&record.value)
          .map_err(|e| eyre!("Corrupt dead letter {}: {}", record.key, e))
      })
      .collect()
  }

  pub fn purge_dead_letters(&self) -> Result<usize> {
    self.store.drop_partition(DEAD_LETTER_PARTITION)
  }

  /// Put a dead letter back at the tail of the queue with a fresh retry budget.
  pub fn revive(&self, id: &str) -> Result<Option<QueuedMutation>> {
    let record = match self.store.get(DEAD_LETTER_PARTITION, id)? {
      Some(r) => r,
      None => return Ok(None),
    };
    let letter: DeadLetter = serde_json::from_slice(&record.value)
      .map_err(|e| eyre!("Corrupt dead letter {}: {}", id, e))?;

    let mut mutation = letter.mutation;
    mutation.retry_count = 0;
    mutation.enqueued_at = Utc::now();

    self
      .store
      .transfer(DEAD_LETTER_PARTITION, id, QUEUE_PARTITION, &mutation.to_record()?)?;

    info!(id, "Revived dead-lettered mutation");
    Ok(Some(mutation))
  }
}

/// Fixed-width UTC timestamp, so string order is time order.
fn order_stamp(at: &DateTime<Utc>) -> String {
  at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Creation timestamp plus a random suffix.
fn new_id(at: &DateTime<Utc>) -> String {
  let suffix = Uuid::new_v4().simple().to_string();
  format!("{}-{}", at.timestamp_micros(), &suffix[..12])
}
