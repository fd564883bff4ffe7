//! Local durable store: a partitioned key-value layer underneath the mutation
//! queue and the response caches.
//!
//! Every partition ("table") holds records with a primary key, a secondary
//! ordering key and an opaque value. Each operation runs in its own
//! transaction, so callers never need extra locking around a partition.

pub(crate) mod codec;
mod sqlite;

use color_eyre::Result;

pub use sqlite::SqliteStore;

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  /// Primary key, unique within the partition
  pub key: String,
  /// Secondary key used for ordered scans
  pub index: String,
  /// Serialized payload
  pub value: Vec<u8>,
}

impl Record {
  pub fn new(key: impl Into<String>, index: impl Into<String>, value: Vec<u8>) -> Self {
    Self {
      key: key.into(),
      index: index.into(),
      value,
    }
  }
}

/// Trait for durable storage backends.
pub trait DurableStore: Send + Sync {
  /// Get a record by primary key.
  fn get(&self, partition: &str, key: &str) -> Result<Option<Record>>;

  /// Insert or overwrite a record. Overwriting keeps the record's original
  /// insertion position for ties in `scan_by_index`.
  fn put(&self, partition: &str, record: &Record) -> Result<()>;

  /// Delete a record. Returns whether anything was deleted.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;

  /// Delete every record whose key starts with `prefix`.
  fn delete_prefix(&self, partition: &str, prefix: &str) -> Result<usize>;

  /// All records of a partition ordered by secondary key, then insertion order.
  fn scan_by_index(&self, partition: &str) -> Result<Vec<Record>>;

  /// Atomically delete `key` from `from` and write `record` into `to`.
  fn transfer(&self, from: &str, key: &str, to: &str, record: &Record) -> Result<()>;

  /// Number of records in a partition.
  fn count(&self, partition: &str) -> Result<usize>;

  /// Names of all partitions that currently hold at least one record.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a whole partition. Returns the number of records removed.
  fn drop_partition(&self, partition: &str) -> Result<usize>;
}
