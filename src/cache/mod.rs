//! Response caches for offline reads.
//!
//! Two independent partitions live in the durable store:
//! - resource data (`cache-data`): API reads, evicted by the invalidation policy
//! - static assets (`cache-static-<version>`): replaced wholesale on a version bump

mod key;
mod partition;

use color_eyre::Result;
use tracing::info;

pub use key::{url_prefix, RequestKey};
pub use partition::{CacheEntry, CachePartition};

use crate::config::STATIC_PARTITION_PREFIX;
use crate::store::DurableStore;

/// Partition holding cached resource API reads.
pub const DATA_PARTITION: &str = "cache-data";

/// Delete every static partition except `current`. Returns the names dropped.
pub fn purge_outdated_static(store: &dyn DurableStore, current: &str) -> Result<Vec<String>> {
  let mut dropped = Vec::new();

  for name in store.partitions()? {
    if name.starts_with(STATIC_PARTITION_PREFIX) && name != current {
      let removed = store.drop_partition(&name)?;
      info!(partition = %name, entries = removed, "Dropped outdated static cache");
      dropped.push(name);
    }
  }

  Ok(dropped)
}
