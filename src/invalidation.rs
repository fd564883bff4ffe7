//! Maps a successful mutation to the cached reads it may have made stale.
//!
//! Invalidation works on resource families (the first path segment below the
//! API base), not on single records: a write to `checklists/123` evicts every
//! cached read under `checklists`, plus any configured related families.

use color_eyre::Result;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use crate::cache::{url_prefix, CachePartition};
use crate::http::Method;

#[derive(Debug, Clone)]
pub struct InvalidationPolicy {
  api_base: Url,
  related: BTreeMap<String, Vec<String>>,
}

impl InvalidationPolicy {
  pub fn new(api_base: Url, related: BTreeMap<String, Vec<String>>) -> Self {
    Self {
      api_base: with_trailing_slash(api_base),
      related,
    }
  }

  pub fn api_base(&self) -> &Url {
    &self.api_base
  }

  /// Whether `url` addresses the resource API.
  pub fn is_resource_url(&self, url: &Url) -> bool {
    url.as_str().starts_with(self.api_base.as_str())
  }

  /// Path of `url` relative to the API base, without query. URLs outside the
  /// API fall back to their absolute path.
  pub fn resource_path(&self, url: &Url) -> String {
    if self.is_resource_url(url) {
      let rest = &url.as_str()[self.api_base.as_str().len()..];
      let end = rest.find(['?', '#']).unwrap_or(rest.len());
      rest[..end].trim_matches('/').to_string()
    } else {
      url.path().trim_matches('/').to_string()
    }
  }

  /// Resource family of a path: its first segment.
  pub fn family(resource_path: &str) -> &str {
    resource_path
      .trim_start_matches('/')
      .split(['/', '?'])
      .next()
      .unwrap_or_default()
  }

  /// Cache key prefixes to evict after a mutation on `resource_path`.
  pub fn prefixes(&self, resource_path: &str) -> Vec<String> {
    let family = Self::family(resource_path);

    let mut families = vec![family.to_string()];
    if let Some(related) = self.related.get(family) {
      families.extend(related.iter().cloned());
    }

    let mut prefixes: Vec<String> = families
      .iter()
      .filter_map(|f| self.api_base.join(f).ok())
      .map(|url| url_prefix(&Method::GET, &url))
      .collect();
    prefixes.sort();
    prefixes.dedup();
    prefixes
  }

  /// Evict the cached reads affected by a mutation on `resource_path`.
  pub fn apply(&self, cache: &CachePartition, resource_path: &str) -> Result<usize> {
    let mut evicted = 0;
    for prefix in self.prefixes(resource_path) {
      evicted += cache.delete_prefix(&prefix)?;
    }

    debug!(path = resource_path, evicted, "Invalidated cached reads");
    Ok(evicted)
  }
}

fn with_trailing_slash(mut url: Url) -> Url {
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  url.set_query(None);
  url.set_fragment(None);
  url
}
