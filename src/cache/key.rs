//! Normalized request identity used as the cache key.

use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{header, Method};

/// Cache key for a read request: method, normalized URL and a digest of the
/// headers that change the representation.
///
/// The readable `METHOD URL` part always comes first so that a whole resource
/// family can be evicted by key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url, headers: &[(String, String)], relevant: &[String]) -> Self {
    let mut key = url_prefix(method, url);

    let vary: Vec<String> = relevant
      .iter()
      .filter_map(|name| {
        header(headers, name).map(|v| format!("{}={}", name.to_ascii_lowercase(), v.trim()))
      })
      .collect();

    if !vary.is_empty() {
      // Truncated SHA256 keeps keys short and stable
      let mut hasher = Sha256::new();
      hasher.update(vary.join("\n").as_bytes());
      let digest = hex::encode(hasher.finalize());
      key.push_str(" #");
      key.push_str(&digest[..16]);
    }

    Self(key)
  }

  /// Key for a request without relevant headers.
  pub fn plain(method: &Method, url: &Url) -> Self {
    Self(url_prefix(method, url))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// `METHOD URL` with the fragment stripped. Scheme and host are already
/// lowercased and default ports removed by `Url` parsing.
pub fn url_prefix(method: &Method, url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  format!("{} {}", method.as_str().to_ascii_uppercase(), url)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_normalizes_url() {
    let a = RequestKey::plain(&Method::GET, &url("HTTPS://API.Example.com:443/rest/checklists#top"));
    let b = RequestKey::plain(&Method::GET, &url("https://api.example.com/rest/checklists"));
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "GET https://api.example.com/rest/checklists");
  }

  #[test]
  fn test_relevant_headers_change_key() {
    let relevant = vec!["accept".to_string()];
    let u = url("https://api.example.com/rest/shots");

    let json = RequestKey::new(
      &Method::GET,
      &u,
      &[("Accept".to_string(), "application/json".to_string())],
      &relevant,
    );
    let csv = RequestKey::new(
      &Method::GET,
      &u,
      &[("accept".to_string(), "text/csv".to_string())],
      &relevant,
    );
    let irrelevant = RequestKey::new(
      &Method::GET,
      &u,
      &[("x-trace".to_string(), "1".to_string())],
      &relevant,
    );

    assert_ne!(json, csv);
    assert_eq!(irrelevant, RequestKey::plain(&Method::GET, &u));
    assert!(json.as_str().starts_with("GET https://api.example.com/rest/shots #"));
  }
}
