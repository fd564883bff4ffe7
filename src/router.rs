//! Request interception: classify each request and apply its caching strategy.
//!
//! | Class          | Strategy                                              |
//! |----------------|-------------------------------------------------------|
//! | Passthrough    | network only, never cached                            |
//! | Navigation     | network first, cached page, app shell, offline page   |
//! | MutatingWrite  | network attempt, queue on failure (202)               |
//! | ResourceRead   | fresh cache, network, stale cache, offline marker (503)|
//! | StaticAsset    | cache first, populate on miss                         |
//!
//! Network trouble never reaches the caller as an error. The only failures
//! `Router::handle` returns come from the durable store.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CachePartition, RequestKey, DATA_PARTITION};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::coordinator::SyncHandle;
use crate::http::{Method, Outbound, Request, RequestMode, Response, ResponseSource};
use crate::invalidation::InvalidationPolicy;
use crate::queue::{MutationKind, MutationQueue, QueuedMutation};
use crate::store::DurableStore;
use crate::transport::{send_with_timeout, Transport, TransportError};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Passthrough,
  Navigation,
  MutatingWrite,
  ResourceRead,
  StaticAsset,
}

/// One classification rule: the first rule whose predicate matches wins.
pub struct Rule {
  pub class: RequestClass,
  pub matches: fn(&Classifier, &Request) -> bool,
}

/// Ordered predicate → class rules.
pub struct Classifier {
  rules: Vec<Rule>,
  bypass_schemes: Vec<String>,
  policy: InvalidationPolicy,
}

impl Classifier {
  pub fn new(bypass_schemes: Vec<String>, policy: InvalidationPolicy) -> Self {
    Self {
      rules: default_rules(),
      bypass_schemes,
      policy,
    }
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self
      .rules
      .iter()
      .find(|rule| (rule.matches)(self, request))
      .map(|rule| rule.class)
      .unwrap_or(RequestClass::StaticAsset)
  }

  fn is_bypassed(&self, url: &Url) -> bool {
    let scheme = url.scheme();
    !matches!(scheme, "http" | "https")
      || self
        .bypass_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(scheme))
  }
}

fn default_rules() -> Vec<Rule> {
  vec![
    Rule {
      class: RequestClass::Passthrough,
      matches: |c, r| c.is_bypassed(&r.url),
    },
    Rule {
      class: RequestClass::Navigation,
      matches: |_, r| r.mode == RequestMode::Navigate,
    },
    Rule {
      class: RequestClass::MutatingWrite,
      matches: |_, r| MutationKind::from_method(&r.method).is_some(),
    },
    Rule {
      class: RequestClass::ResourceRead,
      matches: |c, r| c.policy.is_resource_url(&r.url),
    },
    Rule {
      class: RequestClass::StaticAsset,
      matches: |_, _| true,
    },
  ]
}

pub struct Router {
  classifier: Classifier,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  data_cache: CachePartition,
  static_cache: CachePartition,
  queue: MutationQueue,
  policy: InvalidationPolicy,
  sync: SyncHandle,
  timeout: Duration,
  cache_ttl: Duration,
  relevant_headers: Vec<String>,
  app_shell: Option<Url>,
}

impl Router {
  pub fn new(
    config: &Config,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    sync: SyncHandle,
  ) -> Self {
    let policy = InvalidationPolicy::new(
      config.api_base_url.clone(),
      config.related_families.clone(),
    );

    Self {
      classifier: Classifier::new(config.bypass_schemes.clone(), policy.clone()),
      transport,
      connectivity,
      data_cache: CachePartition::new(store.clone(), DATA_PARTITION),
      static_cache: CachePartition::new(store.clone(), config.static_partition()),
      queue: MutationQueue::new(store, config.max_retries),
      policy,
      sync,
      timeout: config.network_timeout(),
      cache_ttl: config.cache_ttl(),
      relevant_headers: config.relevant_headers.clone(),
      app_shell: config.app_shell.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self.classifier.classify(request)
  }

  /// Route one request. Always yields a response unless the durable store fails.
  pub async fn handle(&self, request: Request) -> Result<Response> {
    let class = self.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "Routing request");

    match class {
      RequestClass::Passthrough => Ok(self.passthrough(request).await),
      RequestClass::Navigation => self.navigate(request).await,
      RequestClass::MutatingWrite => self.mutate(request).await,
      RequestClass::ResourceRead => self.read_resource(request).await,
      RequestClass::StaticAsset => self.static_asset(request).await,
    }
  }

  /// Send over the network, unless we already know we are offline.
  async fn network(&self, request: &Outbound) -> Result<Response, TransportError> {
    if !self.connectivity.is_online() {
      return Err(TransportError::Connect("offline".to_string()));
    }
    send_with_timeout(self.transport.as_ref(), request, self.timeout).await
  }

  async fn passthrough(&self, request: Request) -> Response {
    let outbound = buffer(request).await;
    match send_with_timeout(self.transport.as_ref(), &outbound, self.timeout).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %outbound.url, error = %e, "Passthrough request failed");
        Response::unavailable()
      }
    }
  }

  async fn navigate(&self, request: Request) -> Result<Response> {
    let outbound = buffer(request).await;
    // Form submissions are never stored under the page's key
    let cacheable = outbound.method == Method::GET;
    let key = RequestKey::plain(&Method::GET, &outbound.url);

    match self.network(&outbound).await {
      Ok(response) => {
        if cacheable && response.is_success() {
          self.static_cache.store_response(&key, &response)?;
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %outbound.url, error = %e, "Navigation fell back to cache");

        if cacheable {
          if let Some(entry) = self.static_cache.get(&key)? {
            return Ok(entry.into_response(ResponseSource::CacheStale));
          }
        }

        if let Some(shell) = &self.app_shell {
          let shell_key = RequestKey::plain(&Method::GET, shell);
          if let Some(entry) = self.static_cache.get(&shell_key)? {
            return Ok(entry.into_response(ResponseSource::CacheStale));
          }
        }

        warn!(url = %outbound.url, "No cached document for offline navigation");
        Ok(Response::offline_document())
      }
    }
  }

  async fn read_resource(&self, request: Request) -> Result<Response> {
    let outbound = buffer(request).await;
    let cacheable = outbound.method == Method::GET;
    let key = RequestKey::new(
      &outbound.method,
      &outbound.url,
      &outbound.headers,
      &self.relevant_headers,
    );

    let cached = if cacheable {
      self.data_cache.get(&key)?
    } else {
      None
    };

    if let Some(entry) = &cached {
      if entry.is_fresh(self.cache_ttl) {
        debug!(key = %key, "Serving fresh cached read");
        return Ok(entry.clone().into_response(ResponseSource::CacheFresh));
      }
    }

    match self.network(&outbound).await {
      Ok(response) => {
        if cacheable && response.is_success() {
          self.data_cache.store_response(&key, &response)?;
        }
        Ok(response)
      }
      Err(e) => match cached {
        Some(entry) => {
          info!(key = %key, error = %e, "Network unavailable, serving cached read");
          Ok(entry.into_response(ResponseSource::CacheStale))
        }
        None => {
          info!(key = %key, error = %e, "Network unavailable and nothing cached");
          Ok(Response::offline_read())
        }
      },
    }
  }

  async fn static_asset(&self, request: Request) -> Result<Response> {
    let outbound = buffer(request).await;
    if outbound.method != Method::GET {
      return Ok(
        self
          .network(&outbound)
          .await
          .unwrap_or_else(|_| Response::unavailable()),
      );
    }

    // Static entries are keyed by URL alone so precached assets are found
    // whatever the client sends in Accept
    let key = RequestKey::plain(&Method::GET, &outbound.url);

    if let Some(entry) = self.static_cache.get(&key)? {
      return Ok(entry.into_response(ResponseSource::CacheFresh));
    }

    match self.network(&outbound).await {
      Ok(response) => {
        if response.is_success() {
          self.static_cache.store_response(&key, &response)?;
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %outbound.url, error = %e, "Static asset unavailable");
        Ok(Response::unavailable())
      }
    }
  }

  async fn mutate(&self, request: Request) -> Result<Response> {
    // The body can only be read once: capture it before anything else
    let kind = MutationKind::from_method(&request.method).unwrap_or(MutationKind::Update);
    let outbound = buffer(request).await;
    let resource_path = self.policy.resource_path(&outbound.url);

    match self.network(&outbound).await {
      Ok(response) => {
        if response.is_success() {
          self.policy.apply(&self.data_cache, &resource_path)?;
        }
        Ok(response)
      }
      Err(e) => {
        info!(
          method = %outbound.method,
          path = %resource_path,
          error = %e,
          "Write failed, queueing for replay"
        );

        let mutation = QueuedMutation::new(kind, &outbound.method, outbound.url, resource_path)
          .with_headers(outbound.headers)
          .with_payload(outbound.body);
        self.queue.enqueue(mutation)?;
        self.sync.request_sync();

        Ok(Response::queued())
      }
    }
  }
}

/// Buffer a request for sending. An unreadable body is replaced by no body.
async fn buffer(request: Request) -> Outbound {
  let Request {
    method,
    url,
    headers,
    body,
    ..
  } = request;

  let body = match body.capture().await {
    Ok(body) => body,
    Err(e) => {
      warn!(%method, %url, error = %e, "Request body unreadable, continuing without it");
      None
    }
  };

  Outbound::new(method, url).with_headers(headers).with_body(body)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::coordinator::sync_channel;
  use crate::store::SqliteStore;
  use crate::testing::{api, config, FakeTransport};
  use futures::StreamExt;

  struct Harness {
    router: Router,
    transport: Arc<FakeTransport>,
    connectivity: Connectivity,
    queue: MutationQueue,
    data_cache: CachePartition,
    triggers: crate::coordinator::SyncTriggers,
  }

  fn harness_with(config: Config) -> Harness {
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(FakeTransport::new());
    let connectivity = Connectivity::new(true);
    let (handle, triggers) = sync_channel();

    Harness {
      router: Router::new(
        &config,
        store.clone(),
        transport.clone(),
        connectivity.clone(),
        handle,
      ),
      transport,
      connectivity,
      queue: MutationQueue::new(store.clone(), config.max_retries),
      data_cache: CachePartition::new(store, DATA_PARTITION),
      triggers,
    }
  }

  fn harness() -> Harness {
    harness_with(config())
  }

  #[test]
  fn test_classification_order() {
    let h = harness();
    let classify = |r: Request| h.router.classify(&r);

    let ext = Url::parse("chrome-extension://abc/script.js").unwrap();
    assert_eq!(classify(Request::get(ext)), RequestClass::Passthrough);
    assert_eq!(
      classify(Request::navigate(api("checklists"))),
      RequestClass::Navigation
    );
    assert_eq!(
      classify(Request::new(Method::POST, api("shots"))),
      RequestClass::MutatingWrite
    );
    assert_eq!(
      classify(Request::new(Method::DELETE, Url::parse("https://cdn.example.com/x").unwrap())),
      RequestClass::MutatingWrite
    );
    assert_eq!(classify(Request::get(api("shots"))), RequestClass::ResourceRead);
    assert_eq!(
      classify(Request::get(Url::parse("https://app.example.com/app.js").unwrap())),
      RequestClass::StaticAsset
    );
  }

  #[tokio::test]
  async fn test_read_is_cached_within_ttl() {
    let h = harness();
    h.transport.respond(&api("checklists"), 200, b"[{\"id\":1}]");

    let first = h.router.handle(Request::get(api("checklists"))).await.unwrap();
    let second = h.router.handle(Request::get(api("checklists"))).await.unwrap();

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::CacheFresh);
    assert_eq!(second.body, b"[{\"id\":1}]");
    assert_eq!(h.transport.sent_count(), 1);
  }

  #[tokio::test]
  async fn test_expired_read_goes_to_network() {
    let mut cfg = config();
    cfg.cache_ttl_secs = 0;
    let h = harness_with(cfg);

    h.router.handle(Request::get(api("checklists"))).await.unwrap();
    let second = h.router.handle(Request::get(api("checklists"))).await.unwrap();

    assert_eq!(second.source, ResponseSource::Network);
    assert_eq!(h.transport.sent_count(), 2);
  }

  #[tokio::test]
  async fn test_read_falls_back_to_stale_cache() {
    let mut cfg = config();
    cfg.cache_ttl_secs = 0;
    let h = harness_with(cfg);
    h.transport.respond(&api("projects"), 200, b"[7]");

    h.router.handle(Request::get(api("projects"))).await.unwrap();
    h.transport.set_online(false);
    let response = h.router.handle(Request::get(api("projects"))).await.unwrap();

    assert_eq!(response.source, ResponseSource::CacheStale);
    assert_eq!(response.body, b"[7]");
  }

  #[tokio::test]
  async fn test_uncached_offline_read_is_marked() {
    let h = harness();
    h.transport.set_online(false);

    let response = h.router.handle(Request::get(api("shots"))).await.unwrap();

    assert_eq!(response.status, 503);
    assert!(response.is_offline());
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["offline"], true);
  }

  #[tokio::test]
  async fn test_read_timeout_falls_back() {
    let h = harness();
    h.transport.set_delay(Duration::from_secs(5));

    let response = h.router.handle(Request::get(api("shots"))).await.unwrap();

    assert_eq!(response.status, 503);
    assert!(response.is_offline());
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let h = harness();
    h.transport.respond(&api("shots"), 500, b"boom");

    let response = h.router.handle(Request::get(api("shots"))).await.unwrap();

    assert_eq!(response.status, 500);
    assert!(h.data_cache.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_known_offline_skips_network() {
    let h = harness();
    h.connectivity.set_online(false);

    let response = h.router.handle(Request::get(api("shots"))).await.unwrap();

    assert!(response.is_offline());
    assert_eq!(h.transport.sent_count(), 0);
  }

  #[tokio::test]
  async fn test_failed_write_is_queued() {
    let mut h = harness();
    h.transport.set_online(false);

    let request = Request::new(Method::POST, api("shots"))
      .with_json(&serde_json::json!({ "title": "X" }))
      .unwrap()
      .with_header("prefer", "return=representation");
    let response = h.router.handle(request).await.unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(response.source, ResponseSource::Queued);
    assert_eq!(response.json::<serde_json::Value>().unwrap()["queued"], true);

    let pending = h.queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, MutationKind::Create);
    assert_eq!(pending[0].resource_path, "shots");
    assert_eq!(pending[0].payload, Some(br#"{"title":"X"}"#.to_vec()));
    assert!(pending[0]
      .headers
      .contains(&("prefer".to_string(), "return=representation".to_string())));

    assert!(h.triggers.try_recv());
  }

  #[tokio::test]
  async fn test_streamed_body_is_captured_once() {
    let h = harness();
    h.transport.set_online(false);

    let chunks = vec![Ok(b"{\"isCompleted\":".to_vec()), Ok(b"true}".to_vec())];
    let request = Request::new(Method::PATCH, api("shots/1"))
      .with_stream(futures::stream::iter(chunks).boxed());
    h.router.handle(request).await.unwrap();

    let pending = h.queue.list_pending().unwrap();
    assert_eq!(pending[0].payload, Some(b"{\"isCompleted\":true}".to_vec()));
  }

  #[tokio::test]
  async fn test_unreadable_body_is_queued_as_null() {
    let h = harness();
    h.transport.set_online(false);

    let chunks = vec![Err(std::io::Error::new(std::io::ErrorKind::Other, "aborted"))];
    let request = Request::new(Method::PUT, api("shots/1"))
      .with_stream(futures::stream::iter(chunks).boxed());
    let response = h.router.handle(request).await.unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(h.queue.list_pending().unwrap()[0].payload, None);
  }

  #[tokio::test]
  async fn test_successful_write_invalidates_family() {
    let h = harness();
    h.router.handle(Request::get(api("checklists"))).await.unwrap();
    h.router.handle(Request::get(api("projects"))).await.unwrap();
    assert_eq!(h.data_cache.len().unwrap(), 2);

    let response = h
      .router
      .handle(Request::new(Method::PATCH, api("checklists/123")).with_body(b"{}".to_vec()))
      .await
      .unwrap();

    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(h.data_cache.len().unwrap(), 1);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_rejected_write_is_returned_not_queued() {
    let h = harness();
    h.transport.respond(&api("shots"), 409, b"conflict");

    let response = h
      .router
      .handle(Request::new(Method::POST, api("shots")).with_body(b"{}".to_vec()))
      .await
      .unwrap();

    assert_eq!(response.status, 409);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_navigation_fallbacks() {
    let mut cfg = config();
    let shell = Url::parse("https://app.example.com/index.html").unwrap();
    cfg.app_shell = Some(shell.clone());
    let h = harness_with(cfg);
    let page = Url::parse("https://app.example.com/projects").unwrap();
    h.transport.respond(&shell, 200, b"<html>shell</html>");
    h.transport.respond(&page, 200, b"<html>projects</html>");

    // Warm the cache with the shell and one page
    h.router.handle(Request::navigate(shell.clone())).await.unwrap();
    h.router.handle(Request::navigate(page.clone())).await.unwrap();
    h.transport.set_online(false);

    let cached = h.router.handle(Request::navigate(page)).await.unwrap();
    assert_eq!(cached.body, b"<html>projects</html>");
    assert_eq!(cached.source, ResponseSource::CacheStale);

    let other = Url::parse("https://app.example.com/checklists/9").unwrap();
    let fallback = h.router.handle(Request::navigate(other)).await.unwrap();
    assert_eq!(fallback.body, b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_form_post_navigation_is_not_cached() {
    let h = harness();
    let login = Url::parse("https://app.example.com/login").unwrap();
    h.transport.respond(&login, 200, b"<html>welcome back</html>");

    let mut form = Request::navigate(login.clone()).with_body(b"user=a".to_vec());
    form.method = Method::POST;
    assert_eq!(h.router.classify(&form), RequestClass::Navigation);

    let posted = h.router.handle(form).await.unwrap();
    assert_eq!(posted.body, b"<html>welcome back</html>");

    h.transport.set_online(false);
    let offline = h.router.handle(Request::navigate(login)).await.unwrap();
    assert_eq!(offline.status, 503);
    assert_eq!(offline.source, ResponseSource::Offline);
  }

  #[tokio::test]
  async fn test_static_asset_lookup_ignores_accept() {
    let h = harness();
    let asset = Url::parse("https://app.example.com/app.css").unwrap();
    h.transport.respond(&asset, 200, b"body{}");

    h.router
      .handle(Request::get(asset.clone()).with_header("accept", "text/css"))
      .await
      .unwrap();
    h.transport.set_online(false);

    let cached = h
      .router
      .handle(Request::get(asset).with_header("accept", "text/css,*/*;q=0.1"))
      .await
      .unwrap();
    assert_eq!(cached.status, 200);
    assert_eq!(cached.source, ResponseSource::CacheFresh);
  }

  #[tokio::test]
  async fn test_navigation_without_anything_cached() {
    let h = harness();
    h.transport.set_online(false);

    let response = h
      .router
      .handle(Request::navigate(Url::parse("https://app.example.com/").unwrap()))
      .await
      .unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("text/html; charset=utf-8"));
  }

  #[tokio::test]
  async fn test_static_assets_are_cache_first() {
    let h = harness();
    let asset = Url::parse("https://app.example.com/app.js").unwrap();
    h.transport.respond(&asset, 200, b"console.log(1)");

    let first = h.router.handle(Request::get(asset.clone())).await.unwrap();
    h.transport.set_online(false);
    let second = h.router.handle(Request::get(asset.clone())).await.unwrap();

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::CacheFresh);
    assert_eq!(second.body, b"console.log(1)");
    assert_eq!(h.transport.sent_count(), 1);

    let missing = Url::parse("https://app.example.com/other.js").unwrap();
    let response = h.router.handle(Request::get(missing)).await.unwrap();
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_passthrough_is_never_cached() {
    let h = harness();
    let ext = Url::parse("chrome-extension://abc/script.js").unwrap();

    h.router.handle(Request::get(ext.clone())).await.unwrap();
    h.router.handle(Request::get(ext)).await.unwrap();

    assert_eq!(h.transport.sent_count(), 2);
  }
}
