//! The sync engine: one object that wires the store, caches, router,
//! coordinator and connectivity together from a [`Config`].

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::{purge_outdated_static, CachePartition, RequestKey};
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityProbe};
use crate::coordinator::{
  sync_channel, CoordinatorState, DrainOutcome, SyncCoordinator, SyncHandle, SyncTriggers,
};
use crate::http::{Method, Outbound, Request, Response};
use crate::queue::{DeadLetter, MutationQueue, QueuedMutation};
use crate::router::Router;
use crate::store::{DurableStore, SqliteStore};
use crate::transport::{send_with_timeout, HttpTransport, Transport};

/// Result of [`SyncEngine::install`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  /// URLs now present in the static cache
  pub cached: Vec<Url>,
  /// URLs that could not be fetched
  pub failed: Vec<Url>,
  /// Static partitions of previous versions that were deleted
  pub purged: Vec<String>,
}

/// Handles of the tasks started by [`SyncEngine::spawn_background`].
pub struct BackgroundTasks {
  pub coordinator: JoinHandle<()>,
  pub probe: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
  pub fn abort(&self) {
    self.coordinator.abort();
    if let Some(probe) = &self.probe {
      probe.abort();
    }
  }
}

pub struct SyncEngine {
  config: Config,
  store: Arc<dyn DurableStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  router: Router,
  coordinator: Arc<SyncCoordinator>,
  sync: SyncHandle,
  triggers: Option<SyncTriggers>,
}

impl SyncEngine {
  /// Open the on-disk store and an HTTP transport as configured.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.db_path()?;
    let store = SqliteStore::open(&path)?;
    let transport = HttpTransport::new(config.network_timeout(), Config::api_token())
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    let connectivity = Connectivity::new(config.assume_online);

    info!(store = %path.display(), api = %config.api_base_url, "Opened sync engine");
    Ok(Self::with_parts(
      config,
      Arc::new(store),
      Arc::new(transport),
      connectivity,
    ))
  }

  /// Build an engine from explicit parts.
  pub fn with_parts(
    config: Config,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
  ) -> Self {
    let (sync, triggers) = sync_channel();

    let router = Router::new(
      &config,
      store.clone(),
      transport.clone(),
      connectivity.clone(),
      sync.clone(),
    );
    let coordinator = Arc::new(SyncCoordinator::new(
      &config,
      store.clone(),
      transport.clone(),
      connectivity.clone(),
    ));

    Self {
      config,
      store,
      transport,
      connectivity,
      router,
      coordinator,
      sync,
      triggers: Some(triggers),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn queue(&self) -> MutationQueue {
    MutationQueue::new(self.store.clone(), self.config.max_retries)
  }

  pub fn static_cache(&self) -> CachePartition {
    CachePartition::new(self.store.clone(), self.config.static_partition())
  }

  /// Issue a request through the router.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    self.router.handle(request).await
  }

  /// Drain the queue now, in the caller's task.
  pub async fn sync_now(&self) -> Result<DrainOutcome> {
    self.coordinator.drain().await
  }

  /// Ask the background coordinator for a drain.
  pub fn request_sync(&self) {
    self.sync.request_sync();
  }

  pub fn sync_state(&self) -> CoordinatorState {
    self.coordinator.state()
  }

  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.queue().list_pending()
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    self.queue().dead_letters()
  }

  /// Drop static caches of older versions and precache the app shell and the
  /// configured URLs into the current one.
  pub async fn install(&self) -> Result<InstallReport> {
    let current = self.config.static_partition();
    let mut report = InstallReport {
      purged: purge_outdated_static(self.store.as_ref(), &current)?,
      ..Default::default()
    };

    let cache = self.static_cache();
    let urls = self
      .config
      .app_shell
      .iter()
      .chain(self.config.precache.iter())
      .cloned();

    for url in urls {
      let request = Outbound::new(Method::GET, url.clone());
      match send_with_timeout(self.transport.as_ref(), &request, self.config.network_timeout()).await {
        Ok(response) if response.is_success() => {
          cache.store_response(&RequestKey::plain(&Method::GET, &url), &response)?;
          report.cached.push(url);
        }
        Ok(response) => {
          warn!(url = %url, status = response.status, "Precache fetch rejected");
          report.failed.push(url);
        }
        Err(e) => {
          warn!(url = %url, error = %e, "Precache fetch failed");
          report.failed.push(url);
        }
      }
    }

    info!(
      version = %self.config.cache_version,
      cached = report.cached.len(),
      failed = report.failed.len(),
      purged = report.purged.len(),
      "Installed static cache"
    );
    Ok(report)
  }

  /// Start the coordinator loop and, when a health URL is configured, the
  /// connectivity probe. Can only be done once per engine.
  pub fn spawn_background(&mut self) -> Result<BackgroundTasks> {
    let triggers = self
      .triggers
      .take()
      .ok_or_else(|| eyre!("Background sync already started"))?;

    let coordinator = self.coordinator.clone().spawn(triggers);

    let probe = self.config.health_url.clone().map(|health_url| {
      ConnectivityProbe::new(
        self.transport.clone(),
        self.connectivity.clone(),
        health_url,
        self.config.probe_interval(),
        self.config.network_timeout(),
      )
      .spawn()
    });

    Ok(BackgroundTasks { coordinator, probe })
  }
}
