//! Process-wide online/offline signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::http::{Method, Outbound};
use crate::transport::{send_with_timeout, Transport};

/// Shared connectivity state. Clones observe the same value.
///
/// Only the observer side (a probe or a platform callback) should call
/// [`Connectivity::set_online`]; everyone else reads or subscribes.
#[derive(Clone, Debug)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current network signal. Returns `true` on a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Receiver that wakes on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Periodically checks whether the resource API answers at all and feeds the
/// result into a [`Connectivity`].
pub struct ConnectivityProbe {
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  health_url: Url,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityProbe {
  pub fn new(
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    health_url: Url,
    interval: Duration,
    timeout: Duration,
  ) -> Self {
    Self {
      transport,
      connectivity,
      health_url,
      interval,
      timeout,
    }
  }

  /// Probe once. Any HTTP response counts as online.
  pub async fn check(&self) -> bool {
    let request = Outbound::new(Method::HEAD, self.health_url.clone());
    let online = match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Connectivity probe failed");
        false
      }
    };

    self.connectivity.set_online(online);
    online
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        self.check().await;
      }
    })
  }
}
