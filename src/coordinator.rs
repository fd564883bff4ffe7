//! Background drain of the mutation queue.
//!
//! The coordinator replays queued writes in FIFO order whenever there is a
//! reasonable chance of success: when connectivity comes back, when someone
//! asks for a sync, and optionally on a fixed cadence. Drains never overlap;
//! a trigger that arrives mid-drain is folded into a single follow-up pass.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use crate::cache::{CachePartition, DATA_PARTITION};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::invalidation::InvalidationPolicy;
use crate::queue::{MutationQueue, RetryOutcome};
use crate::store::DurableStore;
use crate::transport::{send_with_timeout, Transport};

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
  Idle,
  Draining,
  /// Offline: drains are skipped
  Disabled,
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Replayed successfully and removed
  pub replayed: usize,
  /// Failed and kept for a later pass
  pub failed: usize,
  /// Failed for the last allowed time and moved to the dead-letter partition
  pub dead_lettered: usize,
  /// Entries still queued after the pass
  pub remaining: usize,
  /// Connectivity was lost partway and the rest of the queue was left untried
  pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another drain was already running
  Coalesced,
  /// Offline, nothing attempted
  Disabled,
}

/// Sender side of the "please sync" signal.
#[derive(Clone, Debug)]
pub struct SyncHandle {
  tx: mpsc::Sender<()>,
}

impl SyncHandle {
  /// Ask for a drain. Requests made while one is already pending are merged.
  pub fn request_sync(&self) {
    match self.tx.try_send(()) {
      Ok(()) => debug!("Sync requested"),
      Err(mpsc::error::TrySendError::Full(())) => debug!("Sync already pending"),
      Err(mpsc::error::TrySendError::Closed(())) => debug!("Sync requested but coordinator is not running"),
    }
  }
}

/// Receiver side of the "please sync" signal, consumed by [`SyncCoordinator::run`].
#[derive(Debug)]
pub struct SyncTriggers {
  rx: mpsc::Receiver<()>,
}

impl SyncTriggers {
  /// Take a pending trigger without waiting.
  pub fn try_recv(&mut self) -> bool {
    self.rx.try_recv().is_ok()
  }
}

/// A one-slot trigger channel: at most one sync request is ever pending.
pub fn sync_channel() -> (SyncHandle, SyncTriggers) {
  let (tx, rx) = mpsc::channel(1);
  (SyncHandle { tx }, SyncTriggers { rx })
}

pub struct SyncCoordinator {
  queue: MutationQueue,
  data_cache: CachePartition,
  policy: InvalidationPolicy,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  timeout: Duration,
  sync_interval: Option<Duration>,
  draining: AtomicBool,
}

/// Clears the draining flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl SyncCoordinator {
  pub fn new(
    config: &Config,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      queue: MutationQueue::new(store.clone(), config.max_retries),
      data_cache: CachePartition::new(store, DATA_PARTITION),
      policy: InvalidationPolicy::new(
        config.api_base_url.clone(),
        config.related_families.clone(),
      ),
      transport,
      connectivity,
      timeout: config.network_timeout(),
      sync_interval: config.sync_interval(),
      draining: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> CoordinatorState {
    if self.draining.load(Ordering::Acquire) {
      CoordinatorState::Draining
    } else if !self.connectivity.is_online() {
      CoordinatorState::Disabled
    } else {
      CoordinatorState::Idle
    }
  }

  /// Run one drain pass over everything currently queued.
  ///
  /// A failed replay never stops the pass; it only bumps that entry's retry
  /// count. Losing connectivity does: entries not yet tried keep their retry
  /// budget. Only durable store failures are returned as errors.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    if !self.connectivity.is_online() {
      debug!("Offline, skipping drain");
      return Ok(DrainOutcome::Disabled);
    }

    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already running");
      return Ok(DrainOutcome::Coalesced);
    }
    let _guard = DrainGuard(&self.draining);

    let pending = self.queue.list_pending()?;
    let mut report = DrainReport::default();
    if !pending.is_empty() {
      info!(count = pending.len(), "Draining mutation queue");
    }

    for mutation in pending {
      if !self.connectivity.is_online() {
        info!(id = %mutation.id, "Connectivity lost, stopping drain");
        report.interrupted = true;
        break;
      }

      let failure = match mutation.to_outbound() {
        Ok(request) => {
          match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
            Ok(response) if response.is_success() => None,
            Ok(response) => Some(format!("HTTP {}", response.status)),
            Err(e) => Some(e.to_string()),
          }
        }
        Err(e) => Some(e.to_string()),
      };

      match failure {
        None => {
          self.queue.remove(&mutation.id)?;
          self.policy.apply(&self.data_cache, &mutation.resource_path)?;
          report.replayed += 1;
          debug!(id = %mutation.id, path = %mutation.resource_path, "Replayed mutation");
        }
        Some(reason) => {
          warn!(
            id = %mutation.id,
            path = %mutation.resource_path,
            error = %reason,
            "Replay failed"
          );
          match self.queue.bump_retry(&mutation.id, &reason)? {
            RetryOutcome::DeadLettered => report.dead_lettered += 1,
            RetryOutcome::Retrying { .. } => report.failed += 1,
            RetryOutcome::Missing => {}
          }
        }
      }
    }

    report.remaining = self.queue.len()?;
    if report != DrainReport::default() {
      info!(
        replayed = report.replayed,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        remaining = report.remaining,
        interrupted = report.interrupted,
        "Drain finished"
      );
    }

    Ok(DrainOutcome::Completed(report))
  }

  /// Start the background loop. It drains once at startup, then on every
  /// transition to online, every sync request and every periodic tick. The
  /// loop ends when all [`SyncHandle`]s are dropped.
  pub fn spawn(self: Arc<Self>, triggers: SyncTriggers) -> JoinHandle<()> {
    tokio::spawn(self.run(triggers))
  }

  pub async fn run(self: Arc<Self>, mut triggers: SyncTriggers) {
    let mut online = self.connectivity.subscribe();
    let mut ticker = self.sync_interval.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker
    });

    self.drain_logged("startup").await;

    loop {
      let reason = tokio::select! {
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
          if !*online.borrow_and_update() {
            continue;
          }
          "connectivity restored"
        }
        trigger = triggers.rx.recv() => match trigger {
          Some(()) => "requested",
          None => break,
        },
        _ = tick(&mut ticker) => "periodic",
      };

      self.drain_logged(reason).await;
    }

    debug!("Sync coordinator stopped");
  }

  async fn drain_logged(&self, reason: &str) {
    debug!(reason, "Drain triggered");
    if let Err(e) = self.drain().await {
      error!(reason, error = %e, "Drain failed");
    }
  }
}

async fn tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(t) => {
      t.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}
