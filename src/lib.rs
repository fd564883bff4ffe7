//! Offline-first sync engine.
//!
//! Requests go through a [`Router`](router::Router) that picks a caching
//! strategy per request class. Writes that cannot reach the network are kept
//! in a durable [`MutationQueue`](queue::MutationQueue) and replayed in order
//! by the [`SyncCoordinator`](coordinator::SyncCoordinator) once connectivity
//! returns. [`SyncEngine`] wires all of it together.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod http;
pub mod invalidation;
pub mod queue;
pub mod router;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{BackgroundTasks, InstallReport, SyncEngine};
pub use http::{Method, Request, Response, ResponseSource};
