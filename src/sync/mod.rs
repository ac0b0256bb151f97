//! Periodic reconciliation of the local progress store with the remote store.

mod analytics;
mod controller;
mod engine;
mod outbox;

pub use analytics::VideoAnalytics;
pub use controller::SyncController;
pub use engine::{SyncEngine, SyncReport};
pub use outbox::{backoff_delay, Outbox, OutboxEntry};
