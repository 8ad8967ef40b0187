//! # Core Engine Module
//!
//! The ingestion-independent heart of the relay: how updates are merged, where
//! the consolidated state lives, and how it is fanned out to subscribers.
//!
//! ## Core Components:
//!
//! - **`merge`**: the pure deep-merge of a partial update into the state tree.
//!
//! - **`state`**: the single-writer state store. The upstream reader owns the
//!   [`StateWriter`]; the scheduler and health probes hold [`StateReader`]s that
//!   only ever see complete, immutable snapshots.
//!
//! - **`dispatcher`**: the subscriber registry and its non-blocking fan-out.
//!
//! - **`scheduler`**: the fixed-cadence broadcaster with the production warm-up gate.
//!
//! - **`backoff`**: capped exponential delays for the upstream reconnect loop.

/// Deep merge of partial update trees.
pub mod merge;
/// Owned consolidated state and its published snapshots.
pub mod state;
/// Downstream subscriber registry and fan-out.
pub mod dispatcher;
/// Fixed-cadence broadcaster with warm-up gating.
pub mod scheduler;
/// Reconnect delay policy.
pub mod backoff;

// --- Public API Re-exports ---
pub use backoff::Backoff;
pub use dispatcher::{Dispatcher, FanoutReport, Liveness, Payload, SubscriberLink};
pub use merge::{deep_merge, Tree};
pub use scheduler::{BroadcastScheduler, ExecutionMode, SchedulerConfig};
pub use state::{state_store, LinkState, StateReader, StateSnapshot, StateWriter, UpdateEvent};
