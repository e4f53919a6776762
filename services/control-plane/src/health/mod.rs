//! Server health reconciliation.
//!
//! The periodic convergence mechanism for `Server.status`: compares the
//! persisted fleet against the hub's live connection set and heartbeat
//! recency, independent of any single connection. This loop is the source
//! of truth for the status operators see.

pub mod reconciler;
pub mod worker;

pub use reconciler::{HealthReconciler, HealthStats, ServerHealth};
pub use worker::HealthWorker;
