//! # shipway-events
//!
//! The event contract between the control-plane core and its asynchronous
//! consumers (workflow engine, notification fan-out, webhook delivery).
//!
//! Events are fire-and-forget from the core's perspective: the core
//! publishes and moves on; delivery failures on the consumer side never
//! affect core state. Payloads therefore carry everything a consumer needs
//! without a round trip back into the core.

mod types;

pub use types::*;
