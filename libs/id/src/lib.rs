//! # shipway-id
//!
//! Typed resource identifiers for the Shipway platform.
//!
//! Every resource the control plane touches is addressed by a prefixed,
//! ULID-based identifier: `srv_01HV4Z2WQXKJNM8GPQY6VBKC3D`,
//! `dpl_01HV4Z3MXNKPQR9HSTZ7WCLD4E`, and so on. The prefix makes IDs
//! self-describing in logs and API payloads; the ULID portion keeps them
//! time-ordered and collision-free.
//!
//! IDs parse strictly: the prefix must match the type, and the remainder
//! must be a valid ULID. Parsing and formatting round-trip.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
