//! # labfleet-id
//!
//! Resource identity and typed IDs for the labfleet control plane.
//!
//! ## Design Principles
//!
//! - Managed resources are identified by `namespace/name`; both halves are
//!   user-controlled DNS labels validated on parse
//! - System-generated IDs (events) are prefixed ULIDs and never reused
//! - All IDs have a canonical string representation with strict parsing
//!
//! ## Formats
//!
//! - Resource: `labs/ccna-lab-42`, `workers/enarsi-pool-01hv4z2wqx`
//! - Event: `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
