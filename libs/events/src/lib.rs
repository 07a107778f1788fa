//! # labfleet-events
//!
//! Event type definitions for the labfleet control plane.
//!
//! ## Design Principles
//!
//! - Events are immutable records of something a control loop decided
//! - Every event belongs to exactly one aggregate (a managed resource)
//! - Events never carry credentials (hypervisor passwords, license tokens)
//! - Publishing is fire-and-forget; consumers must tolerate gaps
//!
//! ## Event Types
//!
//! - Lab instance events (`lab_instance.*`)
//! - Worker events (`worker.*`)
//! - Pool events (`worker_pool.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
