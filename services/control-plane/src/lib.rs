//! labfleet control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! resource model, controllers, watcher and scheduler as a library to enable
//! integration testing and reuse.

pub mod clients;
pub mod config;
pub mod controllers;
pub mod error;
pub mod resources;
pub mod runtime;
pub mod scaling;
pub mod scheduler;
pub mod store;
pub mod watcher;
