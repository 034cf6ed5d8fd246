//! Fleetwatch API server library.
//!
//! Exposes the device session protocol, its collaborators (registry,
//! metrics sink, persistence gateway) and the HTTP surface so integration
//! tests and the binary entrypoint can both access them.

pub mod background;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
