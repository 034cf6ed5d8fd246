//! Fleetwatch domain core.
//!
//! Pure logic shared by the database layer and the API server: the
//! device wire protocol, device identifier rules, and common types.
//! Nothing in this crate performs I/O.

pub mod device;
pub mod error;
pub mod protocol;
pub mod types;
