//! Shared response envelope types for API handlers.
//!
//! JSON API responses use a `{ "data": ... }` envelope. The device protocol
//! and the Prometheus scrape endpoint have their own formats.

use serde::Serialize;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}
