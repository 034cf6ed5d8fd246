//! Route definitions for device presence and telemetry reporting.

use axum::routing::get;
use axum::Router;

use crate::handlers::devices;
use crate::state::AppState;

/// Routes mounted at `/api/v1/devices`.
///
/// ```text
/// GET /online                      -> list_online
/// GET /latest                      -> latest_telemetry
/// GET /{device_id}/telemetry       -> device_telemetry
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/online", get(devices::list_online))
        .route("/latest", get(devices::latest_telemetry))
        .route("/{device_id}/telemetry", get(devices::device_telemetry))
}
