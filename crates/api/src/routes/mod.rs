pub mod devices;
pub mod health;
pub mod metrics;

use axum::Router;

use crate::state::AppState;

/// Routes mounted under `/api/v1`.
///
/// ```text
/// /devices    -> devices::router
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/devices", devices::router())
}
