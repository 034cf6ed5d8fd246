use axum::routing::get;
use axum::Router;

use crate::handlers::metrics;
use crate::state::AppState;

/// Scrape endpoint, mounted at root level (not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/metrics/prometheus", get(metrics::prometheus_metrics))
}
