use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /metrics/prometheus
///
/// Last-known device gauges in Prometheus text exposition format.
pub async fn prometheus_metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let body = state.metrics.render()?;
    Ok(([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
