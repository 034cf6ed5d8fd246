//! Handlers for device presence and telemetry reporting.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use fleetwatch_core::error::CoreError;
use fleetwatch_db::models::device::DeviceInfo;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Query parameters for the telemetry history endpoint.
#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    /// How many hours of history to return (default: 1).
    pub hours: Option<i64>,
}

/// GET /api/v1/devices/online
///
/// Device ids that currently hold a session, sorted.
pub async fn list_online(State(state): State<AppState>) -> Json<DataResponse<Vec<String>>> {
    let devices = state.registry.online_devices().await;
    Json(DataResponse { data: devices })
}

/// GET /api/v1/devices/latest
///
/// The newest persisted telemetry record of every device.
pub async fn latest_telemetry(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<DeviceInfo>>>> {
    let rows = state.gateway.latest_per_device().await?;
    Ok(Json(DataResponse { data: rows }))
}

/// GET /api/v1/devices/{device_id}/telemetry
///
/// Persisted telemetry for one device, newest first. `hours` is bounded by
/// the retention window.
pub async fn device_telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<TelemetryQuery>,
) -> AppResult<Json<DataResponse<Vec<DeviceInfo>>>> {
    let hours = query.hours.unwrap_or(1);
    let max_hours = state.config.retention_hours.max(1);
    if !(1..=max_hours).contains(&hours) {
        return Err(AppError::Core(CoreError::Validation(format!(
            "hours must be between 1 and {max_hours}"
        ))));
    }
    let since = Utc::now() - Duration::hours(hours);
    let rows = state.gateway.telemetry_for_device(&device_id, since).await?;
    Ok(Json(DataResponse { data: rows }))
}
