//! Device presence and telemetry history models.

use fleetwatch_core::protocol::TelemetrySnapshot;
use fleetwatch_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Online presence
// ---------------------------------------------------------------------------

/// A device that currently holds a session.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceOnline {
    pub device_id: String,
    pub online_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Telemetry history (append-only)
// ---------------------------------------------------------------------------

/// One persisted telemetry snapshot.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceInfo {
    pub id: i64,
    pub recorded_at: Timestamp,
    pub device_id: String,
    pub project: String,
    pub models: Vec<String>,
    pub gpu_name: String,
    pub utilization_gpu: i64,
    pub memory_total: i64,
    pub memory_used: i64,
    pub created_at: Timestamp,
}

/// DTO for inserting a telemetry row.
#[derive(Debug, Clone)]
pub struct CreateDeviceInfo {
    pub device_id: String,
    pub recorded_at: Timestamp,
    pub project: String,
    pub models: Vec<String>,
    pub gpu_name: String,
    pub utilization_gpu: i64,
    pub memory_total: i64,
    pub memory_used: i64,
}

impl CreateDeviceInfo {
    pub fn from_snapshot(device_id: &str, recorded_at: Timestamp, snapshot: &TelemetrySnapshot) -> Self {
        Self {
            device_id: device_id.to_string(),
            recorded_at,
            project: snapshot.project.clone(),
            models: snapshot.model_names(),
            gpu_name: snapshot.gpu_name.clone(),
            utilization_gpu: snapshot.utilization_gpu,
            memory_total: snapshot.memory_total,
            memory_used: snapshot.memory_used,
        }
    }
}
