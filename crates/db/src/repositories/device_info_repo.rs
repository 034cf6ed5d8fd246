//! Repository for the `device_info` table (append-only time-series).

use sqlx::PgPool;
use fleetwatch_core::types::Timestamp;

use crate::models::device::{CreateDeviceInfo, DeviceInfo};

/// Column list for `device_info` SELECT queries.
const COLUMNS: &str = "\
    id, recorded_at, device_id, project, models, gpu_name, \
    utilization_gpu, memory_total, memory_used, created_at";

/// Provides query operations for device telemetry history.
pub struct DeviceInfoRepo;

impl DeviceInfoRepo {
    /// Append a single telemetry row.
    pub async fn insert(pool: &PgPool, input: &CreateDeviceInfo) -> Result<DeviceInfo, sqlx::Error> {
        let query = format!(
            "INSERT INTO device_info \
                (recorded_at, device_id, project, models, gpu_name, \
                 utilization_gpu, memory_total, memory_used) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeviceInfo>(&query)
            .bind(input.recorded_at)
            .bind(&input.device_id)
            .bind(&input.project)
            .bind(&input.models)
            .bind(&input.gpu_name)
            .bind(input.utilization_gpu)
            .bind(input.memory_total)
            .bind(input.memory_used)
            .fetch_one(pool)
            .await
    }

    /// Get telemetry for a device recorded at or after `since`, newest first.
    pub async fn list_for_device(
        pool: &PgPool,
        device_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DeviceInfo>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM device_info \
             WHERE device_id = $1 AND recorded_at >= $2 \
             ORDER BY recorded_at DESC, id DESC"
        );
        sqlx::query_as::<_, DeviceInfo>(&query)
            .bind(device_id)
            .bind(since)
            .fetch_all(pool)
            .await
    }

    /// Get the most recent telemetry row per device.
    ///
    /// Ties on `recorded_at` are broken by insertion order.
    pub async fn latest_per_device(pool: &PgPool) -> Result<Vec<DeviceInfo>, sqlx::Error> {
        let query = format!(
            "SELECT DISTINCT ON (device_id) {COLUMNS} FROM device_info \
             ORDER BY device_id, recorded_at DESC, id DESC"
        );
        sqlx::query_as::<_, DeviceInfo>(&query)
            .fetch_all(pool)
            .await
    }

    /// Delete telemetry older than the given cutoff.
    ///
    /// Returns the number of rows deleted.
    pub async fn delete_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM device_info WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
