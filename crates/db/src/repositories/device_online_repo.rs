//! Repository for the `device_online` table.

use sqlx::PgPool;
use fleetwatch_core::types::Timestamp;

use crate::models::device::DeviceOnline;

/// Provides presence operations for online devices.
pub struct DeviceOnlineRepo;

impl DeviceOnlineRepo {
    /// Record `device_id` as online, refreshing `online_at` when a row
    /// already exists.
    pub async fn upsert(
        pool: &PgPool,
        device_id: &str,
        online_at: Timestamp,
    ) -> Result<DeviceOnline, sqlx::Error> {
        sqlx::query_as::<_, DeviceOnline>(
            "INSERT INTO device_online (device_id, online_at) VALUES ($1, $2) \
             ON CONFLICT (device_id) DO UPDATE SET online_at = EXCLUDED.online_at \
             RETURNING device_id, online_at",
        )
        .bind(device_id)
        .bind(online_at)
        .fetch_one(pool)
        .await
    }

    /// Remove the presence row for `device_id`. Removing an absent row is
    /// not an error.
    ///
    /// Returns the number of rows deleted (0 or 1).
    pub async fn delete(pool: &PgPool, device_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM device_online WHERE device_id = $1")
            .bind(device_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every presence row. Called once at startup, before any
    /// session exists.
    pub async fn clear(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM device_online")
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
