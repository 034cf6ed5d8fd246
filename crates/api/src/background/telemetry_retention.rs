//! Periodic cleanup of old telemetry records.
//!
//! Deletes rows from `device_info` older than the configured retention
//! period. Runs on a fixed interval using `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::gateway::PersistenceGateway;

/// How often the cleanup job runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Delete telemetry older than `retention_hours` once. Returns rows removed.
pub async fn purge_once(gateway: &dyn PersistenceGateway, retention_hours: i64) -> Option<u64> {
    let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
    match gateway.delete_telemetry_older_than(cutoff).await {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!(deleted, "Telemetry retention: purged old rows");
            } else {
                tracing::debug!("Telemetry retention: no rows to purge");
            }
            Some(deleted)
        }
        Err(e) => {
            tracing::error!(error = %e, "Telemetry retention: cleanup failed");
            None
        }
    }
}

/// Run the telemetry retention loop every `interval` until `cancel` fires.
pub async fn run(
    gateway: Arc<dyn PersistenceGateway>,
    retention_hours: i64,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_hours,
        interval_secs = interval.as_secs(),
        "Telemetry retention job started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Telemetry retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                purge_once(gateway.as_ref(), retention_hours).await;
            }
        }
    }
}
