//! Persistence gateway: the store contract the session path consumes.
//!
//! [`PgGateway`] is the production implementation over the db crate
//! repositories. [`InMemoryGateway`] keeps the same semantics in process and
//! backs the test suites (it can also inject failures and latency).
//!
//! Every call is bounded by a store timeout so a slow database can never
//! hang a device's read loop. Callers never retry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetwatch_core::device::DEFAULT_STORE_TIMEOUT_SECS;
use fleetwatch_core::protocol::TelemetrySnapshot;
use fleetwatch_core::types::Timestamp;
use fleetwatch_db::models::device::{CreateDeviceInfo, DeviceInfo};
use fleetwatch_db::repositories::{DeviceInfoRepo, DeviceOnlineRepo};
use fleetwatch_db::DbPool;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store refused the call without a driver error (used by the
    /// in-memory gateway's failure injection).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Store contract for presence and telemetry history.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Durably record `device_id` as online. Refreshes `at` for an existing row.
    async fn record_online(&self, device_id: &str, at: Timestamp) -> Result<(), GatewayError>;

    /// Remove the presence record. Removing an absent record is not an error.
    async fn record_offline(&self, device_id: &str) -> Result<(), GatewayError>;

    /// Append one telemetry record. Records are never updated in place.
    async fn append_telemetry(
        &self,
        device_id: &str,
        at: Timestamp,
        snapshot: &TelemetrySnapshot,
    ) -> Result<(), GatewayError>;

    /// Telemetry for one device recorded at or after `since`, newest first.
    async fn telemetry_for_device(
        &self,
        device_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DeviceInfo>, GatewayError>;

    /// The newest telemetry record of every device, ordered by device id.
    async fn latest_per_device(&self) -> Result<Vec<DeviceInfo>, GatewayError>;

    async fn delete_telemetry_older_than(&self, cutoff: Timestamp) -> Result<u64, GatewayError>;

    /// Drop every presence record. Called once at startup.
    async fn clear_online(&self) -> Result<u64, GatewayError>;

    async fn health_check(&self) -> Result<(), GatewayError>;
}

/// Run `fut` under `limit`, mapping expiry to [`GatewayError::Timeout`].
async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<GatewayError>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| GatewayError::Timeout(limit))?
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// PostgreSQL-backed gateway.
#[derive(Clone)]
pub struct PgGateway {
    pool: DbPool,
    timeout: Duration,
}

impl PgGateway {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn record_online(&self, device_id: &str, at: Timestamp) -> Result<(), GatewayError> {
        bounded(self.timeout, DeviceOnlineRepo::upsert(&self.pool, device_id, at)).await?;
        Ok(())
    }

    async fn record_offline(&self, device_id: &str) -> Result<(), GatewayError> {
        bounded(self.timeout, DeviceOnlineRepo::delete(&self.pool, device_id)).await?;
        Ok(())
    }

    async fn append_telemetry(
        &self,
        device_id: &str,
        at: Timestamp,
        snapshot: &TelemetrySnapshot,
    ) -> Result<(), GatewayError> {
        let input = CreateDeviceInfo::from_snapshot(device_id, at, snapshot);
        bounded(self.timeout, DeviceInfoRepo::insert(&self.pool, &input)).await?;
        Ok(())
    }

    async fn telemetry_for_device(
        &self,
        device_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DeviceInfo>, GatewayError> {
        bounded(
            self.timeout,
            DeviceInfoRepo::list_for_device(&self.pool, device_id, since),
        )
        .await
    }

    async fn latest_per_device(&self) -> Result<Vec<DeviceInfo>, GatewayError> {
        bounded(self.timeout, DeviceInfoRepo::latest_per_device(&self.pool)).await
    }

    async fn delete_telemetry_older_than(&self, cutoff: Timestamp) -> Result<u64, GatewayError> {
        // Retention sweeps can touch many rows; give them more headroom.
        bounded(
            self.timeout * 12,
            DeviceInfoRepo::delete_older_than(&self.pool, cutoff),
        )
        .await
    }

    async fn clear_online(&self) -> Result<u64, GatewayError> {
        bounded(self.timeout, DeviceOnlineRepo::clear(&self.pool)).await
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        bounded(self.timeout, fleetwatch_db::health_check(&self.pool)).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    online: BTreeMap<String, Timestamp>,
    telemetry: Vec<DeviceInfo>,
    next_id: i64,
}

/// Process-local gateway with the same semantics as [`PgGateway`].
pub struct InMemoryGateway {
    store: Mutex<MemoryStore>,
    timeout: Duration,
    latency: Mutex<Duration>,
    failing: AtomicBool,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            store: Mutex::new(MemoryStore::default()),
            timeout,
            latency: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`GatewayError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency` before it touches the store.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }

    /// All telemetry records for `device_id`, oldest first.
    pub async fn telemetry_for(&self, device_id: &str) -> Vec<DeviceInfo> {
        self.store
            .lock()
            .await
            .telemetry
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn telemetry_count(&self) -> usize {
        self.store.lock().await.telemetry.len()
    }

    /// Device ids with a presence record, sorted.
    pub async fn online_ids(&self) -> Vec<String> {
        self.store.lock().await.online.keys().cloned().collect()
    }

    async fn enter(&self) -> Result<(), GatewayError> {
        let latency = *self.latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn record_online(&self, device_id: &str, at: Timestamp) -> Result<(), GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            self.store
                .lock()
                .await
                .online
                .insert(device_id.to_string(), at);
            Ok::<_, GatewayError>(())
        })
        .await
    }

    async fn record_offline(&self, device_id: &str) -> Result<(), GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            self.store.lock().await.online.remove(device_id);
            Ok::<_, GatewayError>(())
        })
        .await
    }

    async fn append_telemetry(
        &self,
        device_id: &str,
        at: Timestamp,
        snapshot: &TelemetrySnapshot,
    ) -> Result<(), GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let input = CreateDeviceInfo::from_snapshot(device_id, at, snapshot);
            let mut store = self.store.lock().await;
            store.next_id += 1;
            let record = DeviceInfo {
                id: store.next_id,
                recorded_at: input.recorded_at,
                device_id: input.device_id,
                project: input.project,
                models: input.models,
                gpu_name: input.gpu_name,
                utilization_gpu: input.utilization_gpu,
                memory_total: input.memory_total,
                memory_used: input.memory_used,
                created_at: Utc::now(),
            };
            store.telemetry.push(record);
            Ok::<_, GatewayError>(())
        })
        .await
    }

    async fn telemetry_for_device(
        &self,
        device_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DeviceInfo>, GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let store = self.store.lock().await;
            let mut rows: Vec<DeviceInfo> = store
                .telemetry
                .iter()
                .filter(|r| r.device_id == device_id && r.recorded_at >= since)
                .cloned()
                .collect();
            rows.sort_by(|a, b| (b.recorded_at, b.id).cmp(&(a.recorded_at, a.id)));
            Ok::<_, GatewayError>(rows)
        })
        .await
    }

    async fn latest_per_device(&self) -> Result<Vec<DeviceInfo>, GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let store = self.store.lock().await;
            let mut latest: HashMap<&str, &DeviceInfo> = HashMap::new();
            for record in &store.telemetry {
                latest
                    .entry(record.device_id.as_str())
                    .and_modify(|current| {
                        if (record.recorded_at, record.id) > (current.recorded_at, current.id) {
                            *current = record;
                        }
                    })
                    .or_insert(record);
            }
            let mut rows: Vec<DeviceInfo> = latest.into_values().cloned().collect();
            rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            Ok::<_, GatewayError>(rows)
        })
        .await
    }

    async fn delete_telemetry_older_than(&self, cutoff: Timestamp) -> Result<u64, GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let mut store = self.store.lock().await;
            let before = store.telemetry.len();
            store.telemetry.retain(|r| r.recorded_at >= cutoff);
            Ok::<_, GatewayError>((before - store.telemetry.len()) as u64)
        })
        .await
    }

    async fn clear_online(&self) -> Result<u64, GatewayError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let mut store = self.store.lock().await;
            let count = store.online.len() as u64;
            store.online.clear();
            Ok::<_, GatewayError>(count)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        bounded(self.timeout, self.enter()).await
    }
}
