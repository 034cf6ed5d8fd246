use std::collections::HashMap;
use std::time::Duration;

use fleetwatch_core::types::Timestamp;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsSink;
use crate::registry::DeviceRegistry;
use crate::ws::session::cleanup_device;

/// How often `shutdown_all` re-checks whether sessions have drained.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on cleanup for sessions that had to be aborted.
const STRAGGLER_CLEANUP_BUDGET: Duration = Duration::from_secs(2);

/// Bookkeeping for one live device connection.
pub struct SessionEntry {
    /// Device named by an Online message, set before the claim is attempted
    /// and cleared again if the claim fails.
    pub device_id: Option<String>,
    /// When the connection was upgraded.
    pub connected_at: Timestamp,
    /// Handle used to force-stop the session task after the grace period.
    abort: Option<AbortHandle>,
}

/// Tracks every live device session so shutdown can drain them.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the token the session must watch; it is cancelled when the
    /// server shuts down.
    pub async fn add(&self, conn_id: String) -> CancellationToken {
        let entry = SessionEntry {
            device_id: None,
            connected_at: chrono::Utc::now(),
            abort: None,
        };
        self.sessions.write().await.insert(conn_id, entry);
        self.shutdown.child_token()
    }

    /// Attach the abort handle of the task driving `conn_id`.
    pub async fn attach(&self, conn_id: &str, abort: AbortHandle) {
        if let Some(entry) = self.sessions.write().await.get_mut(conn_id) {
            entry.abort = Some(abort);
        }
    }

    /// Record the device `conn_id` is claiming or holds.
    pub async fn bind_device(&self, conn_id: &str, device_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(conn_id) {
            entry.device_id = Some(device_id.to_string());
        }
    }

    /// Forget the device of `conn_id` after a failed claim.
    pub async fn unbind_device(&self, conn_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(conn_id) {
            entry.device_id = None;
        }
    }

    /// Remove a connection, returning the device it was bound to.
    pub async fn remove(&self, conn_id: &str) -> Option<String> {
        self.sessions
            .write()
            .await
            .remove(conn_id)
            .and_then(|entry| entry.device_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every session and wait up to `grace` for them to finish.
    ///
    /// Sessions still running after the grace period are aborted and their
    /// devices are cleaned up here on a best-effort basis. Returns the
    /// number of sessions that had to be aborted.
    pub async fn shutdown_all(
        &self,
        grace: Duration,
        registry: &dyn DeviceRegistry,
        sink: &dyn MetricsSink,
    ) -> usize {
        let count = self.connection_count().await;
        tracing::info!(count, grace_ms = grace.as_millis() as u64, "Closing device sessions");
        self.shutdown.cancel();

        let deadline = Instant::now() + grace;
        while self.connection_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let stragglers: Vec<(String, SessionEntry)> =
            self.sessions.write().await.drain().collect();
        if stragglers.is_empty() {
            tracing::info!("All device sessions closed");
            return 0;
        }

        for (conn_id, entry) in &stragglers {
            tracing::warn!(
                conn_id = %conn_id,
                device_id = entry.device_id.as_deref().unwrap_or(""),
                connected_at = %entry.connected_at,
                "Aborting session that outlived the shutdown grace period"
            );
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }

        let cleanup = async {
            for (_, entry) in &stragglers {
                if let Some(device_id) = &entry.device_id {
                    cleanup_device(registry, sink, device_id).await;
                }
            }
        };
        if tokio::time::timeout(STRAGGLER_CLEANUP_BUDGET, cleanup)
            .await
            .is_err()
        {
            tracing::warn!("Straggler cleanup did not finish within its budget");
        }

        stragglers.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
