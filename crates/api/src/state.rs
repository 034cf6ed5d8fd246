use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::gateway::PersistenceGateway;
use crate::metrics::PrometheusMetrics;
use crate::registry::{DeviceRegistry, OnlineRegistry};
use crate::ws::SessionManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Presence and telemetry store.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Which devices currently hold a session.
    pub registry: Arc<dyn DeviceRegistry>,
    /// Last-known telemetry gauges.
    pub metrics: Arc<PrometheusMetrics>,
    /// Live device sessions.
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Wire the registry, metrics sink and session manager around `gateway`.
    pub fn new(
        config: ServerConfig,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, prometheus::Error> {
        let metrics = Arc::new(PrometheusMetrics::new(config.metrics_job_name.clone())?);
        let registry = Arc::new(OnlineRegistry::new(Arc::clone(&gateway)));
        Ok(Self {
            config: Arc::new(config),
            gateway,
            registry,
            metrics,
            sessions: Arc::new(SessionManager::new()),
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_timeout_secs)
    }
}
