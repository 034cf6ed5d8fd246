//! Device registry: which devices currently hold a session.
//!
//! The in-process set is authoritative for admission. `mark_online` claims
//! the id and performs the durable write in one call, so there is no
//! separate check followed by a write that two sessions could interleave.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::gateway::{GatewayError, PersistenceGateway};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Device {0} is already online")]
    AlreadyOnline(String),

    #[error(transparent)]
    Store(#[from] GatewayError),
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn is_online(&self, device_id: &str) -> bool;

    /// Atomically claim `device_id`. Fails with
    /// [`RegistryError::AlreadyOnline`] when another session holds it.
    async fn mark_online(&self, device_id: &str) -> Result<(), RegistryError>;

    /// Release `device_id`. Releasing an offline device is not an error.
    /// The in-process claim is dropped even when the durable delete fails.
    async fn mark_offline(&self, device_id: &str) -> Result<(), RegistryError>;

    /// Online device ids, sorted.
    async fn online_devices(&self) -> Vec<String>;
}

/// Registry backed by an in-process set plus the persistence gateway.
pub struct OnlineRegistry {
    online: Mutex<HashSet<String>>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl OnlineRegistry {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            online: Mutex::new(HashSet::new()),
            gateway,
        }
    }
}

#[async_trait]
impl DeviceRegistry for OnlineRegistry {
    async fn is_online(&self, device_id: &str) -> bool {
        self.online.lock().await.contains(device_id)
    }

    async fn mark_online(&self, device_id: &str) -> Result<(), RegistryError> {
        if !self.online.lock().await.insert(device_id.to_string()) {
            return Err(RegistryError::AlreadyOnline(device_id.to_string()));
        }

        // The claim is held while the durable write runs; a concurrent
        // claim for the same id is rejected above.
        if let Err(e) = self.gateway.record_online(device_id, Utc::now()).await {
            self.online.lock().await.remove(device_id);
            return Err(e.into());
        }
        Ok(())
    }

    async fn mark_offline(&self, device_id: &str) -> Result<(), RegistryError> {
        // The claim stays held until the durable delete has finished, so a
        // reconnect cannot upsert a row that this delete then removes.
        let deleted = self.gateway.record_offline(device_id).await;
        self.online.lock().await.remove(device_id);
        deleted?;
        Ok(())
    }

    async fn online_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.online.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }
}
