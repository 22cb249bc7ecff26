//! CommandHub: live device sessions and signed real-time instructions.
//!
//! The hub is built once at startup and cloned into every handler. It owns
//! the session [`Registry`], authenticates WebSocket handshakes, pushes
//! signed instructions and ingests device results.

pub mod command;
pub mod protocol;
pub mod registry;
pub mod session;

use std::time::Duration;

use scriptgate_core::ServerConfig;

use crate::delivery::DeliveryService;
use crate::error::ServiceError;
use crate::lifecycle::LifecycleTracker;
use crate::storage::{Application, Device, ServerDatabase};

pub use command::SendOutcome;
pub use protocol::{ClientMessage, ServerMessage, SignedInstruction};
pub use registry::{DeviceSession, OnlineDevice, Registry};

/// Timeouts and limits of the WebSocket channel.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub outbound_buffer: usize,
    pub instruction_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            outbound_buffer: 256,
            instruction_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&ServerConfig> for HubConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout(),
            write_timeout: config.write_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            pong_timeout: config.pong_timeout(),
            outbound_buffer: config.outbound_buffer,
            instruction_ttl: config.instruction_ttl(),
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    registry: Registry,
    db: ServerDatabase,
    tracker: LifecycleTracker,
    deliveries: DeliveryService,
    config: HubConfig,
}

impl Hub {
    pub fn new(
        db: ServerDatabase,
        tracker: LifecycleTracker,
        deliveries: DeliveryService,
        config: HubConfig,
    ) -> Self {
        Self {
            registry: Registry::new(),
            db,
            tracker,
            deliveries,
            config,
        }
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Online devices of an application.
    pub async fn list_online(&self, app_id: &str) -> Result<Vec<OnlineDevice>, ServiceError> {
        self.db.get_application(app_id).await?;
        Ok(self.registry.list_online(app_id).await)
    }

    /// Resolve a handshake to an active application and device.
    pub async fn authenticate(
        &self,
        app_key: &str,
        machine_id: &str,
    ) -> Result<(Application, Device), ServiceError> {
        if app_key.is_empty() || machine_id.is_empty() {
            return Err(ServiceError::validation("app_key and machine_id are required"));
        }
        let app = self.db.get_active_application_by_key(app_key).await?;
        let device = self.db.get_active_device(&app.id, machine_id).await?;
        Ok((app, device))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use scriptgate_crypto::test_keys;

    use super::*;

    /// A hub over a fresh in-memory database with one app (`app1`,
    /// key `key-app1`) and devices `M1`, `M2`.
    pub async fn hub_with(config: HubConfig) -> (ServerDatabase, Hub) {
        let db = ServerDatabase::open_in_memory().await.unwrap();
        db.create_application("app1", "Demo", "key-app1", test_keys())
            .await
            .unwrap();
        db.create_device("d1", "app1", "M1", &[]).await.unwrap();
        db.create_device("d2", "app1", "M2", &[]).await.unwrap();

        let tracker = LifecycleTracker::new(db.clone());
        let deliveries =
            DeliveryService::new(db.clone(), tracker.clone(), Duration::from_secs(300));
        let hub = Hub::new(db.clone(), tracker, deliveries, config);
        (db, hub)
    }

    pub async fn hub() -> (ServerDatabase, Hub) {
        hub_with(HubConfig::default()).await
    }
}
