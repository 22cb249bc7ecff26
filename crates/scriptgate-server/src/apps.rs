//! Seeding of applications and devices.
//!
//! Tenant and license management live outside this server. These helpers
//! only create the rows that delivery and the command channel read.

use serde::Serialize;
use tracing::info;

use scriptgate_crypto::{AppKeyMaterial, CryptoError, random_hex};

use crate::error::ServiceError;
use crate::storage::{Device, STATUS_ACTIVE, ServerDatabase};

/// Random bytes behind a generated app key (hex encoded).
pub const APP_KEY_BYTES: usize = 16;

/// A new application as returned to the operator. The private key never
/// leaves the server.
#[derive(Clone, Serialize)]
pub struct ProvisionedApp {
    pub id: String,
    pub name: String,
    pub app_key: String,
    pub public_key: String,
    pub shared_secret: String,
}

impl std::fmt::Debug for ProvisionedApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedApp")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("app_key", &self.app_key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct AppService {
    db: ServerDatabase,
    rsa_key_bits: usize,
}

impl AppService {
    pub const fn new(db: ServerDatabase, rsa_key_bits: usize) -> Self {
        Self { db, rsa_key_bits }
    }

    /// Create an application with fresh key material. `app_key` is
    /// generated when not given.
    pub async fn create(
        &self,
        name: &str,
        app_key: Option<&str>,
    ) -> Result<ProvisionedApp, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::validation("name is required"));
        }
        let app_key = app_key
            .filter(|k| !k.trim().is_empty())
            .map_or_else(|| random_hex(APP_KEY_BYTES), str::to_string);

        if self.db.find_application_by_key(&app_key).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "app_key {app_key} is already in use"
            )));
        }

        // RSA generation takes long enough to stall a runtime worker.
        let bits = self.rsa_key_bits;
        let keys = tokio::task::spawn_blocking(move || AppKeyMaterial::generate(bits))
            .await
            .map_err(|e| ServiceError::Crypto {
                context: "generating application keys",
                source: CryptoError::KeyGeneration(e.to_string()),
            })?
            .map_err(ServiceError::crypto("generating application keys"))?;

        let id = uuid::Uuid::new_v4().to_string();
        let app = self
            .db
            .create_application(&id, name, &app_key, &keys)
            .await?;

        info!(app_id = %app.id, name = %app.name, bits, "Application created");
        Ok(ProvisionedApp {
            id: app.id,
            name: app.name,
            app_key: app.app_key,
            public_key: app.public_key,
            shared_secret: app.shared_secret,
        })
    }

    /// Bind a device to an application, or replace the entitlement
    /// snapshot of one already bound.
    pub async fn register_device(
        &self,
        app_id: &str,
        machine_id: &str,
        features: &[String],
    ) -> Result<Device, ServiceError> {
        if machine_id.trim().is_empty() {
            return Err(ServiceError::validation("machine_id is required"));
        }
        self.db.get_application(app_id).await?;

        match self.db.find_device(app_id, machine_id).await? {
            Some(device) if device.status != STATUS_ACTIVE => {
                return Err(ServiceError::Conflict(format!(
                    "device {machine_id} is {}",
                    device.status
                )));
            }
            Some(_) => {
                self.db
                    .update_device_features(app_id, machine_id, features)
                    .await?;
                info!(app_id = %app_id, machine_id = %machine_id, "Device features replaced");
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.db
                    .create_device(&id, app_id, machine_id, features)
                    .await?;
                info!(app_id = %app_id, machine_id = %machine_id, "Device registered");
            }
        }

        Ok(self.db.get_active_device(app_id, machine_id).await?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use scriptgate_crypto::test_keys;

    use super::*;

    async fn service() -> (ServerDatabase, AppService) {
        let db = ServerDatabase::open_in_memory().await.unwrap();
        (db.clone(), AppService::new(db, 1024))
    }

    #[tokio::test]
    async fn create_generates_key_and_material() {
        let (db, apps) = service().await;
        let app = apps.create("Demo", None).await.unwrap();

        assert_eq!(app.app_key.len(), APP_KEY_BYTES * 2);
        assert!(app.public_key.contains("PUBLIC KEY"));
        let stored = db.get_active_application_by_key(&app.app_key).await.unwrap();
        assert_eq!(stored.id, app.id);
        assert!(stored.private_key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn duplicate_app_key_conflicts() {
        let (db, apps) = service().await;
        db.create_application("app1", "Demo", "key-app1", test_keys())
            .await
            .unwrap();

        let err = apps.create("Other", Some("key-app1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        db.set_application_status("app1", "disabled").await.unwrap();
        assert!(matches!(
            apps.create("Other", Some("key-app1")).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            apps.create("  ", None).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn register_device_is_an_upsert() {
        let (db, apps) = service().await;
        db.create_application("app1", "Demo", "key-app1", test_keys())
            .await
            .unwrap();

        let first = apps
            .register_device("app1", "M1", &["pro".to_string()])
            .await
            .unwrap();
        assert_eq!(first.features.0, ["pro"]);

        let second = apps.register_device("app1", "M1", &[]).await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.features.0.is_empty());

        assert!(matches!(
            apps.register_device("nope", "M1", &[]).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            apps.register_device("app1", "", &[]).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn inactive_device_is_not_rebound() {
        let (db, apps) = service().await;
        db.create_application("app1", "Demo", "key-app1", test_keys())
            .await
            .unwrap();
        apps.register_device("app1", "M1", &[]).await.unwrap();
        sqlx::query("UPDATE devices SET status = 'disabled' WHERE machine_id = 'M1'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(matches!(
            apps.register_device("app1", "M1", &["pro".to_string()]).await,
            Err(ServiceError::Conflict(_))
        ));
        let stored = db.find_device("app1", "M1").await.unwrap().unwrap();
        assert_eq!(stored.status, "disabled");
        assert!(stored.features.0.is_empty());
    }
}
