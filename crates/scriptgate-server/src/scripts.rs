//! Script management: create, update, publish and key rotation.

use serde::Serialize;
use tracing::info;

use scriptgate_crypto::vault;

use crate::error::ServiceError;
use crate::storage::{
    DeliveryStatus, NewScript, PolicyUpdate, ScriptDelivery, ScriptTotals, ServerDatabase,
    StoredScript,
};

pub const DEFAULT_TIMEOUT_SECS: i64 = 300;
pub const DEFAULT_MEMORY_LIMIT_MB: i64 = 512;

/// A new script as submitted by an operator.
#[derive(Debug, Clone, Default)]
pub struct ScriptDraft {
    pub name: String,
    pub version: String,
    pub script_type: String,
    pub entry_point: String,
    pub content: Vec<u8>,
    pub timeout_secs: Option<i64>,
    pub memory_limit_mb: Option<i64>,
    pub parameters: String,
    pub required_features: Vec<String>,
    pub allowed_devices: Vec<String>,
}

/// What a client needs to detect that a script changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptVersion {
    pub script_id: String,
    pub name: String,
    pub version: String,
    pub content_hash: String,
    pub updated_at: i64,
}

impl From<StoredScript> for ScriptVersion {
    fn from(s: StoredScript) -> Self {
        Self {
            script_id: s.id,
            name: s.name,
            version: s.version,
            content_hash: s.content_hash,
            updated_at: s.updated_at,
        }
    }
}

/// Per-application script overview.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScriptStats {
    #[serde(flatten)]
    pub totals: ScriptTotals,
    /// Successful share of finished executions, in percent.
    pub success_rate: f64,
}

impl From<ScriptTotals> for ScriptStats {
    #[allow(clippy::cast_precision_loss)]
    fn from(totals: ScriptTotals) -> Self {
        let finished = totals.total_success + totals.total_fail;
        let success_rate = if finished > 0 {
            totals.total_success as f64 / finished as f64 * 100.0
        } else {
            0.0
        };
        Self {
            totals,
            success_rate,
        }
    }
}

#[derive(Clone)]
pub struct ScriptService {
    db: ServerDatabase,
}

impl ScriptService {
    pub const fn new(db: ServerDatabase) -> Self {
        Self { db }
    }

    /// Encrypt and store a new draft script for `app_id`.
    pub async fn create(
        &self,
        app_id: &str,
        draft: &ScriptDraft,
    ) -> Result<StoredScript, ServiceError> {
        for (field, value) in [
            ("name", &draft.name),
            ("version", &draft.version),
            ("script_type", &draft.script_type),
        ] {
            if value.trim().is_empty() {
                return Err(ServiceError::validation(format!("{field} is required")));
            }
        }
        if draft.content.is_empty() {
            return Err(ServiceError::validation("content is required"));
        }
        let timeout_secs = positive("timeout", draft.timeout_secs, DEFAULT_TIMEOUT_SECS)?;
        let memory_limit_mb =
            positive("memory_limit", draft.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB)?;

        let app = self.db.get_application(app_id).await?;
        let sealed = vault::encrypt_pem(&draft.content, &app.public_key)
            .map_err(ServiceError::crypto("encrypting script"))?;

        let id = uuid::Uuid::new_v4().to_string();
        let script = self
            .db
            .create_script(&NewScript {
                id: &id,
                app_id,
                name: &draft.name,
                version: &draft.version,
                script_type: &draft.script_type,
                entry_point: &draft.entry_point,
                sealed: &sealed,
                original_size: byte_len(&draft.content),
                timeout_secs,
                memory_limit_mb,
                parameters: &draft.parameters,
                required_features: &draft.required_features,
                allowed_devices: &draft.allowed_devices,
            })
            .await?;

        info!(
            app_id = %app_id,
            script_id = %script.id,
            version = %script.version,
            size = script.original_size,
            "Script created"
        );
        Ok(script)
    }

    pub async fn get(&self, script_id: &str) -> Result<StoredScript, ServiceError> {
        Ok(self.db.get_script(script_id).await?)
    }

    pub async fn list(&self, app_id: &str) -> Result<Vec<StoredScript>, ServiceError> {
        self.db.get_application(app_id).await?;
        Ok(self.db.list_scripts(app_id).await?)
    }

    /// Replace the content and version. The script goes back to draft and
    /// must be published again.
    pub async fn update_content(
        &self,
        script_id: &str,
        version: &str,
        content: &[u8],
    ) -> Result<StoredScript, ServiceError> {
        if version.trim().is_empty() {
            return Err(ServiceError::validation("version is required"));
        }
        if content.is_empty() {
            return Err(ServiceError::validation("content is required"));
        }

        let script = self.db.get_script(script_id).await?;
        let app = self.db.get_application(&script.app_id).await?;
        let sealed = vault::encrypt_pem(content, &app.public_key)
            .map_err(ServiceError::crypto("encrypting script"))?;

        if !self
            .db
            .replace_script_content(script_id, version, &sealed, byte_len(content))
            .await?
        {
            return Err(ServiceError::NotFound(format!("Script {script_id}")));
        }

        info!(script_id = %script_id, version = %version, "Script content replaced");
        Ok(self.db.get_script(script_id).await?)
    }

    pub async fn update_policy(
        &self,
        script_id: &str,
        update: &PolicyUpdate,
    ) -> Result<StoredScript, ServiceError> {
        if let Some(pct) = update
            .rollout_percent
            .filter(|pct| !(0..=100).contains(pct))
        {
            return Err(ServiceError::validation(format!(
                "rollout_percent must be between 0 and 100, got {pct}"
            )));
        }

        let script = self.db.update_script_policy(script_id, update).await?;
        info!(
            script_id = %script_id,
            rollout_percent = script.rollout_percent,
            "Script policy updated"
        );
        Ok(script)
    }

    pub async fn publish(&self, script_id: &str) -> Result<StoredScript, ServiceError> {
        self.db.get_script(script_id).await?;
        if !self.db.publish_script(script_id).await? {
            return Err(ServiceError::Conflict(format!(
                "script {script_id} is already published"
            )));
        }
        info!(script_id = %script_id, "Script published");
        Ok(self.db.get_script(script_id).await?)
    }

    pub async fn deprecate(&self, script_id: &str) -> Result<StoredScript, ServiceError> {
        if !self.db.deprecate_script(script_id).await? {
            return Err(ServiceError::NotFound(format!("Script {script_id}")));
        }
        info!(script_id = %script_id, "Script deprecated");
        Ok(self.db.get_script(script_id).await?)
    }

    /// Remove a script and every delivery recorded for it.
    pub async fn delete(&self, script_id: &str) -> Result<(), ServiceError> {
        if !self.db.delete_script(script_id).await? {
            return Err(ServiceError::NotFound(format!("Script {script_id}")));
        }
        info!(script_id = %script_id, "Script deleted");
        Ok(())
    }

    pub async fn stats(&self, app_id: &str) -> Result<ScriptStats, ServiceError> {
        self.db.get_application(app_id).await?;
        Ok(self.db.script_totals(app_id).await?.into())
    }

    /// Re-encrypt the stored content under a fresh storage key.
    pub async fn rotate_key(&self, script_id: &str) -> Result<StoredScript, ServiceError> {
        let script = self.db.get_script(script_id).await?;
        let app = self.db.get_application(&script.app_id).await?;

        let plaintext = zeroize::Zeroizing::new(
            vault::decrypt_pem(
                &script.encrypted_content,
                &script.storage_key,
                &app.private_key,
            )
            .map_err(ServiceError::crypto("opening stored script"))?,
        );
        let sealed = vault::encrypt_pem(&plaintext, &app.public_key)
            .map_err(ServiceError::crypto("encrypting script"))?;

        if !self.db.replace_storage_key(script_id, &sealed).await? {
            return Err(ServiceError::Conflict(format!(
                "script {script_id} content changed during key rotation"
            )));
        }

        info!(script_id = %script_id, "Storage key rotated");
        Ok(self.db.get_script(script_id).await?)
    }

    /// Published scripts of the application owning `app_key`.
    pub async fn list_versions(&self, app_key: &str) -> Result<Vec<ScriptVersion>, ServiceError> {
        if app_key.trim().is_empty() {
            return Err(ServiceError::validation("app_key is required"));
        }
        let app = self.db.get_active_application_by_key(app_key).await?;
        let scripts = self.db.list_published_scripts(&app.id).await?;
        Ok(scripts.into_iter().map(ScriptVersion::from).collect())
    }

    /// One page of a script's deliveries and the total matching count.
    pub async fn deliveries(
        &self,
        script_id: &str,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ScriptDelivery>, i64), ServiceError> {
        let status = status
            .filter(|s| !s.is_empty())
            .map(str::parse::<DeliveryStatus>)
            .transpose()
            .map_err(ServiceError::Validation)?;

        self.db.get_script(script_id).await?;
        Ok(self
            .db
            .list_deliveries(script_id, status, limit, offset)
            .await?)
    }
}

fn positive(field: &str, value: Option<i64>, default: i64) -> Result<i64, ServiceError> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(ServiceError::validation(format!(
            "{field} must be positive, got {v}"
        ))),
    }
}

fn byte_len(content: &[u8]) -> i64 {
    i64::try_from(content.len()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use scriptgate_crypto::test_keys;

    use scriptgate_core::db::unix_timestamp;

    use super::*;
    use crate::storage::{DeliveryTransition, NewDelivery, ScriptStatus};

    async fn finish_delivery(db: &ServerDatabase, script_id: &str, id: &str, to: DeliveryStatus) {
        let now = unix_timestamp();
        db.create_delivery(&NewDelivery {
            id,
            script_id,
            app_id: "app1",
            device_id: None,
            machine_id: "M1",
            key_hint: "hint",
            expires_at: now + 300,
        })
        .await
        .unwrap();
        let transition = DeliveryTransition {
            to,
            at: now,
            duration_ms: None,
            result: None,
            error_message: None,
        };
        assert!(
            db.advance_delivery(id, DeliveryStatus::Pending, &transition)
                .await
                .unwrap()
        );
    }

    async fn setup() -> (ServerDatabase, ScriptService) {
        let db = ServerDatabase::open_in_memory().await.unwrap();
        db.create_application("app1", "Demo", "key-app1", test_keys())
            .await
            .unwrap();
        (db.clone(), ScriptService::new(db))
    }

    fn draft(content: &[u8]) -> ScriptDraft {
        ScriptDraft {
            name: "hello".into(),
            version: "1.0.0".into(),
            script_type: "python".into(),
            content: content.to_vec(),
            ..ScriptDraft::default()
        }
    }

    fn open(db_script: &StoredScript) -> Vec<u8> {
        vault::decrypt_pem(
            &db_script.encrypted_content,
            &db_script.storage_key,
            &test_keys().private_key_pem,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_applies_defaults_and_encrypts() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"print(1)\n")).await.unwrap();

        assert_eq!(script.status, ScriptStatus::Draft);
        assert_eq!(script.rollout_percent, 100);
        assert_eq!(script.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(script.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
        assert_eq!(script.original_size, 9);
        assert_eq!(script.content_hash, vault::content_hash(b"print(1)\n"));
        assert_ne!(script.encrypted_content, b"print(1)\n");
        assert_eq!(open(&script), b"print(1)\n");
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (_db, service) = setup().await;
        assert!(matches!(
            service.create("app1", &draft(b"")).await,
            Err(ServiceError::Validation(_))
        ));
        let mut no_name = draft(b"x");
        no_name.name.clear();
        assert!(matches!(
            service.create("app1", &no_name).await,
            Err(ServiceError::Validation(_))
        ));
        let mut bad_timeout = draft(b"x");
        bad_timeout.timeout_secs = Some(0);
        assert!(matches!(
            service.create("app1", &bad_timeout).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            service.create("nope", &draft(b"x")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn publish_twice_conflicts() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"x")).await.unwrap();
        let published = service.publish(&script.id).await.unwrap();
        assert_eq!(published.status, ScriptStatus::Published);
        assert!(published.published_at.is_some());
        assert!(matches!(
            service.publish(&script.id).await,
            Err(ServiceError::Conflict(_))
        ));

        let deprecated = service.deprecate(&script.id).await.unwrap();
        assert_eq!(deprecated.status, ScriptStatus::Deprecated);
        service.publish(&script.id).await.unwrap();
    }

    #[tokio::test]
    async fn content_update_unpublishes() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"v1")).await.unwrap();
        service.publish(&script.id).await.unwrap();

        let updated = service
            .update_content(&script.id, "2.0.0", b"version two")
            .await
            .unwrap();
        assert_eq!(updated.status, ScriptStatus::Draft);
        assert_eq!(updated.version, "2.0.0");
        assert_eq!(updated.original_size, 11);
        assert_eq!(open(&updated), b"version two");
        assert_ne!(updated.content_hash, script.content_hash);
    }

    #[tokio::test]
    async fn rollout_outside_range_is_rejected() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"x")).await.unwrap();
        for pct in [-1, 101] {
            let update = PolicyUpdate {
                rollout_percent: Some(pct),
                ..PolicyUpdate::default()
            };
            assert!(matches!(
                service.update_policy(&script.id, &update).await,
                Err(ServiceError::Validation(_))
            ));
        }
        let update = PolicyUpdate {
            rollout_percent: Some(25),
            ..PolicyUpdate::default()
        };
        let updated = service.update_policy(&script.id, &update).await.unwrap();
        assert_eq!(updated.rollout_percent, 25);
    }

    #[tokio::test]
    async fn rotation_keeps_hash_and_plaintext() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"print(1)\n")).await.unwrap();
        let rotated = service.rotate_key(&script.id).await.unwrap();

        assert_eq!(rotated.content_hash, script.content_hash);
        assert_eq!(rotated.updated_at, script.updated_at);
        assert_ne!(rotated.storage_key, script.storage_key);
        assert_ne!(rotated.encrypted_content, script.encrypted_content);
        assert_eq!(open(&rotated), b"print(1)\n");
    }

    #[tokio::test]
    async fn versions_list_only_published_scripts() {
        let (_db, service) = setup().await;
        let a = service.create("app1", &draft(b"a")).await.unwrap();
        let mut other = draft(b"b");
        other.name = "zeta".into();
        service.create("app1", &other).await.unwrap();
        service.publish(&a.id).await.unwrap();

        let versions = service.list_versions("key-app1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].script_id, a.id);
        assert_eq!(versions[0].content_hash, a.content_hash);

        assert!(matches!(
            service.list_versions("nope").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delivery_status_filter_is_validated() {
        let (_db, service) = setup().await;
        let script = service.create("app1", &draft(b"x")).await.unwrap();
        let (rows, total) = service
            .deliveries(&script.id, Some("pending"), 20, 0)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
        assert!(matches!(
            service.deliveries(&script.id, Some("bogus"), 20, 0).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_script_and_deliveries() {
        let (db, service) = setup().await;
        let script = service.create("app1", &draft(b"x")).await.unwrap();
        finish_delivery(&db, &script.id, "dl1", DeliveryStatus::Success).await;

        service.delete(&script.id).await.unwrap();
        assert!(matches!(
            service.get(&script.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            db.get_delivery("dl1").await,
            Err(crate::storage::DatabaseError::NotFound(_))
        ));
        assert!(matches!(
            service.delete(&script.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_sum_counters_across_scripts() {
        let (db, service) = setup().await;
        let empty = service.stats("app1").await.unwrap();
        assert_eq!(empty.totals, ScriptTotals::default());
        assert!(empty.success_rate.abs() < f64::EPSILON);

        let a = service.create("app1", &draft(b"a")).await.unwrap();
        let mut other = draft(b"b");
        other.name = "zeta".into();
        let b = service.create("app1", &other).await.unwrap();
        service.publish(&a.id).await.unwrap();

        finish_delivery(&db, &a.id, "dl1", DeliveryStatus::Success).await;
        finish_delivery(&db, &a.id, "dl2", DeliveryStatus::Success).await;
        finish_delivery(&db, &b.id, "dl3", DeliveryStatus::Success).await;
        finish_delivery(&db, &b.id, "dl4", DeliveryStatus::Failed).await;

        let stats = service.stats("app1").await.unwrap();
        assert_eq!(
            stats.totals,
            ScriptTotals {
                total_scripts: 2,
                published_count: 1,
                total_deliveries: 4,
                total_executions: 4,
                total_success: 3,
                total_fail: 1,
            }
        );
        assert!((stats.success_rate - 75.0).abs() < 1e-9);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["total_scripts"], 2);
        assert_eq!(json["success_rate"], 75.0);

        assert!(matches!(
            service.stats("nope").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
