//! Secure script and delivery queries for the Scriptgate server.

use scriptgate_core::db::unix_timestamp;
use scriptgate_crypto::SealedContent;
use sqlx::types::Json;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{DeliveryStatus, ScriptDelivery, ScriptStatus, ScriptTotals, StoredScript};

/// Parameters for storing a new script.
pub struct NewScript<'a> {
    pub id: &'a str,
    pub app_id: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    pub script_type: &'a str,
    pub entry_point: &'a str,
    pub sealed: &'a SealedContent,
    pub original_size: i64,
    pub timeout_secs: i64,
    pub memory_limit_mb: i64,
    pub parameters: &'a str,
    pub required_features: &'a [String],
    pub allowed_devices: &'a [String],
}

/// Partial update of a script's delivery policy.
///
/// `expires_at` distinguishes "leave unchanged" (`None`) from "clear"
/// (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    pub rollout_percent: Option<i64>,
    pub required_features: Option<Vec<String>>,
    pub allowed_devices: Option<Vec<String>>,
    pub expires_at: Option<Option<i64>>,
}

/// Parameters for recording a prepared delivery.
pub struct NewDelivery<'a> {
    pub id: &'a str,
    pub script_id: &'a str,
    pub app_id: &'a str,
    pub device_id: Option<&'a str>,
    pub machine_id: &'a str,
    pub key_hint: &'a str,
    pub expires_at: i64,
}

/// A forward status change on a delivery.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryTransition<'a> {
    pub to: DeliveryStatus,
    pub at: i64,
    pub duration_ms: Option<i64>,
    pub result: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

impl ServerDatabase {
    // =========================================================================
    // Script queries
    // =========================================================================

    /// Store a new script as a draft.
    pub async fn create_script(&self, params: &NewScript<'_>) -> Result<StoredScript, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO secure_scripts (id, app_id, name, version, script_type, entry_point, encrypted_content, storage_key, content_hash, original_size, timeout_secs, memory_limit_mb, parameters, required_features, allowed_devices, rollout_percent, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 100, ?, ?, ?)",
        )
        .bind(params.id)
        .bind(params.app_id)
        .bind(params.name)
        .bind(params.version)
        .bind(params.script_type)
        .bind(params.entry_point)
        .bind(&params.sealed.ciphertext)
        .bind(&params.sealed.wrapped_key)
        .bind(&params.sealed.content_hash)
        .bind(params.original_size)
        .bind(params.timeout_secs)
        .bind(params.memory_limit_mb)
        .bind(params.parameters)
        .bind(Json(params.required_features))
        .bind(Json(params.allowed_devices))
        .bind(ScriptStatus::Draft)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_script(params.id).await
    }

    /// Get a script by ID.
    pub async fn get_script(&self, id: &str) -> Result<StoredScript, DatabaseError> {
        sqlx::query_as::<_, StoredScript>("SELECT * FROM secure_scripts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Script {id}")))
    }

    /// All scripts of an application, newest first.
    pub async fn list_scripts(&self, app_id: &str) -> Result<Vec<StoredScript>, DatabaseError> {
        let scripts = sqlx::query_as::<_, StoredScript>(
            "SELECT * FROM secure_scripts WHERE app_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(app_id)
        .fetch_all(self.pool())
        .await?;

        Ok(scripts)
    }

    /// Published scripts of an application, by name.
    pub async fn list_published_scripts(
        &self,
        app_id: &str,
    ) -> Result<Vec<StoredScript>, DatabaseError> {
        let scripts = sqlx::query_as::<_, StoredScript>(
            "SELECT * FROM secure_scripts WHERE app_id = ? AND status = ? ORDER BY name, rowid",
        )
        .bind(app_id)
        .bind(ScriptStatus::Published)
        .fetch_all(self.pool())
        .await?;

        Ok(scripts)
    }

    /// Replace a script's content and version; the script returns to draft.
    pub async fn replace_script_content(
        &self,
        id: &str,
        version: &str,
        sealed: &SealedContent,
        original_size: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE secure_scripts SET version = ?, encrypted_content = ?, storage_key = ?, content_hash = ?, original_size = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(version)
        .bind(&sealed.ciphertext)
        .bind(&sealed.wrapped_key)
        .bind(&sealed.content_hash)
        .bind(original_size)
        .bind(ScriptStatus::Draft)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Swap in a re-encrypted copy of unchanged content.
    ///
    /// Guarded on `content_hash` so a concurrent content update is never
    /// overwritten with the old plaintext. `updated_at` is left alone: the
    /// content a client sees did not change.
    pub async fn replace_storage_key(
        &self,
        id: &str,
        sealed: &SealedContent,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE secure_scripts SET encrypted_content = ?, storage_key = ? WHERE id = ? AND content_hash = ?",
        )
        .bind(&sealed.ciphertext)
        .bind(&sealed.wrapped_key)
        .bind(id)
        .bind(&sealed.content_hash)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Merge a policy update into a script (transactionally).
    pub async fn update_script_policy(
        &self,
        id: &str,
        update: &PolicyUpdate,
    ) -> Result<StoredScript, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing =
            sqlx::query_as::<_, StoredScript>("SELECT * FROM secure_scripts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("Script {id}")))?;

        let rollout = update.rollout_percent.unwrap_or(existing.rollout_percent);
        let features = update
            .required_features
            .as_deref()
            .unwrap_or(&existing.required_features.0);
        let allowed = update
            .allowed_devices
            .as_deref()
            .unwrap_or(&existing.allowed_devices.0);
        let expires_at = update.expires_at.unwrap_or(existing.expires_at);

        sqlx::query(
            "UPDATE secure_scripts SET rollout_percent = ?, required_features = ?, allowed_devices = ?, expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(rollout)
        .bind(Json(features))
        .bind(Json(allowed))
        .bind(expires_at)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let updated =
            sqlx::query_as::<_, StoredScript>("SELECT * FROM secure_scripts WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(updated)
    }

    /// Publish a script. Returns false if it was already published.
    pub async fn publish_script(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "UPDATE secure_scripts SET status = ?, published_at = ?, updated_at = ? WHERE id = ? AND status != ?",
        )
        .bind(ScriptStatus::Published)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(ScriptStatus::Published)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deprecate a script.
    pub async fn deprecate_script(&self, id: &str) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE secure_scripts SET status = ?, updated_at = ? WHERE id = ?")
                .bind(ScriptStatus::Deprecated)
                .bind(unix_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a script together with its delivery history.
    pub async fn delete_script(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM script_deliveries WHERE script_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM secure_scripts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Script counts and summed delivery counters of one application.
    pub async fn script_totals(&self, app_id: &str) -> Result<ScriptTotals, DatabaseError> {
        Ok(sqlx::query_as::<_, ScriptTotals>(
            "SELECT COUNT(*) AS total_scripts, \
             COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS published_count, \
             COALESCE(SUM(delivery_count), 0) AS total_deliveries, \
             COALESCE(SUM(execute_count), 0) AS total_executions, \
             COALESCE(SUM(success_count), 0) AS total_success, \
             COALESCE(SUM(fail_count), 0) AS total_fail \
             FROM secure_scripts WHERE app_id = ?",
        )
        .bind(ScriptStatus::Published)
        .bind(app_id)
        .fetch_one(self.pool())
        .await?)
    }

    // =========================================================================
    // Delivery queries
    // =========================================================================

    /// Record a pending delivery and bump the script's delivery counter.
    pub async fn create_delivery(
        &self,
        params: &NewDelivery<'_>,
    ) -> Result<ScriptDelivery, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO script_deliveries (id, script_id, app_id, device_id, machine_id, key_hint, expires_at, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id)
        .bind(params.script_id)
        .bind(params.app_id)
        .bind(params.device_id)
        .bind(params.machine_id)
        .bind(params.key_hint)
        .bind(params.expires_at)
        .bind(DeliveryStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE secure_scripts SET delivery_count = delivery_count + 1 WHERE id = ?")
            .bind(params.script_id)
            .execute(&mut *tx)
            .await?;

        let delivery =
            sqlx::query_as::<_, ScriptDelivery>("SELECT * FROM script_deliveries WHERE id = ?")
                .bind(params.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(delivery)
    }

    /// Get a delivery by ID.
    pub async fn get_delivery(&self, id: &str) -> Result<ScriptDelivery, DatabaseError> {
        sqlx::query_as::<_, ScriptDelivery>("SELECT * FROM script_deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Delivery {id}")))
    }

    /// Most recent delivery of a script to a machine.
    pub async fn latest_delivery(
        &self,
        script_id: &str,
        machine_id: &str,
    ) -> Result<ScriptDelivery, DatabaseError> {
        sqlx::query_as::<_, ScriptDelivery>(
            "SELECT * FROM script_deliveries WHERE script_id = ? AND machine_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(script_id)
        .bind(machine_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Delivery of {script_id} to {machine_id}")))
    }

    /// Page through a script's deliveries, newest first. Returns the page
    /// and the total row count for the filter.
    pub async fn list_deliveries(
        &self,
        script_id: &str,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ScriptDelivery>, i64), DatabaseError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM script_deliveries WHERE script_id = ? AND (? IS NULL OR status = ?)",
        )
        .bind(script_id)
        .bind(status)
        .bind(status)
        .fetch_one(self.pool())
        .await?;

        let rows = sqlx::query_as::<_, ScriptDelivery>(
            "SELECT * FROM script_deliveries WHERE script_id = ? AND (? IS NULL OR status = ?) ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(script_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok((rows, total))
    }

    /// Move a delivery from `expected` to `transition.to`.
    ///
    /// The status check and the parent script's execution counters are
    /// applied in one transaction; returns false (and changes nothing) if
    /// the delivery was no longer in `expected`.
    pub async fn advance_delivery(
        &self,
        id: &str,
        expected: DeliveryStatus,
        transition: &DeliveryTransition<'_>,
    ) -> Result<bool, DatabaseError> {
        let (executed_at, completed_at) = match transition.to {
            DeliveryStatus::Executing => (Some(transition.at), None),
            DeliveryStatus::Success | DeliveryStatus::Failed => {
                (Some(transition.at), Some(transition.at))
            }
            DeliveryStatus::Pending | DeliveryStatus::Expired => (None, None),
        };

        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE script_deliveries SET status = ?, executed_at = COALESCE(executed_at, ?), completed_at = COALESCE(?, completed_at), duration_ms = COALESCE(?, duration_ms), result = COALESCE(?, result), error_message = COALESCE(?, error_message), updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(transition.to)
        .bind(executed_at)
        .bind(completed_at)
        .bind(transition.duration_ms)
        .bind(transition.result)
        .bind(transition.error_message)
        .bind(transition.at)
        .bind(id)
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let (success, fail) = match transition.to {
            DeliveryStatus::Success => (1_i64, 0_i64),
            DeliveryStatus::Failed => (0, 1),
            _ => (0, 0),
        };
        if success + fail > 0 {
            sqlx::query(
                "UPDATE secure_scripts SET execute_count = execute_count + 1, success_count = success_count + ?, fail_count = fail_count + ? WHERE id = (SELECT script_id FROM script_deliveries WHERE id = ?)",
            )
            .bind(success)
            .bind(fail)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(true)
    }

    /// Expire pending or executing deliveries whose window has closed.
    pub async fn expire_deliveries(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE script_deliveries SET status = ?, updated_at = ? WHERE status IN (?, ?) AND expires_at < ?",
        )
        .bind(DeliveryStatus::Expired)
        .bind(now)
        .bind(DeliveryStatus::Pending)
        .bind(DeliveryStatus::Executing)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
