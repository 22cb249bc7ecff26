//! Application, device and connection queries for the Scriptgate server.

use scriptgate_core::db::unix_timestamp;
use scriptgate_crypto::AppKeyMaterial;
use sqlx::types::Json;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{Application, Device, DeviceConnection, STATUS_ACTIVE};

impl ServerDatabase {
    // =========================================================================
    // Application queries
    // =========================================================================

    /// Create an application with freshly generated key material.
    pub async fn create_application(
        &self,
        id: &str,
        name: &str,
        app_key: &str,
        keys: &AppKeyMaterial,
    ) -> Result<Application, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO applications (id, name, app_key, public_key, private_key, shared_secret, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(app_key)
        .bind(&keys.public_key_pem)
        .bind(&keys.private_key_pem)
        .bind(&keys.shared_secret)
        .bind(STATUS_ACTIVE)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_application(id).await
    }

    /// Get an application by ID.
    pub async fn get_application(&self, id: &str) -> Result<Application, DatabaseError> {
        sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Application {id}")))
    }

    /// Get an active application by its public app key.
    pub async fn get_active_application_by_key(
        &self,
        app_key: &str,
    ) -> Result<Application, DatabaseError> {
        sqlx::query_as::<_, Application>(
            "SELECT * FROM applications WHERE app_key = ? AND status = ?",
        )
        .bind(app_key)
        .bind(STATUS_ACTIVE)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound("Application".into()))
    }

    /// Look up an application by app key whatever its status.
    pub async fn find_application_by_key(
        &self,
        app_key: &str,
    ) -> Result<Option<Application>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE app_key = ?")
                .bind(app_key)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Set an application's status (e.g. `disabled`).
    pub async fn set_application_status(
        &self,
        id: &str,
        status: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE applications SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Device queries
    // =========================================================================

    /// Bind a device to an application with its entitlement snapshot.
    pub async fn create_device(
        &self,
        id: &str,
        app_id: &str,
        machine_id: &str,
        features: &[String],
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (id, app_id, machine_id, features, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(app_id)
        .bind(machine_id)
        .bind(Json(features))
        .bind(STATUS_ACTIVE)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_active_device(app_id, machine_id).await
    }

    /// Get an active device by `(app_id, machine_id)`.
    pub async fn get_active_device(
        &self,
        app_id: &str,
        machine_id: &str,
    ) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE app_id = ? AND machine_id = ? AND status = ?",
        )
        .bind(app_id)
        .bind(machine_id)
        .bind(STATUS_ACTIVE)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Device {machine_id}")))
    }

    /// Look up a device binding whatever its status.
    pub async fn find_device(
        &self,
        app_id: &str,
        machine_id: &str,
    ) -> Result<Option<Device>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE app_id = ? AND machine_id = ?")
                .bind(app_id)
                .bind(machine_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Replace a device's entitlement snapshot.
    pub async fn update_device_features(
        &self,
        app_id: &str,
        machine_id: &str,
        features: &[String],
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET features = ?, updated_at = ? WHERE app_id = ? AND machine_id = ?",
        )
        .bind(Json(features))
        .bind(unix_timestamp())
        .bind(app_id)
        .bind(machine_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Device connection audit trail
    // =========================================================================

    /// Record a newly authenticated session.
    pub async fn record_connection_opened(
        &self,
        conn: &DeviceConnection,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO device_connections (session_id, app_id, device_id, machine_id, remote_addr, connected_at, last_ping_at, status) VALUES (?, ?, ?, ?, ?, ?, ?, 'connected')",
        )
        .bind(&conn.session_id)
        .bind(&conn.app_id)
        .bind(&conn.device_id)
        .bind(&conn.machine_id)
        .bind(conn.remote_addr.as_deref())
        .bind(conn.connected_at)
        .bind(conn.last_ping_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Mark a session disconnected.
    pub async fn record_connection_closed(
        &self,
        session_id: &str,
        last_ping_at: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE device_connections SET status = 'disconnected', disconnected_at = ?, last_ping_at = MAX(last_ping_at, ?) WHERE session_id = ? AND status = 'connected'",
        )
        .bind(unix_timestamp())
        .bind(last_ping_at)
        .bind(session_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist the latest sign of life for a live session.
    pub async fn touch_connection(
        &self,
        session_id: &str,
        last_ping_at: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE device_connections SET last_ping_at = MAX(last_ping_at, ?) WHERE session_id = ? AND status = 'connected'",
        )
        .bind(last_ping_at)
        .bind(session_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a connection row by session ID.
    pub async fn get_connection(&self, session_id: &str) -> Result<DeviceConnection, DatabaseError> {
        sqlx::query_as::<_, DeviceConnection>(
            "SELECT * FROM device_connections WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Connection {session_id}")))
    }

    /// Mark every still-open connection row disconnected. Run at startup,
    /// since no session survives a restart.
    pub async fn close_stale_connections(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE device_connections SET status = 'disconnected', disconnected_at = ? WHERE status = 'connected'",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
