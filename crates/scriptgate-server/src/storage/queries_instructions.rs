//! Real-time instruction queries for the Scriptgate server.

use scriptgate_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{InstructionStatus, RealtimeInstruction};

/// Parameters for persisting a signed instruction.
pub struct NewInstruction<'a> {
    pub id: &'a str,
    pub app_id: &'a str,
    pub device_id: Option<&'a str>,
    pub machine_id: Option<&'a str>,
    pub kind: &'a str,
    pub payload: &'a str,
    pub priority: i64,
    pub nonce: &'a str,
    pub issued_at: i64,
    pub signature: &'a str,
    pub expires_at: i64,
}

/// Upper bound on instruction list pages.
pub const MAX_INSTRUCTION_PAGE: i64 = 100;

impl ServerDatabase {
    /// Persist a pending instruction.
    pub async fn create_instruction(
        &self,
        params: &NewInstruction<'_>,
    ) -> Result<RealtimeInstruction, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO realtime_instructions (id, app_id, device_id, machine_id, kind, payload, priority, nonce, issued_at, signature, expires_at, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id)
        .bind(params.app_id)
        .bind(params.device_id)
        .bind(params.machine_id)
        .bind(params.kind)
        .bind(params.payload)
        .bind(params.priority)
        .bind(params.nonce)
        .bind(params.issued_at)
        .bind(params.signature)
        .bind(params.expires_at)
        .bind(InstructionStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_instruction(params.id).await
    }

    /// Get an instruction by ID.
    pub async fn get_instruction(&self, id: &str) -> Result<RealtimeInstruction, DatabaseError> {
        sqlx::query_as::<_, RealtimeInstruction>("SELECT * FROM realtime_instructions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Instruction {id}")))
    }

    /// Page through instructions, newest first, optionally for one app.
    pub async fn list_instructions(
        &self,
        app_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RealtimeInstruction>, i64), DatabaseError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM realtime_instructions WHERE (? IS NULL OR app_id = ?)",
        )
        .bind(app_id)
        .bind(app_id)
        .fetch_one(self.pool())
        .await?;

        let rows = sqlx::query_as::<_, RealtimeInstruction>(
            "SELECT * FROM realtime_instructions WHERE (? IS NULL OR app_id = ?) ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(app_id)
        .bind(app_id)
        .bind(limit.clamp(1, MAX_INSTRUCTION_PAGE))
        .bind(offset.max(0))
        .fetch_all(self.pool())
        .await?;

        Ok((rows, total))
    }

    /// Mark a pending instruction as handed to the hub.
    pub async fn mark_instruction_sent(&self, id: &str, at: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE realtime_instructions SET status = ?, sent_at = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(InstructionStatus::Sent)
        .bind(at)
        .bind(at)
        .bind(id)
        .bind(InstructionStatus::Pending)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move an instruction from `expected` to `to`, recording the device's
    /// result text. `acked_at` is set on the first acknowledgement only.
    pub async fn advance_instruction(
        &self,
        id: &str,
        expected: InstructionStatus,
        to: InstructionStatus,
        result: Option<&str>,
        at: i64,
    ) -> Result<bool, DatabaseError> {
        let acked_at = matches!(
            to,
            InstructionStatus::Acked | InstructionStatus::Executed | InstructionStatus::Failed
        )
        .then_some(at);

        let outcome = sqlx::query(
            "UPDATE realtime_instructions SET status = ?, result = COALESCE(?, result), acked_at = COALESCE(acked_at, ?), updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(result)
        .bind(acked_at)
        .bind(at)
        .bind(id)
        .bind(expected)
        .execute(self.pool())
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Expire pending or sent instructions whose window has closed.
    pub async fn expire_instructions(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE realtime_instructions SET status = ?, updated_at = ? WHERE status IN (?, ?) AND expires_at < ?",
        )
        .bind(InstructionStatus::Expired)
        .bind(now)
        .bind(InstructionStatus::Pending)
        .bind(InstructionStatus::Sent)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
