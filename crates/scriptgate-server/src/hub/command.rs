//! Signed instruction dispatch and result ingestion.

use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use scriptgate_core::db::unix_timestamp;
use scriptgate_crypto::{random_hex, signing};

use super::Hub;
use super::protocol::{InstructionResult, ScriptResult, ServerMessage, SignedInstruction};
use super::registry::DeviceSession;
use crate::delivery::ExecutionReport;
use crate::error::ServiceError;
use crate::lifecycle::parse_instruction_outcome;
use crate::storage::{
    DatabaseError, InstructionStatus, NewInstruction, RealtimeInstruction, STATUS_ACTIVE,
    ScriptDelivery,
};

const NONCE_BYTES: usize = 16;

/// Result of `send_instruction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub instruction_id: String,
    /// Unicast: the target's queue accepted it. Broadcast: always true.
    pub sent: bool,
    pub expires_at: i64,
}

impl Hub {
    /// Persist, sign and push an instruction. `machine_id = None`
    /// broadcasts to every online device of the app.
    pub async fn send_instruction(
        &self,
        app_id: &str,
        machine_id: Option<&str>,
        kind: &str,
        payload: &serde_json::Value,
        priority: i64,
    ) -> Result<SendOutcome, ServiceError> {
        if app_id.is_empty() {
            return Err(ServiceError::validation("app_id is required"));
        }
        if kind.trim().is_empty() {
            return Err(ServiceError::validation("type is required"));
        }
        let machine_id = machine_id.filter(|m| !m.is_empty());

        let app = self.db.get_application(app_id).await?;
        if app.status != STATUS_ACTIVE {
            return Err(ServiceError::NotFound(format!("Application {app_id}")));
        }
        let device_id = match machine_id {
            Some(machine_id) => match self.db.get_active_device(app_id, machine_id).await {
                Ok(device) => Some(device.id),
                Err(DatabaseError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let payload_json = serde_json::to_string(payload)
            .map_err(|e| ServiceError::validation(format!("invalid payload: {e}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        let nonce = random_hex(NONCE_BYTES);
        let issued_at = unix_timestamp();
        let ttl = i64::try_from(self.config.instruction_ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = issued_at.saturating_add(ttl);

        let message =
            signing::instruction_message(&id, kind, &payload_json, issued_at, &nonce, expires_at);
        let signature = signing::sign_pem(&app.private_key, message.as_bytes())
            .map_err(ServiceError::crypto("signing instruction"))?;

        self.tracker
            .record_instruction(&NewInstruction {
                id: &id,
                app_id,
                device_id: device_id.as_deref(),
                machine_id,
                kind,
                payload: &payload_json,
                priority,
                nonce: &nonce,
                issued_at,
                signature: &signature,
                expires_at,
            })
            .await?;

        let raw = RawValue::from_string(payload_json)
            .map_err(|e| ServiceError::validation(format!("invalid payload: {e}")))?;
        let frame = ServerMessage::Instruction(SignedInstruction {
            id: id.clone(),
            kind: kind.to_string(),
            payload: raw,
            timestamp: issued_at,
            nonce,
            signature,
            expires: expires_at,
        });

        let sent = match machine_id {
            Some(machine_id) => self.registry.send_to_device(app_id, machine_id, frame).await,
            None => {
                let recipients = self.registry.broadcast_to_app(app_id, &frame).await;
                debug!(app_id = %app_id, instruction_id = %id, recipients, "Instruction broadcast");
                true
            }
        };
        if sent {
            self.tracker.mark_sent(&id, unix_timestamp()).await?;
        }

        info!(
            app_id = %app_id,
            machine_id = machine_id.unwrap_or("*"),
            instruction_id = %id,
            kind = %kind,
            sent,
            "Instruction issued"
        );
        Ok(SendOutcome {
            instruction_id: id,
            sent,
            expires_at,
        })
    }

    pub async fn instruction(&self, id: &str) -> Result<RealtimeInstruction, ServiceError> {
        Ok(self.db.get_instruction(id).await?)
    }

    /// One page of instructions, newest first, and the total count.
    pub async fn instructions(
        &self,
        app_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RealtimeInstruction>, i64), ServiceError> {
        Ok(self
            .db
            .list_instructions(app_id.filter(|a| !a.is_empty()), limit, offset)
            .await?)
    }

    /// Apply an `instruction_result` from `session`.
    ///
    /// The instruction must belong to the session's app and, unless it was
    /// a broadcast, to the session's machine.
    pub async fn apply_instruction_result(
        &self,
        session: &DeviceSession,
        report: &InstructionResult,
    ) -> Result<InstructionStatus, ServiceError> {
        let outcome = parse_instruction_outcome(&report.status)?;
        let instruction = self.db.get_instruction(&report.instruction_id).await?;

        let owned = instruction.app_id == session.app_id
            && instruction
                .machine_id
                .as_deref()
                .is_none_or(|m| m == session.machine_id);
        if !owned {
            warn!(
                instruction_id = %instruction.id,
                session_id = %session.session_id,
                machine_id = %session.machine_id,
                "Result for an instruction addressed elsewhere"
            );
            return Err(ServiceError::NotFound(format!(
                "Instruction {}",
                instruction.id
            )));
        }

        self.tracker
            .report_instruction(
                &instruction,
                outcome,
                report.outcome_text().as_deref(),
                unix_timestamp(),
            )
            .await
    }

    /// Apply a `script_result` from `session`.
    pub async fn apply_script_result(
        &self,
        session: &DeviceSession,
        report: &ScriptResult,
    ) -> Result<ScriptDelivery, ServiceError> {
        let result = report.result_text();
        self.deliveries
            .report_for(
                &session.app_id,
                &session.machine_id,
                &ExecutionReport {
                    script_id: &report.script_id,
                    delivery_id: report.delivery_id.as_deref(),
                    status: &report.status,
                    result: result.as_deref(),
                    error_message: report.error.as_deref(),
                    duration_ms: report.duration,
                },
            )
            .await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use scriptgate_crypto::test_keys;

    use super::*;
    use crate::hub::test_support::hub;

    fn session_for(machine_id: &str, session_id: &str) -> Arc<DeviceSession> {
        Arc::new(DeviceSession::new(
            "app1".into(),
            format!("d-{machine_id}"),
            machine_id.into(),
            session_id.into(),
            None,
            unix_timestamp(),
        ))
    }

    #[tokio::test]
    async fn offline_target_stays_pending() {
        let (db, hub) = hub().await;
        let outcome = hub
            .send_instruction("app1", Some("M1"), "restart", &json!({"delay": 5}), 1)
            .await
            .unwrap();

        assert!(!outcome.sent);
        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert_eq!(stored.status, InstructionStatus::Pending);
        assert!(stored.sent_at.is_none());
        assert_eq!(stored.device_id.as_deref(), Some("d1"));
        assert_eq!(stored.expires_at, outcome.expires_at);
    }

    #[tokio::test]
    async fn unknown_machine_is_accepted_but_not_sent() {
        let (db, hub) = hub().await;
        let outcome = hub
            .send_instruction("app1", Some("ghost"), "restart", &json!({}), 0)
            .await
            .unwrap();
        assert!(!outcome.sent);
        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert!(stored.device_id.is_none());
        assert_eq!(stored.machine_id.as_deref(), Some("ghost"));
    }

    #[tokio::test]
    async fn online_target_receives_a_verifiable_instruction() {
        let (db, hub) = hub().await;
        let (tx, mut rx) = mpsc::channel(4);
        hub.registry().register(session_for("M1", "s1"), tx).await;

        let payload = json!({"cmd": "sync", "args": [1, 2]});
        let outcome = hub
            .send_instruction("app1", Some("M1"), "sync", &payload, 2)
            .await
            .unwrap();
        assert!(outcome.sent);

        let Some(ServerMessage::Instruction(pushed)) = rx.recv().await else {
            panic!("expected an instruction frame");
        };
        assert_eq!(pushed.id, outcome.instruction_id);
        assert_eq!(pushed.expires, outcome.expires_at);
        let message = signing::instruction_message(
            &pushed.id,
            &pushed.kind,
            pushed.payload.get(),
            pushed.timestamp,
            &pushed.nonce,
            pushed.expires,
        );
        signing::verify_pem(
            &test_keys().public_key_pem,
            message.as_bytes(),
            &pushed.signature,
        )
        .unwrap();

        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert_eq!(stored.status, InstructionStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(stored.payload, pushed.payload.get());
        assert_eq!(stored.signature, pushed.signature);
    }

    #[tokio::test]
    async fn broadcast_is_always_marked_sent() {
        let (db, hub) = hub().await;
        let outcome = hub
            .send_instruction("app1", None, "refresh", &json!(null), 0)
            .await
            .unwrap();
        assert!(outcome.sent);
        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert!(stored.is_broadcast());
        assert_eq!(stored.status, InstructionStatus::Sent);
    }

    #[tokio::test]
    async fn send_validates_input() {
        let (_db, hub) = hub().await;
        assert!(matches!(
            hub.send_instruction("app1", None, "", &json!({}), 0).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            hub.send_instruction("nope", None, "x", &json!({}), 0).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn result_from_the_target_is_applied() {
        let (db, hub) = hub().await;
        let (tx, _rx) = mpsc::channel(4);
        let session = session_for("M1", "s1");
        hub.registry().register(Arc::clone(&session), tx).await;
        let outcome = hub
            .send_instruction("app1", Some("M1"), "restart", &json!({}), 0)
            .await
            .unwrap();

        let status = hub
            .apply_instruction_result(
                &session,
                &InstructionResult {
                    instruction_id: outcome.instruction_id.clone(),
                    status: "success".into(),
                    result: Some(json!("restarted")),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status, InstructionStatus::Executed);

        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert_eq!(stored.result.as_deref(), Some("restarted"));
        assert!(stored.acked_at.is_some());
    }

    #[tokio::test]
    async fn result_from_another_machine_is_dropped() {
        let (db, hub) = hub().await;
        let (tx, _rx) = mpsc::channel(4);
        hub.registry().register(session_for("M1", "s1"), tx).await;
        let outcome = hub
            .send_instruction("app1", Some("M1"), "restart", &json!({}), 0)
            .await
            .unwrap();

        let intruder = session_for("M2", "s2");
        let err = hub
            .apply_instruction_result(
                &intruder,
                &InstructionResult {
                    instruction_id: outcome.instruction_id.clone(),
                    status: "failed".into(),
                    result: None,
                    error: Some("nope".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let stored = db.get_instruction(&outcome.instruction_id).await.unwrap();
        assert_eq!(stored.status, InstructionStatus::Sent);
    }

    #[tokio::test]
    async fn any_device_of_the_app_may_answer_a_broadcast() {
        let (_db, hub) = hub().await;
        let outcome = hub
            .send_instruction("app1", None, "refresh", &json!({}), 0)
            .await
            .unwrap();
        let status = hub
            .apply_instruction_result(
                &session_for("M2", "s2"),
                &InstructionResult {
                    instruction_id: outcome.instruction_id,
                    status: "acked".into(),
                    result: None,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(status, InstructionStatus::Acked);
    }

    #[tokio::test]
    async fn instructions_are_listed_newest_first() {
        let (_db, hub) = hub().await;
        let first = hub
            .send_instruction("app1", None, "a", &json!({}), 0)
            .await
            .unwrap();
        let second = hub
            .send_instruction("app1", None, "b", &json!({}), 0)
            .await
            .unwrap();

        let (rows, total) = hub.instructions(Some("app1"), 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].id, second.instruction_id);
        assert_eq!(rows[1].id, first.instruction_id);
        assert_eq!(
            hub.instruction(&first.instruction_id).await.unwrap().kind,
            "a"
        );
    }
}
