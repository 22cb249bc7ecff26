//! Lifecycle tracking for deliveries and instructions.
//!
//! Every status change goes through here. Transitions only move forward
//! (see `DeliveryStatus::rank` / `InstructionStatus::rank`); each one is a
//! compare-and-swap on the stored status, so concurrent reports cannot
//! double-count or resurrect a finished record.

use tracing::{debug, info, warn};

use crate::delivery::DeliveryPackage;
use crate::error::ServiceError;
use crate::storage::{
    DeliveryStatus, DeliveryTransition, InstructionStatus, NewDelivery, NewInstruction,
    RealtimeInstruction, ScriptDelivery, ServerDatabase,
};

/// A device's report on a delivery.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryReport<'a> {
    pub status: DeliveryStatus,
    pub duration_ms: Option<i64>,
    pub result: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// Rows touched by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deliveries: u64,
    pub instructions: u64,
}

/// Parse a reported delivery status (`executing`, `success`, `failed`).
pub fn parse_delivery_status(raw: &str) -> Result<DeliveryStatus, ServiceError> {
    match raw {
        "executing" => Ok(DeliveryStatus::Executing),
        "success" => Ok(DeliveryStatus::Success),
        "failed" => Ok(DeliveryStatus::Failed),
        other => Err(ServiceError::validation(format!(
            "invalid delivery status: {other}"
        ))),
    }
}

/// Map an instruction result status (`success`, `failed`, `acked`).
pub fn parse_instruction_outcome(raw: &str) -> Result<InstructionStatus, ServiceError> {
    match raw {
        "success" => Ok(InstructionStatus::Executed),
        "failed" => Ok(InstructionStatus::Failed),
        "acked" => Ok(InstructionStatus::Acked),
        other => Err(ServiceError::validation(format!(
            "invalid instruction status: {other}"
        ))),
    }
}

#[derive(Clone)]
pub struct LifecycleTracker {
    db: ServerDatabase,
}

impl LifecycleTracker {
    pub const fn new(db: ServerDatabase) -> Self {
        Self { db }
    }

    /// Record a pending delivery for a freshly prepared package.
    pub async fn record_delivery(
        &self,
        app_id: &str,
        device_id: Option<&str>,
        machine_id: &str,
        package: &DeliveryPackage,
    ) -> Result<ScriptDelivery, ServiceError> {
        let delivery = self
            .db
            .create_delivery(&NewDelivery {
                id: &package.delivery_id,
                script_id: &package.script_id,
                app_id,
                device_id,
                machine_id,
                key_hint: &package.key_hint,
                expires_at: package.expires_at,
            })
            .await?;

        info!(
            delivery_id = %delivery.id,
            script_id = %delivery.script_id,
            machine_id = %machine_id,
            expires_at = delivery.expires_at,
            "Delivery recorded"
        );
        Ok(delivery)
    }

    /// Apply a device report to a delivery at time `now`.
    ///
    /// A report arriving after `expires_at` expires the delivery instead.
    pub async fn report_delivery(
        &self,
        delivery: &ScriptDelivery,
        report: &DeliveryReport<'_>,
        now: i64,
    ) -> Result<ScriptDelivery, ServiceError> {
        let current = delivery.status;
        if current == DeliveryStatus::Expired {
            return Err(ServiceError::Expired(format!("Delivery {}", delivery.id)));
        }
        if current.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "delivery {} is already {current}",
                delivery.id
            )));
        }

        if delivery.expires_at < now {
            let expired = DeliveryTransition {
                to: DeliveryStatus::Expired,
                at: now,
                duration_ms: None,
                result: None,
                error_message: None,
            };
            self.db
                .advance_delivery(&delivery.id, current, &expired)
                .await?;
            warn!(
                delivery_id = %delivery.id,
                machine_id = %delivery.machine_id,
                "Late report, delivery expired"
            );
            return Err(ServiceError::Expired(format!("Delivery {}", delivery.id)));
        }

        if report.status.rank() <= current.rank() {
            return Err(ServiceError::Conflict(format!(
                "cannot move delivery {} from {current} to {}",
                delivery.id, report.status
            )));
        }

        let transition = DeliveryTransition {
            to: report.status,
            at: now,
            duration_ms: report.duration_ms,
            result: report.result,
            error_message: report.error_message,
        };
        if !self
            .db
            .advance_delivery(&delivery.id, current, &transition)
            .await?
        {
            return Err(ServiceError::Conflict(format!(
                "delivery {} changed concurrently",
                delivery.id
            )));
        }

        info!(
            delivery_id = %delivery.id,
            from = %current,
            to = %report.status,
            "Delivery status updated"
        );
        Ok(self.db.get_delivery(&delivery.id).await?)
    }

    /// Persist a freshly signed instruction as pending.
    pub async fn record_instruction(
        &self,
        params: &NewInstruction<'_>,
    ) -> Result<RealtimeInstruction, ServiceError> {
        Ok(self.db.create_instruction(params).await?)
    }

    /// Mark an instruction sent. Only a pending instruction moves.
    pub async fn mark_sent(&self, instruction_id: &str, now: i64) -> Result<bool, ServiceError> {
        Ok(self.db.mark_instruction_sent(instruction_id, now).await?)
    }

    /// Apply a device's result to an instruction at time `now`.
    ///
    /// `instruction` may be a stale read: if the stored row moved on in the
    /// meantime (typically pending to sent), the row is re-read and the
    /// transition retried once against it.
    pub async fn report_instruction(
        &self,
        instruction: &RealtimeInstruction,
        outcome: InstructionStatus,
        result: Option<&str>,
        now: i64,
    ) -> Result<InstructionStatus, ServiceError> {
        if let Some(status) = self
            .try_report_instruction(instruction, outcome, result, now)
            .await?
        {
            return Ok(status);
        }

        let fresh = self.db.get_instruction(&instruction.id).await?;
        self.try_report_instruction(&fresh, outcome, result, now)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict(format!(
                    "instruction {} changed concurrently",
                    instruction.id
                ))
            })
    }

    /// One compare-and-swap attempt against `instruction.status`.
    /// `Ok(None)` means the stored status no longer matched.
    async fn try_report_instruction(
        &self,
        instruction: &RealtimeInstruction,
        outcome: InstructionStatus,
        result: Option<&str>,
        now: i64,
    ) -> Result<Option<InstructionStatus>, ServiceError> {
        let current = instruction.status;
        if current == InstructionStatus::Expired {
            return Err(ServiceError::Expired(format!(
                "Instruction {}",
                instruction.id
            )));
        }
        if current.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "instruction {} is already {current}",
                instruction.id
            )));
        }

        if instruction.expires_at < now {
            if !self
                .db
                .advance_instruction(
                    &instruction.id,
                    current,
                    InstructionStatus::Expired,
                    None,
                    now,
                )
                .await?
            {
                return Ok(None);
            }
            warn!(instruction_id = %instruction.id, "Late result, instruction expired");
            return Err(ServiceError::Expired(format!(
                "Instruction {}",
                instruction.id
            )));
        }

        if outcome.rank() <= current.rank() {
            return Err(ServiceError::Conflict(format!(
                "cannot move instruction {} from {current} to {outcome}",
                instruction.id
            )));
        }

        if !self
            .db
            .advance_instruction(&instruction.id, current, outcome, result, now)
            .await?
        {
            return Ok(None);
        }

        debug!(
            instruction_id = %instruction.id,
            from = %current,
            to = %outcome,
            "Instruction status updated"
        );
        Ok(Some(outcome))
    }

    /// Expire every open delivery and instruction past its deadline.
    pub async fn sweep_expired(&self, now: i64) -> Result<SweepStats, ServiceError> {
        Ok(SweepStats {
            deliveries: self.db.expire_deliveries(now).await?,
            instructions: self.db.expire_instructions(now).await?,
        })
    }
}
