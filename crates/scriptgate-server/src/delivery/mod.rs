//! Client-facing secure script delivery.
//!
//! A fetch runs app/device lookup, the entitlement gate and packaging, then
//! records a pending delivery. Reports from the device (over HTTP or the
//! WebSocket channel) are matched back to that delivery and handed to the
//! lifecycle tracker.

pub mod packager;

use std::time::Duration;

use scriptgate_core::db::unix_timestamp;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::gate;
use crate::lifecycle::{DeliveryReport, LifecycleTracker, parse_delivery_status};
use crate::storage::{ScriptDelivery, ScriptStatus, ServerDatabase};

pub use packager::{DeliveryPackage, prepare};

/// An execution report as sent by a device.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionReport<'a> {
    pub script_id: &'a str,
    pub delivery_id: Option<&'a str>,
    pub status: &'a str,
    pub result: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub duration_ms: Option<i64>,
}

#[derive(Clone)]
pub struct DeliveryService {
    db: ServerDatabase,
    tracker: LifecycleTracker,
    package_ttl: Duration,
}

impl DeliveryService {
    pub const fn new(db: ServerDatabase, tracker: LifecycleTracker, package_ttl: Duration) -> Self {
        Self {
            db,
            tracker,
            package_ttl,
        }
    }

    /// Package a published script for one device.
    pub async fn fetch(
        &self,
        app_key: &str,
        machine_id: &str,
        script_id: &str,
    ) -> Result<DeliveryPackage, ServiceError> {
        require("app_key", app_key)?;
        require("machine_id", machine_id)?;
        require("script_id", script_id)?;

        let app = self.db.get_active_application_by_key(app_key).await?;
        let device = self.db.get_active_device(&app.id, machine_id).await?;
        let script = self.db.get_script(script_id).await?;
        if script.app_id != app.id || script.status != ScriptStatus::Published {
            return Err(ServiceError::NotFound(format!("Script {script_id}")));
        }

        let now = unix_timestamp();
        if let Err(denied) = gate::check((&script).into(), machine_id, &device.features.0, now) {
            info!(
                app_id = %app.id,
                machine_id = %machine_id,
                script_id = %script_id,
                reason = %denied,
                "Delivery denied"
            );
            return Err(denied.into());
        }

        let package = prepare(&script, &app, machine_id, self.package_ttl, now)
            .map_err(ServiceError::crypto("preparing delivery"))?;
        self.tracker
            .record_delivery(&app.id, Some(&device.id), machine_id, &package)
            .await?;

        Ok(package)
    }

    /// Apply a report authenticated by app key over HTTP.
    pub async fn report(
        &self,
        app_key: &str,
        machine_id: &str,
        report: &ExecutionReport<'_>,
    ) -> Result<ScriptDelivery, ServiceError> {
        require("app_key", app_key)?;
        require("machine_id", machine_id)?;
        let app = self.db.get_active_application_by_key(app_key).await?;
        self.report_for(&app.id, machine_id, report).await
    }

    /// Apply a report from a caller already known to be `machine_id` of
    /// `app_id`.
    pub async fn report_for(
        &self,
        app_id: &str,
        machine_id: &str,
        report: &ExecutionReport<'_>,
    ) -> Result<ScriptDelivery, ServiceError> {
        require("script_id", report.script_id)?;
        let status = parse_delivery_status(report.status)?;

        let delivery = match report.delivery_id.filter(|id| !id.is_empty()) {
            Some(id) => self.db.get_delivery(id).await?,
            None => self.db.latest_delivery(report.script_id, machine_id).await?,
        };
        if delivery.app_id != app_id
            || delivery.machine_id != machine_id
            || delivery.script_id != report.script_id
        {
            warn!(
                delivery_id = %delivery.id,
                app_id = %app_id,
                machine_id = %machine_id,
                "Report for a delivery owned by another device"
            );
            return Err(ServiceError::NotFound(format!("Delivery {}", delivery.id)));
        }

        self.tracker
            .report_delivery(
                &delivery,
                &DeliveryReport {
                    status,
                    duration_ms: report.duration_ms,
                    result: report.result,
                    error_message: report.error_message,
                },
                unix_timestamp(),
            )
            .await
    }
}

fn require(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::validation(format!("{field} is required")));
    }
    Ok(())
}
