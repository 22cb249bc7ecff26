//! Routes called by devices: fetch, report and version listing.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::response::{ApiResult, bad_json, bad_query, ok};
use crate::delivery::{DeliveryPackage, ExecutionReport};
use crate::scripts::ScriptVersion;
use crate::storage::DeliveryStatus;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchRequest {
    pub app_key: String,
    pub machine_id: String,
    pub script_id: String,
}

pub async fn fetch(
    State(state): State<AppState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> ApiResult<DeliveryPackage> {
    let Json(req) = body.map_err(bad_json)?;
    let package = state
        .deliveries
        .fetch(&req.app_key, &req.machine_id, &req.script_id)
        .await?;
    ok(package)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReportRequest {
    pub app_key: String,
    pub machine_id: String,
    pub script_id: String,
    pub delivery_id: Option<String>,
    pub status: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    /// Milliseconds.
    pub duration: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReportAck {
    pub delivery_id: String,
    pub status: DeliveryStatus,
}

pub async fn report(
    State(state): State<AppState>,
    body: Result<Json<ReportRequest>, JsonRejection>,
) -> ApiResult<ReportAck> {
    let Json(req) = body.map_err(bad_json)?;
    let delivery = state
        .deliveries
        .report(
            &req.app_key,
            &req.machine_id,
            &ExecutionReport {
                script_id: &req.script_id,
                delivery_id: req.delivery_id.as_deref(),
                status: &req.status,
                result: req.result.as_deref(),
                error_message: req.error_message.as_deref(),
                duration_ms: req.duration,
            },
        )
        .await?;
    ok(ReportAck {
        delivery_id: delivery.id,
        status: delivery.status,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VersionsQuery {
    pub app_key: String,
}

pub async fn versions(
    State(state): State<AppState>,
    query: Result<Query<VersionsQuery>, QueryRejection>,
) -> ApiResult<Vec<ScriptVersion>> {
    let Query(query) = query.map_err(bad_query)?;
    ok(state.scripts.list_versions(&query.app_key).await?)
}
