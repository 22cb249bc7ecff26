//! Operator routes: seeding, script management and instructions.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer};

use super::AppState;
use super::response::{ApiResult, Page, PageQuery, bad_json, bad_query, done, ok};
use crate::apps::ProvisionedApp;
use crate::error::ServiceError;
use crate::hub::{OnlineDevice, SendOutcome};
use crate::scripts::{ScriptDraft, ScriptStats};
use crate::storage::{Device, PolicyUpdate, RealtimeInstruction, ScriptDelivery, StoredScript};

// =============================================================================
// Applications and devices
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateAppRequest {
    pub name: String,
    pub app_key: Option<String>,
}

pub async fn create_app(
    State(state): State<AppState>,
    body: Result<Json<CreateAppRequest>, JsonRejection>,
) -> ApiResult<ProvisionedApp> {
    let Json(req) = body.map_err(bad_json)?;
    ok(state.apps.create(&req.name, req.app_key.as_deref()).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterDeviceRequest {
    pub machine_id: String,
    pub features: Vec<String>,
}

pub async fn register_device(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    body: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> ApiResult<Device> {
    let Json(req) = body.map_err(bad_json)?;
    ok(state
        .apps
        .register_device(&app_id, &req.machine_id, &req.features)
        .await?)
}

pub async fn online_devices(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> ApiResult<Vec<OnlineDevice>> {
    ok(state.hub.list_online(&app_id).await?)
}

// =============================================================================
// Secure scripts
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateScriptRequest {
    pub name: String,
    pub version: String,
    pub script_type: String,
    pub entry_point: String,
    /// Base64 plaintext.
    pub content: String,
    pub timeout: Option<i64>,
    pub memory_limit: Option<i64>,
    pub parameters: String,
    pub required_features: Vec<String>,
    pub allowed_devices: Vec<String>,
}

pub async fn create_script(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    body: Result<Json<CreateScriptRequest>, JsonRejection>,
) -> ApiResult<StoredScript> {
    let Json(req) = body.map_err(bad_json)?;
    let draft = ScriptDraft {
        content: decode_content(&req.content)?,
        name: req.name,
        version: req.version,
        script_type: req.script_type,
        entry_point: req.entry_point,
        timeout_secs: req.timeout,
        memory_limit_mb: req.memory_limit,
        parameters: req.parameters,
        required_features: req.required_features,
        allowed_devices: req.allowed_devices,
    };
    ok(state.scripts.create(&app_id, &draft).await?)
}

pub async fn list_scripts(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> ApiResult<Vec<StoredScript>> {
    ok(state.scripts.list(&app_id).await?)
}

pub async fn get_script(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
) -> ApiResult<StoredScript> {
    ok(state.scripts.get(&script_id).await?)
}

pub async fn delete_script(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
) -> ApiResult<()> {
    state.scripts.delete(&script_id).await?;
    done("deleted")
}

pub async fn script_stats(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> ApiResult<ScriptStats> {
    ok(state.scripts.stats(&app_id).await?)
}

/// Policy fields to change. A field left out is untouched; `expires_at:
/// null` clears the expiry.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdatePolicyRequest {
    pub rollout_percent: Option<i64>,
    pub required_features: Option<Vec<String>>,
    pub allowed_devices: Option<Vec<String>>,
    #[serde(deserialize_with = "present")]
    pub expires_at: Option<Option<i64>>,
}

/// Maps a present field (even `null`) to `Some`; `#[serde(default)]`
/// leaves an absent one at `None`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub async fn update_policy(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
    body: Result<Json<UpdatePolicyRequest>, JsonRejection>,
) -> ApiResult<StoredScript> {
    let Json(req) = body.map_err(bad_json)?;
    let update = PolicyUpdate {
        rollout_percent: req.rollout_percent,
        required_features: req.required_features,
        allowed_devices: req.allowed_devices,
        expires_at: req.expires_at,
    };
    ok(state.scripts.update_policy(&script_id, &update).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateContentRequest {
    pub version: String,
    /// Base64 plaintext.
    pub content: String,
}

pub async fn update_content(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
    body: Result<Json<UpdateContentRequest>, JsonRejection>,
) -> ApiResult<StoredScript> {
    let Json(req) = body.map_err(bad_json)?;
    let content = decode_content(&req.content)?;
    ok(state
        .scripts
        .update_content(&script_id, &req.version, &content)
        .await?)
}

pub async fn publish(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
) -> ApiResult<StoredScript> {
    ok(state.scripts.publish(&script_id).await?)
}

pub async fn deprecate(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
) -> ApiResult<StoredScript> {
    ok(state.scripts.deprecate(&script_id).await?)
}

pub async fn rotate_key(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
) -> ApiResult<StoredScript> {
    ok(state.scripts.rotate_key(&script_id).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeliveriesQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn deliveries(
    State(state): State<AppState>,
    Path(script_id): Path<String>,
    query: Result<Query<DeliveriesQuery>, QueryRejection>,
) -> ApiResult<Page<ScriptDelivery>> {
    let Query(query) = query.map_err(bad_query)?;
    let paging = PageQuery {
        page: query.page,
        page_size: query.page_size,
    };
    let (list, total) = state
        .scripts
        .deliveries(
            &script_id,
            query.status.as_deref(),
            paging.page_size(),
            paging.offset(),
        )
        .await?;
    ok(Page::new(list, total, paging))
}

fn decode_content(b64: &str) -> Result<Vec<u8>, ServiceError> {
    STANDARD
        .decode(b64.trim())
        .map_err(|e| ServiceError::validation(format!("content is not valid base64: {e}")))
}

// =============================================================================
// Real-time instructions
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SendInstructionRequest {
    pub app_id: String,
    pub machine_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: i64,
}

pub async fn send_instruction(
    State(state): State<AppState>,
    body: Result<Json<SendInstructionRequest>, JsonRejection>,
) -> ApiResult<SendOutcome> {
    let Json(req) = body.map_err(bad_json)?;
    ok(state
        .hub
        .send_instruction(
            &req.app_id,
            req.machine_id.as_deref(),
            &req.kind,
            &req.payload,
            req.priority,
        )
        .await?)
}

pub async fn get_instruction(
    State(state): State<AppState>,
    Path(instruction_id): Path<String>,
) -> ApiResult<RealtimeInstruction> {
    ok(state.hub.instruction(&instruction_id).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstructionsQuery {
    pub app_id: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list_instructions(
    State(state): State<AppState>,
    query: Result<Query<InstructionsQuery>, QueryRejection>,
) -> ApiResult<Page<RealtimeInstruction>> {
    let Query(query) = query.map_err(bad_query)?;
    let paging = PageQuery {
        page: query.page,
        page_size: query.page_size,
    };
    let (list, total) = state
        .hub
        .instructions(query.app_id.as_deref(), paging.page_size(), paging.offset())
        .await?;
    ok(Page::new(list, total, paging))
}
