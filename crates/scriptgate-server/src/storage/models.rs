//! Data models for Scriptgate storage.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Status value shared by applications and devices.
pub const STATUS_ACTIVE: &str = "active";

/// An application: the tenant-side owner of keys, scripts and devices.
#[derive(Clone, sqlx::FromRow)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub app_key: String,
    pub public_key: String,
    pub private_key: String,
    pub shared_secret: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("app_key", &self.app_key)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A device bound to an application.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub app_id: String,
    pub machine_id: String,
    /// Entitlement snapshot granted by the device's license.
    pub features: Json<Vec<String>>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScriptStatus {
    Draft,
    Published,
    Deprecated,
}

/// A script stored encrypted under its application's public key.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredScript {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub script_type: String,
    pub entry_point: String,
    #[serde(skip)]
    pub encrypted_content: Vec<u8>,
    /// RSA-wrapped AES key, base64.
    #[serde(skip)]
    pub storage_key: String,
    pub content_hash: String,
    pub original_size: i64,
    pub timeout_secs: i64,
    pub memory_limit_mb: i64,
    pub parameters: String,
    pub required_features: Json<Vec<String>>,
    /// Empty means unrestricted.
    pub allowed_devices: Json<Vec<String>>,
    pub rollout_percent: i64,
    pub status: ScriptStatus,
    pub published_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub delivery_count: i64,
    pub execute_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Script counters summed over one application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ScriptTotals {
    pub total_scripts: i64,
    pub published_count: i64,
    pub total_deliveries: i64,
    pub total_executions: i64,
    pub total_success: i64,
    pub total_fail: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Executing,
    Success,
    Failed,
    Expired,
}

impl DeliveryStatus {
    /// Position in the forward-only lifecycle. All terminal states share
    /// the highest rank so none of them can follow another.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Executing => 1,
            Self::Success | Self::Failed | Self::Expired => 2,
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// One prepared delivery of a script to a device.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScriptDelivery {
    pub id: String,
    pub script_id: String,
    pub app_id: String,
    pub device_id: Option<String>,
    pub machine_id: String,
    #[serde(skip)]
    pub key_hint: String,
    pub expires_at: i64,
    pub status: DeliveryStatus,
    pub executed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstructionStatus {
    Pending,
    Sent,
    Acked,
    Executed,
    Failed,
    Expired,
}

impl InstructionStatus {
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Acked => 2,
            Self::Executed | Self::Failed | Self::Expired => 3,
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for InstructionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed real-time instruction. `machine_id = None` is a broadcast.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RealtimeInstruction {
    pub id: String,
    pub app_id: String,
    pub device_id: Option<String>,
    pub machine_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw JSON exactly as signed.
    pub payload: String,
    pub priority: i64,
    pub nonce: String,
    #[serde(rename = "timestamp")]
    pub issued_at: i64,
    pub signature: String,
    pub expires_at: i64,
    pub status: InstructionStatus,
    pub sent_at: Option<i64>,
    pub acked_at: Option<i64>,
    pub result: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RealtimeInstruction {
    pub const fn is_broadcast(&self) -> bool {
        self.machine_id.is_none()
    }
}

/// Audit row mirroring one WebSocket session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceConnection {
    pub session_id: String,
    pub app_id: String,
    pub device_id: String,
    pub machine_id: String,
    pub remote_addr: Option<String>,
    pub connected_at: i64,
    pub last_ping_at: i64,
    pub disconnected_at: Option<i64>,
    pub status: String,
}
