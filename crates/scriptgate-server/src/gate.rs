//! Entitlement gate: decides whether a device may receive a script.
//!
//! Checks run in a fixed order (allowlist, required features, script
//! expiry, rollout) and the first failure is reported. The rollout gate is
//! a pure function of the machine id, so a device's outcome at a given
//! percentage never changes and widening a rollout only ever admits more
//! devices.

use sha2::{Digest, Sha256};

use crate::storage::StoredScript;

/// Why a device was denied. Messages are meant for the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntitlementError {
    #[error("device not in allowlist")]
    NotInAllowlist,

    #[error("missing required feature: {0}")]
    MissingFeature(String),

    #[error("script expired")]
    ScriptExpired,

    #[error("script not yet available for this device")]
    OutsideRollout,
}

/// The policy fields of a script the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct ScriptPolicy<'a> {
    pub allowed_devices: &'a [String],
    pub required_features: &'a [String],
    pub expires_at: Option<i64>,
    pub rollout_percent: i64,
}

impl<'a> From<&'a StoredScript> for ScriptPolicy<'a> {
    fn from(script: &'a StoredScript) -> Self {
        Self {
            allowed_devices: &script.allowed_devices.0,
            required_features: &script.required_features.0,
            expires_at: script.expires_at,
            rollout_percent: script.rollout_percent,
        }
    }
}

/// Check `machine_id` with entitlement snapshot `features` against
/// `policy` at time `now`.
pub fn check(
    policy: ScriptPolicy<'_>,
    machine_id: &str,
    features: &[String],
    now: i64,
) -> Result<(), EntitlementError> {
    if !policy.allowed_devices.is_empty()
        && !policy.allowed_devices.iter().any(|d| d == machine_id)
    {
        return Err(EntitlementError::NotInAllowlist);
    }

    if let Some(missing) = policy
        .required_features
        .iter()
        .find(|required| !features.contains(*required))
    {
        return Err(EntitlementError::MissingFeature(missing.clone()));
    }

    if policy.expires_at.is_some_and(|at| at < now) {
        return Err(EntitlementError::ScriptExpired);
    }

    if !in_rollout(machine_id, policy.rollout_percent) {
        return Err(EntitlementError::OutsideRollout);
    }

    Ok(())
}

/// Stable bucket in `0..100` for a machine id.
pub fn rollout_bucket(machine_id: &str) -> u64 {
    let digest = Sha256::digest(machine_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % 100
}

/// Whether `machine_id` falls inside a rollout of `percent`. Values outside
/// `0..=100` are clamped.
pub fn in_rollout(machine_id: &str, percent: i64) -> bool {
    let percent = percent.clamp(0, 100).unsigned_abs();
    rollout_bucket(machine_id) < percent
}
