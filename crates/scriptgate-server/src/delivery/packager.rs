//! Builds one-time, device-bound, signed delivery packages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use scriptgate_crypto::keys::{parse_private_key, parse_public_key};
use scriptgate_crypto::{CryptoError, delivery, signing, vault};

use crate::storage::{Application, StoredScript};

/// A single-use package for one device. Never persisted or reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPackage {
    pub script_id: String,
    /// Identifies the delivery record; echoed back in execution reports.
    pub delivery_id: String,
    pub version: String,
    pub script_type: String,
    pub entry_point: String,
    /// Base64 `nonce || ciphertext` under the per-delivery key.
    pub encrypted_content: String,
    /// Hex SHA-256 of the plaintext.
    pub content_hash: String,
    pub key_hint: String,
    /// Base64 RSA-SHA256 over `script_id:encrypted_content:machine_id:expires_at`.
    pub signature: String,
    pub expires_at: i64,
    pub timeout: i64,
    pub memory_limit: i64,
    pub parameters: String,
    pub execute_once: bool,
}

impl DeliveryPackage {
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }

    /// Verify the package signature as the receiving device would.
    pub fn verify(&self, public_key_pem: &str, machine_id: &str) -> Result<(), CryptoError> {
        let message = signing::package_message(
            &self.script_id,
            &self.encrypted_content,
            machine_id,
            self.expires_at,
        );
        signing::verify(
            &parse_public_key(public_key_pem)?,
            message.as_bytes(),
            &self.signature,
        )
    }

    /// Decrypt the package as the receiving device would and check the
    /// recovered plaintext against `content_hash`.
    pub fn open(&self, shared_secret: &str, machine_id: &str) -> Result<Vec<u8>, CryptoError> {
        let plaintext = delivery::open_for_device(
            &self.encrypted_content,
            shared_secret,
            machine_id,
            &self.key_hint,
        )?;
        if vault::content_hash(&plaintext) != self.content_hash {
            return Err(CryptoError::DecryptionFailed("content hash mismatch".into()));
        }
        Ok(plaintext)
    }
}

/// Re-encrypt `script` for `machine_id` and sign the result.
///
/// The stored copy is opened with the application's private key, sealed
/// again under an HKDF key bound to this machine and a fresh key hint, and
/// signed together with its expiry.
pub fn prepare(
    script: &StoredScript,
    app: &Application,
    machine_id: &str,
    valid_for: Duration,
    now: i64,
) -> Result<DeliveryPackage, CryptoError> {
    let private_key = parse_private_key(&app.private_key)?;
    let plaintext = Zeroizing::new(vault::decrypt(
        &script.encrypted_content,
        &script.storage_key,
        &private_key,
    )?);

    let sealed = delivery::seal_for_device(&plaintext, &app.shared_secret, machine_id)?;
    let ttl = i64::try_from(valid_for.as_secs()).unwrap_or(i64::MAX);
    let expires_at = now.saturating_add(ttl);

    let message =
        signing::package_message(&script.id, &sealed.encrypted_content, machine_id, expires_at);
    let signature = signing::sign(&private_key, message.as_bytes())?;

    Ok(DeliveryPackage {
        script_id: script.id.clone(),
        delivery_id: uuid::Uuid::new_v4().to_string(),
        version: script.version.clone(),
        script_type: script.script_type.clone(),
        entry_point: script.entry_point.clone(),
        encrypted_content: sealed.encrypted_content,
        content_hash: script.content_hash.clone(),
        key_hint: sealed.key_hint,
        signature,
        expires_at,
        timeout: script.timeout_secs,
        memory_limit: script.memory_limit_mb,
        parameters: script.parameters.clone(),
        execute_once: true,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use scriptgate_crypto::test_keys;
    use sqlx::types::Json;

    use super::*;
    use crate::storage::ScriptStatus;

    const NOW: i64 = 1_750_000_000;
    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn app() -> Application {
        let keys = test_keys();
        Application {
            id: "app1".into(),
            name: "Demo".into(),
            app_key: "key-app1".into(),
            public_key: keys.public_key_pem.clone(),
            private_key: keys.private_key_pem.clone(),
            shared_secret: keys.shared_secret.clone(),
            status: "active".into(),
            created_at: NOW,
            updated_at: NOW,
        }
    }

    fn stored(content: &[u8]) -> StoredScript {
        let sealed = vault::encrypt_pem(content, &test_keys().public_key_pem).unwrap();
        StoredScript {
            id: "s1".into(),
            app_id: "app1".into(),
            name: "hello".into(),
            version: "1.0.0".into(),
            script_type: "python".into(),
            entry_point: "main".into(),
            encrypted_content: sealed.ciphertext,
            storage_key: sealed.wrapped_key,
            content_hash: sealed.content_hash,
            original_size: i64::try_from(content.len()).unwrap(),
            timeout_secs: 300,
            memory_limit_mb: 512,
            parameters: "{}".into(),
            required_features: Json(Vec::new()),
            allowed_devices: Json(Vec::new()),
            rollout_percent: 100,
            status: ScriptStatus::Published,
            published_at: Some(NOW),
            expires_at: None,
            delivery_count: 0,
            execute_count: 0,
            success_count: 0,
            fail_count: 0,
            created_at: NOW,
            updated_at: NOW,
        }
    }

    #[test]
    fn device_recovers_the_original_bytes() {
        let app = app();
        let script = stored(b"print(1)\n");
        let package = prepare(&script, &app, "M1", FIVE_MINUTES, NOW).unwrap();

        assert_eq!(package.expires_at, NOW + 300);
        assert!(package.execute_once);
        package.verify(&app.public_key, "M1").unwrap();
        let plaintext = package.open(&app.shared_secret, "M1").unwrap();
        assert_eq!(plaintext, b"print(1)\n");
        assert_eq!(plaintext.len(), 9);
    }

    #[test]
    fn thirteen_byte_script_roundtrips_through_derived_key() {
        let app = app();
        let original = b"print('hi')\n\n";
        assert_eq!(original.len(), 13);
        let package = prepare(&stored(original), &app, "M1", FIVE_MINUTES, NOW).unwrap();

        let key =
            delivery::derive_delivery_key(&app.shared_secret, "M1", &package.key_hint).unwrap();
        let sealed = STANDARD.decode(&package.encrypted_content).unwrap();
        let recovered = scriptgate_crypto::aead::open(key.as_ref(), &sealed).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn every_package_is_fresh() {
        let app = app();
        let script = stored(b"print(1)\n");
        let a = prepare(&script, &app, "M1", FIVE_MINUTES, NOW).unwrap();
        let b = prepare(&script, &app, "M1", FIVE_MINUTES, NOW).unwrap();

        assert_ne!(a.key_hint, b.key_hint);
        assert_ne!(a.encrypted_content, b.encrypted_content);
        assert_ne!(a.signature, b.signature);
        assert_ne!(a.delivery_id, b.delivery_id);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn altering_signed_fields_breaks_verification() {
        let app = app();
        let package = prepare(&stored(b"print(1)\n"), &app, "M1", FIVE_MINUTES, NOW).unwrap();

        let mut later = package.clone();
        later.expires_at += 1;
        assert!(later.verify(&app.public_key, "M1").is_err());

        let mut swapped = package.clone();
        let mut raw = STANDARD.decode(&swapped.encrypted_content).unwrap();
        raw[0] ^= 0x01;
        swapped.encrypted_content = STANDARD.encode(raw);
        assert!(swapped.verify(&app.public_key, "M1").is_err());

        assert!(package.verify(&app.public_key, "M2").is_err());
    }

    #[test]
    fn package_for_one_machine_does_not_open_on_another() {
        let app = app();
        let package = prepare(&stored(b"secret"), &app, "M1", FIVE_MINUTES, NOW).unwrap();
        assert!(package.open(&app.shared_secret, "M2").is_err());
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let app = app();
        let package = prepare(&stored(b"x"), &app, "M1", FIVE_MINUTES, NOW).unwrap();
        assert!(!package.is_expired(NOW + 300));
        assert!(package.is_expired(NOW + 301));
    }

    #[test]
    fn corrupt_storage_key_is_a_crypto_error() {
        let app = app();
        let mut script = stored(b"print(1)\n");
        script.storage_key = STANDARD.encode([0u8; 256]);
        assert!(prepare(&script, &app, "M1", FIVE_MINUTES, NOW).is_err());
    }
}
