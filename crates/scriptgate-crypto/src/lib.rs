//! Scriptgate crypto library
//!
//! Primitives behind secure script delivery and signed real-time
//! instructions.
//!
//! ## Crypto primitives
//!
//! - **Key material**: RSA keypair + shared secret per application
//! - **Vault**: AES-256-GCM at rest, AES key wrapped with RSA PKCS#1 v1.5
//! - **Delivery**: HKDF-SHA256(secret, salt = machine id, info = key hint) → AES-256-GCM
//! - **Signing**: RSA PKCS#1 v1.5 over SHA-256, base64 on the wire

pub mod aead;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod signing;
pub mod vault;

pub use delivery::{
    DeviceSealed, derive_delivery_key, generate_key_hint, open_for_device, seal_for_device,
};
pub use error::CryptoError;
pub use keys::{AppKeyMaterial, random_hex};
pub use vault::SealedContent;

/// Process-wide key material for tests, generated once.
#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used)]
pub fn test_keys() -> &'static AppKeyMaterial {
    static KEYS: std::sync::OnceLock<AppKeyMaterial> = std::sync::OnceLock::new();
    KEYS.get_or_init(|| {
        AppKeyMaterial::generate(keys::DEFAULT_RSA_BITS).expect("test key generation")
    })
}
