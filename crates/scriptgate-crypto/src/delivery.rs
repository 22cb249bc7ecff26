//! Per-delivery, device-bound encryption.
//!
//! A delivery key is derived with HKDF-SHA256 from the application's shared
//! secret (IKM), the target machine id (salt) and a random, non-secret key
//! hint (info). A fresh hint per delivery means the same script sent twice
//! to the same device is sealed under two unrelated keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::{self, KEY_SIZE};
use crate::error::CryptoError;
use crate::keys::random_hex;

/// Random bytes in a key hint (hex encoded on the wire).
pub const KEY_HINT_BYTES: usize = 16;

/// Payload re-sealed for exactly one device and one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSealed {
    /// Hex key hint, transmitted in the clear.
    pub key_hint: String,
    /// Base64 `nonce || ciphertext` under the derived key.
    pub encrypted_content: String,
}

/// Fresh random key hint.
pub fn generate_key_hint() -> String {
    random_hex(KEY_HINT_BYTES)
}

/// Derive the AES-256 key for one delivery.
pub fn derive_delivery_key(
    shared_secret: &str,
    machine_id: &str,
    key_hint: &str,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(machine_id.as_bytes()), shared_secret.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(key_hint.as_bytes(), key.as_mut())
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

/// Seal `plaintext` for `machine_id` under a newly derived delivery key.
pub fn seal_for_device(
    plaintext: &[u8],
    shared_secret: &str,
    machine_id: &str,
) -> Result<DeviceSealed, CryptoError> {
    let key_hint = generate_key_hint();
    let key = derive_delivery_key(shared_secret, machine_id, &key_hint)?;
    let sealed = aead::seal(key.as_ref(), plaintext)?;
    Ok(DeviceSealed {
        key_hint,
        encrypted_content: STANDARD.encode(sealed),
    })
}

/// Client-side inverse of [`seal_for_device`].
pub fn open_for_device(
    encrypted_content_b64: &str,
    shared_secret: &str,
    machine_id: &str,
    key_hint: &str,
) -> Result<Vec<u8>, CryptoError> {
    let sealed = STANDARD.decode(encrypted_content_b64)?;
    let key = derive_delivery_key(shared_secret, machine_id, key_hint)?;
    aead::open(key.as_ref(), &sealed)
}
