//! Encryption of script payloads at rest.
//!
//! Each payload gets its own random AES-256 key; the payload is sealed with
//! AES-GCM and the key is wrapped with the owning application's RSA public
//! key (PKCS#1 v1.5). Only the application's private key can unwrap it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::aead::{self, KEY_SIZE};
use crate::error::CryptoError;
use crate::keys::{parse_private_key, parse_public_key};

/// A payload sealed for storage.
#[derive(Clone)]
pub struct SealedContent {
    /// `nonce || AES-GCM ciphertext`.
    pub ciphertext: Vec<u8>,
    /// RSA-wrapped AES key, base64.
    pub wrapped_key: String,
    /// Hex SHA-256 of the plaintext.
    pub content_hash: String,
}

impl std::fmt::Debug for SealedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedContent")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of `plaintext`.
pub fn content_hash(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}

/// Seal `plaintext` under a fresh AES key wrapped for `public_key`.
pub fn encrypt(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<SealedContent, CryptoError> {
    let key = aead::generate_key();
    let ciphertext = aead::seal(key.as_ref(), plaintext)?;
    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, key.as_ref())
        .map_err(|e| CryptoError::EncryptionFailed(format!("key wrap: {e}")))?;

    Ok(SealedContent {
        ciphertext,
        wrapped_key: STANDARD.encode(wrapped),
        content_hash: content_hash(plaintext),
    })
}

/// Unwrap the AES key with `private_key` and open the sealed payload.
pub fn decrypt(
    ciphertext: &[u8],
    wrapped_key: &str,
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    let wrapped = STANDARD.decode(wrapped_key)?;
    let key = Zeroizing::new(
        private_key
            .decrypt(Pkcs1v15Encrypt, &wrapped)
            .map_err(|e| CryptoError::DecryptionFailed(format!("key unwrap: {e}")))?,
    );
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    aead::open(&key, ciphertext)
}

/// [`encrypt`] with a PEM public key.
pub fn encrypt_pem(plaintext: &[u8], public_key_pem: &str) -> Result<SealedContent, CryptoError> {
    encrypt(plaintext, &parse_public_key(public_key_pem)?)
}

/// [`decrypt`] with a PEM private key.
pub fn decrypt_pem(
    ciphertext: &[u8],
    wrapped_key: &str,
    private_key_pem: &str,
) -> Result<Vec<u8>, CryptoError> {
    decrypt(ciphertext, wrapped_key, &parse_private_key(private_key_pem)?)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_keys;

    #[test]
    fn roundtrip_for_assorted_payloads() {
        let keys = test_keys();
        let big = vec![0xA5u8; 256 * 1024];
        let payloads: [&[u8]; 4] = [b"", b"print(1)\n", b"\x00\xff\x00binary", &big];
        for payload in payloads {
            let sealed = encrypt_pem(payload, &keys.public_key_pem).unwrap();
            let opened =
                decrypt_pem(&sealed.ciphertext, &sealed.wrapped_key, &keys.private_key_pem)
                    .unwrap();
            assert_eq!(opened, payload);
        }
    }

    #[test]
    fn hash_covers_plaintext_not_ciphertext() {
        let keys = test_keys();
        let a = encrypt_pem(b"same content", &keys.public_key_pem).unwrap();
        let b = encrypt_pem(b"same content", &keys.public_key_pem).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash, content_hash(b"same content"));
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.wrapped_key, b.wrapped_key);
    }

    #[test]
    fn known_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn tampered_ciphertext_is_detected() {
        let keys = test_keys();
        let mut sealed = encrypt_pem(b"payload", &keys.public_key_pem).unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0x80;
        let result = decrypt_pem(&sealed.ciphertext, &sealed.wrapped_key, &keys.private_key_pem);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn wrapped_key_for_other_app_does_not_open() {
        let keys = test_keys();
        let other = crate::AppKeyMaterial::generate(crate::keys::MIN_RSA_BITS).unwrap();
        let sealed = encrypt_pem(b"payload", &keys.public_key_pem).unwrap();
        let result = decrypt_pem(&sealed.ciphertext, &sealed.wrapped_key, &other.private_key_pem);
        assert!(result.is_err());
    }

    #[test]
    fn debug_does_not_dump_ciphertext() {
        let keys = test_keys();
        let sealed = encrypt_pem(b"payload", &keys.public_key_pem).unwrap();
        let rendered = format!("{sealed:?}");
        assert!(rendered.contains("ciphertext_len"));
        assert!(!rendered.contains(&sealed.wrapped_key));
    }
}
