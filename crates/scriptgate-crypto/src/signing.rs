//! RSA PKCS#1 v1.5 / SHA-256 signatures over canonical, colon-joined
//! messages.
//!
//! Signatures are transported as standard base64. The canonical message
//! builders live here so that signer and verifier can never disagree on the
//! field order.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::CryptoError;
use crate::keys::{parse_private_key, parse_public_key};

/// Sign `data`, returning the base64 signature.
pub fn sign(private_key: &RsaPrivateKey, data: &[u8]) -> Result<String, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(data)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(STANDARD.encode(signature.to_bytes()))
}

/// Verify a base64 signature over `data`.
pub fn verify(
    public_key: &RsaPublicKey,
    data: &[u8],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let raw = STANDARD.decode(signature_b64)?;
    let signature = Signature::try_from(raw.as_slice()).map_err(|_| CryptoError::BadSignature)?;
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(data, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// [`sign`] with a PEM private key.
pub fn sign_pem(private_key_pem: &str, data: &[u8]) -> Result<String, CryptoError> {
    sign(&parse_private_key(private_key_pem)?, data)
}

/// [`verify`] with a PEM public key.
pub fn verify_pem(public_key_pem: &str, data: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
    verify(&parse_public_key(public_key_pem)?, data, signature_b64)
}

/// Canonical message signed for a delivery package.
pub fn package_message(
    script_id: &str,
    encrypted_content_b64: &str,
    machine_id: &str,
    expires_at: i64,
) -> String {
    format!("{script_id}:{encrypted_content_b64}:{machine_id}:{expires_at}")
}

/// Canonical message signed for a real-time instruction.
pub fn instruction_message(
    id: &str,
    kind: &str,
    payload_json: &str,
    timestamp: i64,
    nonce: &str,
    expires_at: i64,
) -> String {
    format!("{id}:{kind}:{payload_json}:{timestamp}:{nonce}:{expires_at}")
}
