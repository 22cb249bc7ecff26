//! Crypto error types.

/// Errors from cryptographic operations.
///
/// Messages describe the failing step only; they never carry key bytes.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Ciphertext too short: need at least {minimum} bytes, got {actual}")]
    CiphertextTooShort { minimum: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Encoding(e.to_string())
    }
}
