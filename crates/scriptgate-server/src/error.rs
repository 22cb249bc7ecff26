//! Service-level error taxonomy.

use scriptgate_crypto::CryptoError;

use crate::gate::EntitlementError;
use crate::storage::DatabaseError;

/// Errors surfaced by delivery, script, instruction and lifecycle services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed or missing request fields.
    #[error("{0}")]
    Validation(String),

    /// The device may not receive this script. The reason is safe to show.
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    #[error("{0} not found")]
    NotFound(String),

    /// Key parsing, encryption, decryption or signing failed. Never shown
    /// to clients beyond `context`.
    #[error("{context}: {source}")]
    Crypto {
        context: &'static str,
        #[source]
        source: CryptoError,
    },

    /// A delivery or instruction was reported after its window closed.
    #[error("{0} has expired")]
    Expired(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The request conflicts with the record's current state.
    #[error("{0}")]
    Conflict(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn crypto(context: &'static str) -> impl FnOnce(CryptoError) -> Self {
        move |source| Self::Crypto { context, source }
    }

    /// The message a client may see. Crypto and storage details stay in
    /// the server log.
    pub fn public_message(&self) -> String {
        match self {
            Self::Crypto { .. } | Self::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<DatabaseError> for ServiceError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn not_found_database_error_keeps_its_subject() {
        let err: ServiceError = DatabaseError::NotFound("Script s1".into()).into();
        assert!(matches!(&err, ServiceError::NotFound(what) if what == "Script s1"));
        assert_eq!(err.to_string(), "Script s1 not found");
    }

    #[test]
    fn other_database_errors_become_storage() {
        let err: ServiceError = DatabaseError::Query("disk I/O error".into()).into();
        assert!(matches!(err, ServiceError::Storage(_)));
    }

    #[test]
    fn internal_details_are_not_public() {
        let err = ServiceError::Crypto {
            context: "preparing delivery",
            source: CryptoError::DecryptionFailed("key unwrap".into()),
        };
        assert_eq!(err.public_message(), "internal server error");
        assert_eq!(
            ServiceError::Storage("database is locked".into()).public_message(),
            "internal server error"
        );
        assert_eq!(
            ServiceError::from(EntitlementError::NotInAllowlist).public_message(),
            "device not in allowlist"
        );
    }

    #[test]
    fn crypto_context_wraps_source() {
        let err = Err::<(), _>(CryptoError::BadSignature)
            .map_err(ServiceError::crypto("signing package"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "signing package: Signature verification failed"
        );
    }
}
