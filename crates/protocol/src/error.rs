//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length received.
        got: usize,
    },

    // Identifier errors
    /// A chain or account identifier is not valid CAIP syntax.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A pairing URI could not be parsed.
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),

    /// The peer speaks a version we do not support.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    // Credential errors
    /// A relay credential is past its expiry.
    #[error("credential expired at {expires_at}")]
    CredentialExpired {
        /// Unix timestamp the credential stopped being valid.
        expires_at: u64,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::Deserialization(format!("invalid hex: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_decryption_error_display() {
        let err = ProtocolError::Decryption("authentication tag mismatch".to_string());
        assert_eq!(
            err.to_string(),
            "decryption failed: authentication tag mismatch"
        );
    }

    #[test]
    fn test_invalid_key_length_display() {
        let err = ProtocolError::InvalidKeyLength {
            expected: 32,
            got: 16,
        };
        assert_eq!(
            err.to_string(),
            "invalid key length: expected 32 bytes, got 16"
        );
    }

    #[test]
    fn test_credential_expired_display() {
        let err = ProtocolError::CredentialExpired { expires_at: 42 };
        assert_eq!(err.to_string(), "credential expired at 42");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_hex_error() {
        let hex_err = hex::decode("zz").unwrap_err();
        let protocol_err: ProtocolError = hex_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
