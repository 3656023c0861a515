//! Error types for the PII vault
//!
//! Messages identify the failing operation and never carry plaintext,
//! ciphertext or key bytes.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Which of the two datastores a row lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Ciphertext, iv, tag and field labels
    Pii,
    /// Wrapped DEKs
    Key,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Pii => write!(f, "pii store"),
            StoreKind::Key => write!(f, "key store"),
        }
    }
}

/// Errors that can occur during vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// Missing or invalid configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// The KMS could not be reached or refused our credential; retryable
    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    /// The configured KEK does not exist in the KMS
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The KMS rejected a wrap request
    #[error("Key wrap failed: {0}")]
    WrapFailure(String),

    /// The KMS rejected an unwrap request or returned a malformed key
    #[error("Key unwrap failed: {0}")]
    UnwrapFailure(String),

    /// AEAD tag did not verify: tampered data, wrong key or wrong iv
    #[error("Authentication failed: ciphertext or tag did not verify")]
    Authentication,

    /// Decrypted bytes were not valid UTF-8
    #[error("Decoding error: plaintext is not valid UTF-8")]
    Decoding,

    /// Ciphertext row or wrapped-key row is missing
    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    /// Only one of the two stores accepted the write
    #[error("Partial write for record {record_id}: only the {written} was written (compensated: {compensated})")]
    PartialWrite {
        record_id: Uuid,
        written: StoreKind,
        compensated: bool,
    },

    /// Datastore operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local cryptographic failure (cipher init, randomness, key size)
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    /// Whether the caller may retry the whole operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::KmsUnavailable(_))
    }

    /// Whether the failure may indicate tampering
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, VaultError::Authentication)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::RecordNotFound(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}
