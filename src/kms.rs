//! KEK wrapping capability
//!
//! The coordinator only ever sees this trait. The KEK stays behind it: remote
//! implementations never expose key bytes, and the local implementation keeps
//! its KEK private to the process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{AesGcmCipher, SecureKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Result, VaultError};

/// Stable name and version of the KEK used for a wrap
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyReference {
    pub name: String,
    pub version: String,
}

impl KeyReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for KeyReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A DEK encrypted under a KEK
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedDek {
    pub wrapped_key: Vec<u8>,
    pub key_ref: KeyReference,
}

impl std::fmt::Debug for WrappedDek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedDek")
            .field("wrapped_key_len", &self.wrapped_key.len())
            .field("key_ref", &self.key_ref)
            .finish()
    }
}

/// Wrap/unwrap DEKs with an externally held KEK
///
/// Implementations must be safe for concurrent use; one instance is shared by
/// every operation in the process.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// The KEK new wraps are made with
    fn key_ref(&self) -> &KeyReference;

    /// Encrypt a DEK under the current KEK
    async fn wrap(&self, dek: &SecureKey) -> Result<WrappedDek>;

    /// Recover a DEK, using the KEK named in `wrapped.key_ref`
    async fn unwrap(&self, wrapped: &WrappedDek) -> Result<SecureKey>;
}

/// In-process AES-256-GCM key wrapping for development and tests
///
/// Wire format: `nonce (12) || wrapped DEK (32) || tag (16)`.
pub struct LocalKeyWrapper {
    kek: SecureKey,
    key_ref: KeyReference,
}

impl LocalKeyWrapper {
    /// Create a wrapper around a freshly generated KEK
    pub fn generate(name: impl Into<String>) -> Self {
        Self::with_kek(SecureKey::generate(), KeyReference::new(name, "1"))
    }

    pub fn with_kek(kek: SecureKey, key_ref: KeyReference) -> Self {
        Self { kek, key_ref }
    }
}

#[async_trait]
impl KeyWrapper for LocalKeyWrapper {
    fn key_ref(&self) -> &KeyReference {
        &self.key_ref
    }

    async fn wrap(&self, dek: &SecureKey) -> Result<WrappedDek> {
        let sealed = AesGcmCipher::seal(dek.as_bytes(), &self.kek)
            .map_err(|e| VaultError::WrapFailure(e.to_string()))?;

        let mut wrapped_key = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len() + TAG_SIZE);
        wrapped_key.extend_from_slice(&sealed.iv);
        wrapped_key.extend_from_slice(&sealed.ciphertext);
        wrapped_key.extend_from_slice(&sealed.tag);

        Ok(WrappedDek {
            wrapped_key,
            key_ref: self.key_ref.clone(),
        })
    }

    async fn unwrap(&self, wrapped: &WrappedDek) -> Result<SecureKey> {
        if wrapped.key_ref != self.key_ref {
            return Err(VaultError::KeyNotFound(wrapped.key_ref.to_string()));
        }
        if wrapped.wrapped_key.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::UnwrapFailure("wrapped key too short".into()));
        }

        let (iv, rest) = wrapped.wrapped_key.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut dek_bytes = AesGcmCipher::open(ciphertext, iv, tag, &self.kek)
            .map_err(|_| VaultError::UnwrapFailure("wrapped key did not verify".into()))?;
        let dek = SecureKey::from_slice(&dek_bytes)
            .map_err(|_| VaultError::UnwrapFailure("unwrapped key has wrong length".into()));
        dek_bytes.zeroize();
        dek
    }
}
