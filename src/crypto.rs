//! Cryptographic primitives for field encryption
//!
//! AES-256-GCM with a fresh 96-bit nonce per call and no associated data.
//! The tag is returned separately from the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A 256-bit key that zeroizes memory on drop
///
/// Deliberately not `Clone`: a DEK exists once, inside a single operation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: [u8; AES_256_KEY_SIZE],
}

impl SecureKey {
    /// Generate a new random AES-256 key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Copy key material out of a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AES_256_KEY_SIZE {
            return Err(VaultError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; AES_256_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8; AES_256_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Generate a fresh DEK for a single field
pub fn generate_dek() -> SecureKey {
    SecureKey::generate()
}

/// Output of one encryption: ciphertext, nonce and tag kept apart
#[derive(Clone, PartialEq, Eq)]
pub struct SealedValue {
    /// Same length as the plaintext bytes
    pub ciphertext: Vec<u8>,
    /// 12-byte nonce
    pub iv: Vec<u8>,
    /// 16-byte GCM tag
    pub tag: Vec<u8>,
}

impl std::fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedValue")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .field("tag_len", &self.tag.len())
            .finish()
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt a UTF-8 field value under `key`
    pub fn encrypt(plaintext: &str, key: &SecureKey) -> Result<SealedValue> {
        Self::seal(plaintext.as_bytes(), key)
    }

    /// Decrypt and verify a field value
    ///
    /// Returns [`VaultError::Authentication`] if the tag does not verify and
    /// [`VaultError::Decoding`] if the verified bytes are not UTF-8.
    pub fn decrypt(ciphertext: &[u8], iv: &[u8], tag: &[u8], key: &SecureKey) -> Result<String> {
        let plaintext = Self::open(ciphertext, iv, tag, key)?;

        String::from_utf8(plaintext).map_err(|e| {
            e.into_bytes().zeroize();
            VaultError::Decoding
        })
    }

    pub(crate) fn open(ciphertext: &[u8], iv: &[u8], tag: &[u8], key: &SecureKey) -> Result<Vec<u8>> {
        // A malformed nonce or tag can never verify.
        if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(VaultError::Authentication);
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("Cipher init error: {}", e)))?;

        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        cipher
            .decrypt(Nonce::from_slice(iv), combined.as_slice())
            .map_err(|_| VaultError::Authentication)
    }

    pub(crate) fn seal(plaintext: &[u8], key: &SecureKey) -> Result<SealedValue> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("Cipher init error: {}", e)))?;

        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| VaultError::Crypto("Encryption error".into()))?;

        // aes-gcm appends the tag: last 16 bytes.
        let tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);

        Ok(SealedValue {
            ciphertext,
            iv: iv.to_vec(),
            tag,
        })
    }
}
