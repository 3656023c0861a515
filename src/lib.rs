pub mod audit;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod kms;
pub mod reconcile;
pub mod retry;
pub mod storage;

// Production backends
pub mod azure_kms;
pub mod postgres_storage;
pub mod service;

pub use audit::{
    AuditAction, AuditEvent, JsonLinesMetadataLogger, MemoryMetadataLogger, MetadataLogger,
    TracingMetadataLogger,
};
pub use config::{IdentityConfig, KmsConfig, ReconcileConfig, StoreConfig, VaultConfig};
pub use crypto::{generate_dek, AesGcmCipher, SealedValue, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use envelope::EnvelopeCoordinator;
pub use error::{Result, StoreKind, VaultError};
pub use kms::{KeyReference, KeyWrapper, LocalKeyWrapper, WrappedDek};
pub use reconcile::{OrphanLedger, Reconciler, SweepReport};
pub use retry::{with_backoff, RetryConfig};
pub use storage::{
    EncryptedField, FieldLabels, FieldSummary, InMemoryKeyStore, InMemoryPiiStore, KeyStore,
    PiiStore, RowStamp, ScanPage, Sensitivity, WrappedKeyRecord,
};

// Production exports
pub use azure_kms::{AzureKeyVaultClient, ManagedIdentityCredential};
pub use postgres_storage::{PostgresKeyStore, PostgresPiiStore};
pub use service::{PostgresCoordinator, Vault};
