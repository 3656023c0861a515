//! Process-scoped wiring: pools, KMS client, coordinator and reconciler.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{MetadataLogger, TracingMetadataLogger};
use crate::azure_kms::AzureKeyVaultClient;
use crate::config::{ReconcileConfig, VaultConfig};
use crate::envelope::EnvelopeCoordinator;
use crate::error::Result;
use crate::postgres_storage::{PostgresKeyStore, PostgresPiiStore};
use crate::reconcile::{OrphanLedger, Reconciler};
use crate::retry::{with_backoff, RetryConfig};
use crate::storage::{FieldLabels, FieldSummary};

pub type PostgresCoordinator =
    EnvelopeCoordinator<PostgresPiiStore, PostgresKeyStore, AzureKeyVaultClient>;

/// The running service. Built once at startup and shared by every request.
pub struct Vault {
    coordinator: PostgresCoordinator,
    retry: RetryConfig,
    reconcile: ReconcileConfig,
}

impl Vault {
    /// Connect both datastores and the KMS. Any failure here must stop the
    /// process from serving.
    pub async fn connect(config: VaultConfig) -> Result<Self> {
        Self::connect_with_logger(config, Arc::new(TracingMetadataLogger)).await
    }

    pub async fn connect_with_logger(
        config: VaultConfig,
        audit: Arc<dyn MetadataLogger>,
    ) -> Result<Self> {
        config.validate()?;

        let kms = AzureKeyVaultClient::connect(&config.kms).await?;
        let pii = PostgresPiiStore::connect(&config.pii_store).await?;
        let keys = PostgresKeyStore::connect(&config.key_store).await?;
        info!("connected to pii store and key store");

        let coordinator = EnvelopeCoordinator::new(
            Arc::new(pii),
            Arc::new(keys),
            Arc::new(kms),
            Arc::new(OrphanLedger::new()),
            audit,
        );

        Ok(Self {
            coordinator,
            retry: config.retry,
            reconcile: config.reconcile,
        })
    }

    pub fn coordinator(&self) -> &PostgresCoordinator {
        &self.coordinator
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.coordinator.pii_store().ensure_schema().await?;
        self.coordinator.key_store().ensure_schema().await
    }

    pub async fn store_field(&self, labels: FieldLabels, plaintext: &str) -> Result<Uuid> {
        with_backoff(&self.retry, "store_field", || {
            self.coordinator.store_field(labels.clone(), plaintext)
        })
        .await
    }

    pub async fn retrieve_field(&self, record_id: Uuid) -> Result<Zeroizing<String>> {
        with_backoff(&self.retry, "retrieve_field", || {
            self.coordinator.retrieve_field(record_id)
        })
        .await
    }

    pub async fn update_field(&self, record_id: Uuid, plaintext: &str) -> Result<Uuid> {
        with_backoff(&self.retry, "update_field", || {
            self.coordinator.update_field(record_id, plaintext)
        })
        .await
    }

    pub async fn delete_field(&self, record_id: Uuid) -> Result<()> {
        self.coordinator.delete_field(record_id).await
    }

    pub async fn list_fields(&self, owner_id: i64) -> Result<Vec<FieldSummary>> {
        self.coordinator.list_fields(owner_id).await
    }

    pub fn reconciler(&self) -> Reconciler<PostgresPiiStore, PostgresKeyStore> {
        Reconciler::new(
            Arc::clone(self.coordinator.pii_store()),
            Arc::clone(self.coordinator.key_store()),
            Arc::clone(self.coordinator.ledger()),
            Duration::from_secs(self.reconcile.grace_secs),
        )
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    /// Drain both pools.
    pub async fn shutdown(self) {
        self.coordinator.pii_store().close().await;
        self.coordinator.key_store().close().await;
        info!("vault shut down");
    }
}
