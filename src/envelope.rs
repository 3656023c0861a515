//! Envelope coordinator: one DEK per field, two stores, no shared transaction.
//!
//! Write path: generate DEK → encrypt value → wrap DEK → persist both rows →
//! audit. Nothing is persisted until the value is encrypted and the DEK is
//! wrapped. If only one of the two inserts lands, the stray row is deleted
//! again (or entered in the [`OrphanLedger`]) and
//! [`VaultError::PartialWrite`] is returned.
//!
//! Read path: fetch both rows concurrently → unwrap → decrypt → audit.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditEvent, MetadataLogger};
use crate::crypto::{generate_dek, AesGcmCipher};
use crate::error::{Result, StoreKind, VaultError};
use crate::kms::KeyWrapper;
use crate::reconcile::OrphanLedger;
use crate::storage::{EncryptedField, FieldLabels, FieldSummary, KeyStore, PiiStore, WrappedKeyRecord};

/// Orchestrates envelope encryption over a PII store, a key store and a KEK.
pub struct EnvelopeCoordinator<P, K, W>
where
    P: PiiStore + ?Sized,
    K: KeyStore + ?Sized,
    W: KeyWrapper + ?Sized,
{
    pii: Arc<P>,
    keys: Arc<K>,
    wrapper: Arc<W>,
    ledger: Arc<OrphanLedger>,
    audit: Arc<dyn MetadataLogger>,
}

impl<P, K, W> Clone for EnvelopeCoordinator<P, K, W>
where
    P: PiiStore + ?Sized,
    K: KeyStore + ?Sized,
    W: KeyWrapper + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            pii: Arc::clone(&self.pii),
            keys: Arc::clone(&self.keys),
            wrapper: Arc::clone(&self.wrapper),
            ledger: Arc::clone(&self.ledger),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<P, K, W> EnvelopeCoordinator<P, K, W>
where
    P: PiiStore + ?Sized + 'static,
    K: KeyStore + ?Sized + 'static,
    W: KeyWrapper + ?Sized,
{
    pub fn new(
        pii: Arc<P>,
        keys: Arc<K>,
        wrapper: Arc<W>,
        ledger: Arc<OrphanLedger>,
        audit: Arc<dyn MetadataLogger>,
    ) -> Self {
        Self {
            pii,
            keys,
            wrapper,
            ledger,
            audit,
        }
    }

    pub fn pii_store(&self) -> &Arc<P> {
        &self.pii
    }

    pub fn key_store(&self) -> &Arc<K> {
        &self.keys
    }

    pub fn wrapper(&self) -> &Arc<W> {
        &self.wrapper
    }

    pub fn ledger(&self) -> &Arc<OrphanLedger> {
        &self.ledger
    }

    /// Encrypt `plaintext` under a fresh DEK and persist the envelope.
    ///
    /// Returns the record id shared by the ciphertext row and the wrapped-key
    /// row.
    pub async fn store_field(&self, labels: FieldLabels, plaintext: &str) -> Result<Uuid> {
        let field = self.seal_and_persist(labels, plaintext).await?;
        self.audit
            .record(&AuditEvent::new(&field.labels, AuditAction::Store));
        Ok(field.record_id)
    }

    async fn seal_and_persist(&self, labels: FieldLabels, plaintext: &str) -> Result<EncryptedField> {
        let record_id = Uuid::new_v4();

        let dek = generate_dek();
        debug!(%record_id, "generated DEK");

        let sealed = AesGcmCipher::encrypt(plaintext, &dek)?;
        debug!(%record_id, "encrypted value");

        let wrapped = self.wrapper.wrap(&dek).await?;
        drop(dek);
        debug!(%record_id, key = %wrapped.key_ref, "wrapped DEK");

        let created_at = Utc::now();
        let field = EncryptedField {
            record_id,
            labels,
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            auth_tag: sealed.tag,
            created_at,
        };
        let key_record = WrappedKeyRecord {
            record_id,
            wrapped,
            created_at,
        };

        self.persist_both(&field, &key_record).await?;
        debug!(%record_id, "persisted envelope");
        Ok(field)
    }

    async fn persist_both(&self, field: &EncryptedField, key_record: &WrappedKeyRecord) -> Result<()> {
        let record_id = field.record_id;
        let guard = PersistGuard::new(
            record_id,
            Arc::clone(&self.pii),
            Arc::clone(&self.keys),
            Arc::clone(&self.ledger),
        );

        let (pii_res, key_res) = tokio::join!(
            self.pii.insert_field(field),
            self.keys.insert_wrapped_key(key_record)
        );

        let outcome = match (pii_res, key_res) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(pii_err), Err(key_err)) => {
                warn!(%record_id, error = %key_err, "key store write failed");
                Err(pii_err)
            }
            (Ok(()), Err(cause)) => Err(self.compensate(record_id, StoreKind::Pii, cause).await),
            (Err(cause), Ok(())) => Err(self.compensate(record_id, StoreKind::Key, cause).await),
        };

        guard.disarm();
        outcome
    }

    /// Delete the row that did land and report the partial write.
    async fn compensate(&self, record_id: Uuid, written: StoreKind, cause: VaultError) -> VaultError {
        let deleted = match written {
            StoreKind::Pii => self.pii.delete_field(&record_id).await,
            StoreKind::Key => self.keys.delete_wrapped_key(&record_id).await,
        };
        let compensated = match deleted {
            Ok(_) => true,
            Err(e) => {
                warn!(%record_id, store = %written, error = %e, "compensating delete failed");
                self.ledger.note(record_id, written);
                false
            }
        };

        error!(
            %record_id,
            written = %written,
            compensated,
            cause = %cause,
            "partial write across pii and key stores"
        );
        VaultError::PartialWrite {
            record_id,
            written,
            compensated,
        }
    }

    /// Fetch, unwrap and decrypt one field.
    ///
    /// A missing row in either store is [`VaultError::RecordNotFound`]; a tag
    /// that does not verify is [`VaultError::Authentication`].
    pub async fn retrieve_field(&self, record_id: Uuid) -> Result<Zeroizing<String>> {
        let (field, key_record) = tokio::try_join!(
            self.pii.fetch_field(&record_id),
            self.keys.fetch_wrapped_key(&record_id)
        )?;

        let (field, key_record) = match (field, key_record) {
            (Some(field), Some(key_record)) => (field, key_record),
            (field, key_record) => {
                debug!(
                    %record_id,
                    pii_present = field.is_some(),
                    key_present = key_record.is_some(),
                    "envelope incomplete"
                );
                return Err(VaultError::RecordNotFound(record_id));
            }
        };

        let dek = self.wrapper.unwrap(&key_record.wrapped).await?;
        let plaintext = match AesGcmCipher::decrypt(&field.ciphertext, &field.iv, &field.auth_tag, &dek) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(e) => {
                if e.is_security_relevant() {
                    warn!(
                        %record_id,
                        owner_id = field.labels.owner_id,
                        field_name = %field.labels.field_name,
                        "ciphertext failed authentication; possible tampering"
                    );
                }
                return Err(e);
            }
        };
        drop(dek);

        self.audit
            .record(&AuditEvent::new(&field.labels, AuditAction::Retrieve));
        Ok(plaintext)
    }

    /// Remove a field. The wrapped key goes first so that the ciphertext is
    /// unreadable even if the second delete fails.
    pub async fn delete_field(&self, record_id: Uuid) -> Result<()> {
        let Some(field) = self.pii.fetch_field(&record_id).await? else {
            // No ciphertext means nothing readable was deleted, but a wrapped
            // key left behind by a partial write still goes.
            if self.keys.delete_wrapped_key(&record_id).await? {
                debug!(%record_id, "removed wrapped key with no ciphertext row");
            }
            return Err(VaultError::RecordNotFound(record_id));
        };

        let key_removed = self.keys.delete_wrapped_key(&record_id).await?;
        if let Err(e) = self.pii.delete_field(&record_id).await {
            self.ledger.note(record_id, StoreKind::Pii);
            return Err(e);
        }
        debug!(%record_id, key_removed, "deleted envelope");

        self.audit
            .record(&AuditEvent::new(&field.labels, AuditAction::Delete));
        Ok(())
    }

    /// Replace a field's value. The new value gets a new record id and a new
    /// DEK; the old envelope is removed afterwards.
    pub async fn update_field(&self, record_id: Uuid, plaintext: &str) -> Result<Uuid> {
        let labels = self
            .pii
            .fetch_field(&record_id)
            .await?
            .ok_or(VaultError::RecordNotFound(record_id))?
            .labels;

        let field = self.seal_and_persist(labels, plaintext).await?;

        if let Err(e) = self.keys.delete_wrapped_key(&record_id).await {
            warn!(%record_id, error = %e, "failed to remove superseded wrapped key");
            self.ledger.note(record_id, StoreKind::Key);
        }
        if let Err(e) = self.pii.delete_field(&record_id).await {
            warn!(%record_id, error = %e, "failed to remove superseded ciphertext");
            self.ledger.note(record_id, StoreKind::Pii);
        }

        debug!(old = %record_id, new = %field.record_id, "updated field");
        self.audit
            .record(&AuditEvent::new(&field.labels, AuditAction::Update));
        Ok(field.record_id)
    }

    /// Store several fields, each under its own DEK. On failure the fields
    /// already stored by this call are removed and the error is returned.
    pub async fn store_fields<'a, I>(&self, fields: I) -> Result<Vec<Uuid>>
    where
        I: IntoIterator<Item = (FieldLabels, &'a str)>,
    {
        let mut stored = Vec::new();
        for (labels, plaintext) in fields {
            match self.store_field(labels, plaintext).await {
                Ok(record_id) => stored.push(record_id),
                Err(e) => {
                    warn!(stored = stored.len(), error = %e, "batch store failed; rolling back");
                    for record_id in &stored {
                        self.discard(record_id).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(stored)
    }

    /// Retrieve several fields in order, stopping at the first failure.
    pub async fn retrieve_fields(&self, record_ids: &[Uuid]) -> Result<Vec<Zeroizing<String>>> {
        let mut values = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            values.push(self.retrieve_field(*record_id).await?);
        }
        Ok(values)
    }

    /// Labels of every field held for `owner_id`. Touches the PII store only.
    pub async fn list_fields(&self, owner_id: i64) -> Result<Vec<FieldSummary>> {
        self.pii.list_by_owner(owner_id).await
    }

    async fn discard(&self, record_id: &Uuid) {
        if let Err(e) = self.keys.delete_wrapped_key(record_id).await {
            warn!(%record_id, error = %e, "rollback of wrapped key failed");
            self.ledger.note(*record_id, StoreKind::Key);
        }
        if let Err(e) = self.pii.delete_field(record_id).await {
            warn!(%record_id, error = %e, "rollback of ciphertext failed");
            self.ledger.note(*record_id, StoreKind::Pii);
        }
    }
}

/// Armed while both inserts are in flight. Dropped without `disarm`, the
/// write was cancelled: both rows go into the ledger and best-effort deletes
/// are spawned.
struct PersistGuard<P: PiiStore + ?Sized + 'static, K: KeyStore + ?Sized + 'static> {
    record_id: Uuid,
    pii: Arc<P>,
    keys: Arc<K>,
    ledger: Arc<OrphanLedger>,
    armed: bool,
}

impl<P: PiiStore + ?Sized + 'static, K: KeyStore + ?Sized + 'static> PersistGuard<P, K> {
    fn new(record_id: Uuid, pii: Arc<P>, keys: Arc<K>, ledger: Arc<OrphanLedger>) -> Self {
        Self {
            record_id,
            pii,
            keys,
            ledger,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P: PiiStore + ?Sized + 'static, K: KeyStore + ?Sized + 'static> Drop for PersistGuard<P, K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let record_id = self.record_id;
        error!(%record_id, "envelope write cancelled; treating as partial write");
        self.ledger.note(record_id, StoreKind::Pii);
        self.ledger.note(record_id, StoreKind::Key);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pii = Arc::clone(&self.pii);
        let keys = Arc::clone(&self.keys);
        let ledger = Arc::clone(&self.ledger);
        handle.spawn(async move {
            if keys.delete_wrapped_key(&record_id).await.is_ok() {
                ledger.resolve(&record_id, StoreKind::Key);
            }
            if pii.delete_field(&record_id).await.is_ok() {
                ledger.resolve(&record_id, StoreKind::Pii);
            }
        });
    }
}
