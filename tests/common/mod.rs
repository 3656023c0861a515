//! Fault-injecting stores and wrappers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use pii_vault::{
    EncryptedField, EnvelopeCoordinator, FieldSummary, InMemoryKeyStore, InMemoryPiiStore,
    KeyReference, KeyStore, KeyWrapper, LocalKeyWrapper, MemoryMetadataLogger, OrphanLedger,
    PiiStore, Result, RowStamp, ScanPage, SecureKey, VaultError, WrappedDek, WrappedKeyRecord,
};

/// Switches shared by both faulty stores.
#[derive(Default)]
pub struct Faults {
    pub fail_insert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub hang_insert: AtomicBool,
}

impl Faults {
    fn insert(&self, store: &str) -> Option<VaultError> {
        self.fail_insert
            .load(Ordering::SeqCst)
            .then(|| VaultError::Storage(format!("{} store insert refused", store)))
    }

    fn delete(&self, store: &str) -> Option<VaultError> {
        self.fail_delete
            .load(Ordering::SeqCst)
            .then(|| VaultError::Storage(format!("{} store delete refused", store)))
    }
}

/// Read traffic seen by a store.
#[derive(Default)]
pub struct Reads {
    /// Rows handed out by creation-time scans
    pub scanned_rows: AtomicUsize,
    /// Ids looked up, one by one or in a batch
    pub looked_up: AtomicUsize,
    pub batch_calls: AtomicUsize,
}

impl Reads {
    pub fn reset(&self) {
        self.scanned_rows.store(0, Ordering::SeqCst);
        self.looked_up.store(0, Ordering::SeqCst);
        self.batch_calls.store(0, Ordering::SeqCst);
    }

    fn scanned(&self, rows: &[RowStamp]) {
        self.scanned_rows.fetch_add(rows.len(), Ordering::SeqCst);
    }

    fn batch(&self, ids: &[Uuid]) {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.looked_up.fetch_add(ids.len(), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FaultyPiiStore {
    pub inner: InMemoryPiiStore,
    pub faults: Faults,
    pub reads: Reads,
}

#[async_trait]
impl PiiStore for FaultyPiiStore {
    async fn insert_field(&self, field: &EncryptedField) -> Result<()> {
        if self.faults.hang_insert.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(e) = self.faults.insert("pii") {
            return Err(e);
        }
        self.inner.insert_field(field).await
    }

    async fn fetch_field(&self, record_id: &Uuid) -> Result<Option<EncryptedField>> {
        self.reads.looked_up.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_field(record_id).await
    }

    async fn delete_field(&self, record_id: &Uuid) -> Result<bool> {
        if let Some(e) = self.faults.delete("pii") {
            return Err(e);
        }
        self.inner.delete_field(record_id).await
    }

    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<FieldSummary>> {
        self.inner.list_by_owner(owner_id).await
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        let rows = self.inner.scan_created(page).await?;
        self.reads.scanned(&rows);
        Ok(rows)
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        self.reads.batch(record_ids);
        self.inner.existing_ids(record_ids).await
    }
}

#[derive(Default)]
pub struct FaultyKeyStore {
    pub inner: InMemoryKeyStore,
    pub faults: Faults,
    pub reads: Reads,
}

#[async_trait]
impl KeyStore for FaultyKeyStore {
    async fn insert_wrapped_key(&self, record: &WrappedKeyRecord) -> Result<()> {
        if self.faults.hang_insert.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(e) = self.faults.insert("key") {
            return Err(e);
        }
        self.inner.insert_wrapped_key(record).await
    }

    async fn fetch_wrapped_key(&self, record_id: &Uuid) -> Result<Option<WrappedKeyRecord>> {
        self.reads.looked_up.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_wrapped_key(record_id).await
    }

    async fn delete_wrapped_key(&self, record_id: &Uuid) -> Result<bool> {
        if let Some(e) = self.faults.delete("key") {
            return Err(e);
        }
        self.inner.delete_wrapped_key(record_id).await
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        let rows = self.inner.scan_created(page).await?;
        self.reads.scanned(&rows);
        Ok(rows)
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        self.reads.batch(record_ids);
        self.inner.existing_ids(record_ids).await
    }
}

/// Local wrapper that can fail on demand and remembers every DEK it saw.
pub struct SpyWrapper {
    inner: LocalKeyWrapper,
    pub wrap_failure: Mutex<Option<fn() -> VaultError>>,
    /// Number of upcoming wraps that fail with `KmsUnavailable`
    pub unavailable_for: AtomicU32,
    /// 1-based wrap call from which every wrap is refused; 0 disables
    pub refuse_from_call: AtomicU32,
    pub wrap_calls: AtomicU32,
    pub seen_deks: Mutex<Vec<[u8; 32]>>,
}

impl SpyWrapper {
    pub fn new() -> Self {
        Self {
            inner: LocalKeyWrapper::generate("master-kek"),
            wrap_failure: Mutex::new(None),
            unavailable_for: AtomicU32::new(0),
            refuse_from_call: AtomicU32::new(0),
            wrap_calls: AtomicU32::new(0),
            seen_deks: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_wraps_with(&self, make: fn() -> VaultError) {
        *self.wrap_failure.lock() = Some(make);
    }
}

#[async_trait]
impl KeyWrapper for SpyWrapper {
    fn key_ref(&self) -> &KeyReference {
        self.inner.key_ref()
    }

    async fn wrap(&self, dek: &SecureKey) -> Result<WrappedDek> {
        let call = self.wrap_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(make) = *self.wrap_failure.lock() {
            return Err(make());
        }
        let refuse_from = self.refuse_from_call.load(Ordering::SeqCst);
        if refuse_from != 0 && call >= refuse_from {
            return Err(VaultError::WrapFailure("wrap refused".into()));
        }
        let pending = self.unavailable_for.load(Ordering::SeqCst);
        if pending > 0 {
            self.unavailable_for.store(pending - 1, Ordering::SeqCst);
            return Err(VaultError::KmsUnavailable("connection reset".into()));
        }
        self.seen_deks.lock().push(*dek.as_bytes());
        self.inner.wrap(dek).await
    }

    async fn unwrap(&self, wrapped: &WrappedDek) -> Result<SecureKey> {
        self.inner.unwrap(wrapped).await
    }
}

pub type TestCoordinator = EnvelopeCoordinator<FaultyPiiStore, FaultyKeyStore, SpyWrapper>;

pub struct Harness {
    pub coordinator: TestCoordinator,
    pub pii: Arc<FaultyPiiStore>,
    pub keys: Arc<FaultyKeyStore>,
    pub wrapper: Arc<SpyWrapper>,
    pub ledger: Arc<OrphanLedger>,
    pub audit: Arc<MemoryMetadataLogger>,
}

pub fn harness() -> Harness {
    let pii = Arc::new(FaultyPiiStore::default());
    let keys = Arc::new(FaultyKeyStore::default());
    let wrapper = Arc::new(SpyWrapper::new());
    let ledger = Arc::new(OrphanLedger::new());
    let audit = Arc::new(MemoryMetadataLogger::new());
    let coordinator = EnvelopeCoordinator::new(
        Arc::clone(&pii),
        Arc::clone(&keys),
        Arc::clone(&wrapper),
        Arc::clone(&ledger),
        audit.clone(),
    );
    Harness {
        coordinator,
        pii,
        keys,
        wrapper,
        ledger,
        audit,
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
