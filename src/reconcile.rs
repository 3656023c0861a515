//! Orphan tracking and cleanup across the two stores.
//!
//! The PII store and the key store share no transaction, so a write can land
//! in only one of them. The coordinator removes the stray row right away when
//! it can and notes it in the [`OrphanLedger`] when it cannot. The
//! [`Reconciler`] retries ledger entries and also scans both stores for aged
//! rows that have lost their counterpart.
//!
//! The scan is incremental. Each sweep covers `[watermark, now - grace)` in
//! pages, checking each page against the other store in one batch, and then
//! moves the watermark up to the cutoff. The first sweep after startup has no
//! watermark and covers everything older than the cutoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreKind};
use crate::storage::{KeyStore, PiiStore, RowStamp, ScanPage};

/// Rows fetched per scan page
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Rows known to need deletion.
#[derive(Debug, Default)]
pub struct OrphanLedger {
    entries: Mutex<HashSet<(Uuid, StoreKind)>>,
}

impl OrphanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&self, record_id: Uuid, store: StoreKind) {
        if self.entries.lock().insert((record_id, store)) {
            warn!(%record_id, store = %store, "row noted for reconciliation");
        }
    }

    /// Returns whether the entry was present.
    pub fn resolve(&self, record_id: &Uuid, store: StoreKind) -> bool {
        self.entries.lock().remove(&(*record_id, store))
    }

    pub fn contains(&self, record_id: &Uuid, store: StoreKind) -> bool {
        self.entries.lock().contains(&(*record_id, store))
    }

    pub fn snapshot(&self) -> Vec<(Uuid, StoreKind)> {
        let mut entries: Vec<_> = self.entries.lock().iter().copied().collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ledger entries whose row is now gone
    pub ledger_resolved: usize,
    /// Ciphertext rows deleted because their wrapped key was missing
    pub pii_orphans_removed: usize,
    /// Wrapped keys deleted because their ciphertext row was missing
    pub key_orphans_removed: usize,
    /// Deletes that failed and will be retried next sweep
    pub failures: usize,
    /// Rows read by the scan of both stores
    pub rows_scanned: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.ledger_resolved + self.pii_orphans_removed + self.key_orphans_removed
    }
}

/// Periodic cleanup of rows that exist in only one store.
pub struct Reconciler<P: PiiStore + ?Sized, K: KeyStore + ?Sized> {
    pii: Arc<P>,
    keys: Arc<K>,
    ledger: Arc<OrphanLedger>,
    grace: chrono::Duration,
    page_size: usize,
    // Rows created before this were checked by an earlier sweep.
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl<P: PiiStore + ?Sized, K: KeyStore + ?Sized> Reconciler<P, K> {
    /// Rows younger than `grace` are skipped by the scan, since their
    /// counterpart may still be in flight.
    pub fn new(pii: Arc<P>, keys: Arc<K>, ledger: Arc<OrphanLedger>, grace: Duration) -> Self {
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            pii,
            keys,
            ledger,
            grace,
            page_size: DEFAULT_PAGE_SIZE,
            watermark: Mutex::new(None),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn ledger(&self) -> &Arc<OrphanLedger> {
        &self.ledger
    }

    /// Upper bound of the last completed scan
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock()
    }

    async fn delete_in(&self, record_id: &Uuid, store: StoreKind) -> Result<bool> {
        match store {
            StoreKind::Pii => self.pii.delete_field(record_id).await,
            StoreKind::Key => self.keys.delete_wrapped_key(record_id).await,
        }
    }

    async fn scan_in(&self, store: StoreKind, page: &ScanPage) -> Result<Vec<RowStamp>> {
        match store {
            StoreKind::Pii => self.pii.scan_created(page).await,
            StoreKind::Key => self.keys.scan_created(page).await,
        }
    }

    async fn existing_in(&self, store: StoreKind, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        match store {
            StoreKind::Pii => self.pii.existing_ids(record_ids).await,
            StoreKind::Key => self.keys.existing_ids(record_ids).await,
        }
    }

    /// Run one pass: ledger first, then the aged-row scan of each store.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for (record_id, store) in self.ledger.snapshot() {
            match self.delete_in(&record_id, store).await {
                Ok(_) => {
                    self.ledger.resolve(&record_id, store);
                    report.ledger_resolved += 1;
                }
                Err(e) => {
                    warn!(%record_id, store = %store, error = %e, "ledger delete failed");
                    report.failures += 1;
                }
            }
        }

        let from = self.watermark();
        match now.checked_sub_signed(self.grace) {
            Some(cutoff) if from.map_or(true, |w| w < cutoff) => {
                self.scan_store(StoreKind::Pii, from, cutoff, &mut report).await?;
                self.scan_store(StoreKind::Key, from, cutoff, &mut report).await?;
                let mut watermark = self.watermark.lock();
                if watermark.map_or(true, |w| w < cutoff) {
                    *watermark = Some(cutoff);
                }
            }
            _ => debug!("no rows aged past the grace window since the last sweep"),
        }

        if report.removed() > 0 || report.failures > 0 {
            info!(
                ledger_resolved = report.ledger_resolved,
                pii_orphans_removed = report.pii_orphans_removed,
                key_orphans_removed = report.key_orphans_removed,
                failures = report.failures,
                rows_scanned = report.rows_scanned,
                "reconciliation sweep finished"
            );
        } else {
            debug!(rows_scanned = report.rows_scanned, "reconciliation sweep found nothing to do");
        }
        Ok(report)
    }

    /// Delete rows of `store` created in `[from, to)` whose counterpart is gone.
    async fn scan_store(
        &self,
        store: StoreKind,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let other = match store {
            StoreKind::Pii => StoreKind::Key,
            StoreKind::Key => StoreKind::Pii,
        };
        let mut page = ScanPage {
            from,
            to,
            after: None,
            limit: self.page_size,
        };

        loop {
            let stamps = self.scan_in(store, &page).await?;
            if stamps.is_empty() {
                return Ok(());
            }
            report.rows_scanned += stamps.len();

            let ids: Vec<Uuid> = stamps.iter().map(|s| s.record_id).collect();
            let paired = self.existing_in(other, &ids).await?;

            // A ciphertext row without its wrapped key can never be read
            // again; a wrapped key without its row protects nothing.
            for record_id in ids.iter().filter(|id| !paired.contains(id)) {
                match self.delete_in(record_id, store).await {
                    Ok(true) => match store {
                        StoreKind::Pii => report.pii_orphans_removed += 1,
                        StoreKind::Key => report.key_orphans_removed += 1,
                    },
                    Ok(false) => {}
                    Err(e) => {
                        warn!(%record_id, store = %store, error = %e, "failed to delete orphaned row");
                        self.ledger.note(*record_id, store);
                        report.failures += 1;
                    }
                }
            }

            if stamps.len() < self.page_size {
                return Ok(());
            }
            page.after = stamps.last().copied();
        }
    }

    /// Sweep every `interval` until `shutdown` turns true or its sender drops.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace.num_seconds(),
            "starting reconciler"
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!(error = %e, "reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
