//! Dual-store persistence
//!
//! Ciphertext rows and wrapped-key rows live behind two separate traits so
//! they can be backed by two separate databases. Rows are correlated only by
//! `record_id`; there is no cross-store transaction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::kms::WrappedDek;

/// Classification label attached to every stored field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Critical => "critical",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            "critical" => Ok(Sensitivity::Critical),
            other => Err(VaultError::Serialization(format!(
                "unknown sensitivity: {}",
                other
            ))),
        }
    }
}

/// Non-secret identity and classification of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLabels {
    pub owner_id: i64,
    pub category: String,
    pub field_name: String,
    pub sensitivity: Sensitivity,
}

impl FieldLabels {
    pub fn new(
        owner_id: i64,
        category: impl Into<String>,
        field_name: impl Into<String>,
        sensitivity: Sensitivity,
    ) -> Self {
        Self {
            owner_id,
            category: category.into(),
            field_name: field_name.into(),
            sensitivity,
        }
    }
}

/// Row in the PII store
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub record_id: Uuid,
    pub labels: FieldLabels,
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce
    pub iv: Vec<u8>,
    /// 128-bit GCM tag
    pub auth_tag: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField")
            .field("record_id", &self.record_id)
            .field("labels", &self.labels)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Row in the key store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyRecord {
    pub record_id: Uuid,
    pub wrapped: WrappedDek,
    pub created_at: DateTime<Utc>,
}

/// Field metadata without any encrypted material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub record_id: Uuid,
    pub labels: FieldLabels,
    pub created_at: DateTime<Utc>,
}

impl From<&EncryptedField> for FieldSummary {
    fn from(field: &EncryptedField) -> Self {
        Self {
            record_id: field.record_id,
            labels: field.labels.clone(),
            created_at: field.created_at,
        }
    }
}

/// Position of a row in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowStamp {
    pub created_at: DateTime<Utc>,
    pub record_id: Uuid,
}

/// One page of a creation-time scan: rows with `from <= created_at < to`,
/// ordered by `(created_at, record_id)`, strictly after `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPage {
    /// Open lower bound when `None`
    pub from: Option<DateTime<Utc>>,
    pub to: DateTime<Utc>,
    pub after: Option<RowStamp>,
    pub limit: usize,
}

impl ScanPage {
    fn admits(&self, stamp: &RowStamp) -> bool {
        self.from.map_or(true, |from| stamp.created_at >= from)
            && stamp.created_at < self.to
            && self.after.map_or(true, |after| *stamp > after)
    }
}

fn page_of(mut stamps: Vec<RowStamp>, page: &ScanPage) -> Vec<RowStamp> {
    stamps.retain(|s| page.admits(s));
    stamps.sort();
    stamps.truncate(page.limit);
    stamps
}

/// Store for ciphertext, iv, tag and field labels
#[async_trait]
pub trait PiiStore: Send + Sync {
    async fn insert_field(&self, field: &EncryptedField) -> Result<()>;

    async fn fetch_field(&self, record_id: &Uuid) -> Result<Option<EncryptedField>>;

    /// Returns whether a row was removed
    async fn delete_field(&self, record_id: &Uuid) -> Result<bool>;

    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<FieldSummary>>;

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>>;

    /// The subset of `record_ids` that has a row here
    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>>;
}

/// Store for wrapped DEKs
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn insert_wrapped_key(&self, record: &WrappedKeyRecord) -> Result<()>;

    async fn fetch_wrapped_key(&self, record_id: &Uuid) -> Result<Option<WrappedKeyRecord>>;

    /// Returns whether a row was removed
    async fn delete_wrapped_key(&self, record_id: &Uuid) -> Result<bool>;

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>>;

    /// The subset of `record_ids` that has a row here
    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>>;
}

/// In-memory PII store
///
/// Suitable for development and tests. Data is lost when the process
/// terminates.
#[derive(Default)]
pub struct InMemoryPiiStore {
    fields: RwLock<HashMap<Uuid, EncryptedField>>,
}

impl InMemoryPiiStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }
}

#[async_trait]
impl PiiStore for InMemoryPiiStore {
    async fn insert_field(&self, field: &EncryptedField) -> Result<()> {
        let mut fields = self.fields.write();
        if fields.contains_key(&field.record_id) {
            return Err(VaultError::Storage(format!(
                "field {} already exists",
                field.record_id
            )));
        }
        fields.insert(field.record_id, field.clone());
        Ok(())
    }

    async fn fetch_field(&self, record_id: &Uuid) -> Result<Option<EncryptedField>> {
        Ok(self.fields.read().get(record_id).cloned())
    }

    async fn delete_field(&self, record_id: &Uuid) -> Result<bool> {
        Ok(self.fields.write().remove(record_id).is_some())
    }

    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<FieldSummary>> {
        let fields = self.fields.read();
        let mut summaries: Vec<_> = fields
            .values()
            .filter(|f| f.labels.owner_id == owner_id)
            .map(FieldSummary::from)
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        let stamps = self
            .fields
            .read()
            .values()
            .map(|f| RowStamp {
                created_at: f.created_at,
                record_id: f.record_id,
            })
            .collect();
        Ok(page_of(stamps, page))
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        let fields = self.fields.read();
        Ok(record_ids
            .iter()
            .filter(|id| fields.contains_key(id))
            .copied()
            .collect())
    }
}

/// In-memory key store
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<Uuid, WrappedKeyRecord>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn insert_wrapped_key(&self, record: &WrappedKeyRecord) -> Result<()> {
        let mut keys = self.keys.write();
        if keys.contains_key(&record.record_id) {
            return Err(VaultError::Storage(format!(
                "wrapped key {} already exists",
                record.record_id
            )));
        }
        keys.insert(record.record_id, record.clone());
        Ok(())
    }

    async fn fetch_wrapped_key(&self, record_id: &Uuid) -> Result<Option<WrappedKeyRecord>> {
        Ok(self.keys.read().get(record_id).cloned())
    }

    async fn delete_wrapped_key(&self, record_id: &Uuid) -> Result<bool> {
        Ok(self.keys.write().remove(record_id).is_some())
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        let stamps = self
            .keys
            .read()
            .values()
            .map(|k| RowStamp {
                created_at: k.created_at,
                record_id: k.record_id,
            })
            .collect();
        Ok(page_of(stamps, page))
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        let keys = self.keys.read();
        Ok(record_ids
            .iter()
            .filter(|id| keys.contains_key(id))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KeyReference;
    use chrono::Duration;

    fn field(owner_id: i64, name: &str, created_at: DateTime<Utc>) -> EncryptedField {
        EncryptedField {
            record_id: Uuid::new_v4(),
            labels: FieldLabels::new(owner_id, "identity", name, Sensitivity::High),
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            auth_tag: vec![0; 16],
            created_at,
        }
    }

    #[tokio::test]
    async fn test_in_memory_pii_store() {
        let store = InMemoryPiiStore::new();
        let f = field(42, "ssn", Utc::now());

        store.insert_field(&f).await.unwrap();
        assert_eq!(store.fetch_field(&f.record_id).await.unwrap(), Some(f.clone()));
        assert!(store.insert_field(&f).await.is_err());

        assert!(store.delete_field(&f.record_id).await.unwrap());
        assert!(!store.delete_field(&f.record_id).await.unwrap());
        assert!(store.fetch_field(&f.record_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let store = InMemoryPiiStore::new();
        let now = Utc::now();
        store.insert_field(&field(42, "ssn", now)).await.unwrap();
        store
            .insert_field(&field(42, "dob", now - Duration::seconds(5)))
            .await
            .unwrap();
        store.insert_field(&field(7, "ssn", now)).await.unwrap();

        let summaries = store.list_by_owner(42).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].labels.field_name, "dob");
        assert_eq!(summaries[1].labels.field_name, "ssn");
    }

    #[tokio::test]
    async fn test_key_store_scan_created_window() {
        let store = InMemoryKeyStore::new();
        let now = Utc::now();
        let old = WrappedKeyRecord {
            record_id: Uuid::new_v4(),
            wrapped: WrappedDek {
                wrapped_key: vec![9; 60],
                key_ref: KeyReference::new("master-kek", "1"),
            },
            created_at: now - Duration::minutes(30),
        };
        let fresh = WrappedKeyRecord {
            record_id: Uuid::new_v4(),
            created_at: now,
            ..old.clone()
        };
        store.insert_wrapped_key(&old).await.unwrap();
        store.insert_wrapped_key(&fresh).await.unwrap();

        let page = ScanPage {
            from: None,
            to: now - Duration::minutes(10),
            after: None,
            limit: 100,
        };
        let stamps = store.scan_created(&page).await.unwrap();
        assert_eq!(
            stamps,
            vec![RowStamp {
                created_at: old.created_at,
                record_id: old.record_id
            }]
        );

        // A lower bound past the old row leaves nothing.
        let page = ScanPage {
            from: Some(now - Duration::minutes(20)),
            ..page
        };
        assert!(store.scan_created(&page).await.unwrap().is_empty());

        let found = store
            .existing_ids(&[old.record_id, Uuid::new_v4(), fresh.record_id])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from([old.record_id, fresh.record_id]));
    }

    #[tokio::test]
    async fn test_pii_store_scan_pages_in_creation_order() {
        let store = InMemoryPiiStore::new();
        let base = Utc::now() - Duration::hours(1);
        // Two rows share a timestamp; the record id breaks the tie.
        let created = [base, base, base + Duration::seconds(1), base + Duration::seconds(2)];
        for (i, at) in created.iter().enumerate() {
            store
                .insert_field(&field(42, &format!("f{i}"), *at))
                .await
                .unwrap();
        }

        let mut page = ScanPage {
            from: None,
            to: Utc::now(),
            after: None,
            limit: 3,
        };
        let first = store.scan_created(&page).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0] < w[1]));

        page.after = first.last().copied();
        let second = store.scan_created(&page).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0] > first[2]);
        assert_eq!(second[0].created_at, base + Duration::seconds(2));
    }

    #[test]
    fn test_sensitivity_parse() {
        assert_eq!("HIGH".parse::<Sensitivity>().unwrap(), Sensitivity::High);
        assert_eq!(" critical ".parse::<Sensitivity>().unwrap(), Sensitivity::Critical);
        assert!("secret".parse::<Sensitivity>().is_err());
        assert_eq!(Sensitivity::Medium.to_string(), "medium");
        assert_eq!(serde_json::to_string(&Sensitivity::Low).unwrap(), "\"low\"");
    }
}
