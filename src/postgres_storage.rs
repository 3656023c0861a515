use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Result, VaultError};
use crate::kms::{KeyReference, WrappedDek};
use crate::storage::{
    EncryptedField, FieldLabels, FieldSummary, KeyStore, PiiStore, RowStamp, ScanPage,
};

/// PostgreSQL PII store
///
/// Holds ciphertext, iv, tag and labels only. Never reachable with the key
/// store's connection string.
pub struct PostgresPiiStore {
    pool: PgPool,
}

/// PostgreSQL key store
///
/// Holds wrapped DEKs only.
pub struct PostgresKeyStore {
    pool: PgPool,
}

async fn connect_pool(cfg: &StoreConfig, name: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.acquire_timeout())
        .connect(&cfg.url)
        .await
        .map_err(|e| VaultError::Storage(format!("Failed to connect to {} store: {}", name, e)))
}

// The connection goes back to the pool when the guard drops, on every exit path.
async fn acquire(pool: &PgPool, name: &str) -> Result<PoolConnection<Postgres>> {
    pool.acquire()
        .await
        .map_err(|e| VaultError::Storage(format!("Failed to acquire {} store connection: {}", name, e)))
}

fn storage_err(op: &str) -> impl FnOnce(sqlx::Error) -> VaultError + '_ {
    move |e| VaultError::Storage(format!("Failed to {}: {}", op, e))
}

// `table` is always one of the two fixed table names, never caller input.
async fn scan_table(pool: &PgPool, name: &str, table: &str, page: &ScanPage) -> Result<Vec<RowStamp>> {
    let mut conn = acquire(pool, name).await?;
    let sql = format!(
        r#"
        SELECT record_id, created_at
        FROM {table}
        WHERE ($1::timestamptz IS NULL OR created_at >= $1)
          AND created_at < $2
          AND ($3::timestamptz IS NULL OR (created_at, record_id) > ($3::timestamptz, $4::uuid))
        ORDER BY created_at, record_id
        LIMIT $5
        "#
    );
    let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
    let rows = sqlx::query(&sql)
        .bind(page.from)
        .bind(page.to)
        .bind(page.after.map(|a| a.created_at))
        .bind(page.after.map(|a| a.record_id))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err("scan rows by creation time"))?;

    rows.iter()
        .map(|r| {
            Ok(RowStamp {
                created_at: r.try_get("created_at").map_err(storage_err("read row stamp"))?,
                record_id: r.try_get("record_id").map_err(storage_err("read row stamp"))?,
            })
        })
        .collect()
}

async fn existing_in(pool: &PgPool, name: &str, table: &str, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
    if record_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let mut conn = acquire(pool, name).await?;
    let sql = format!("SELECT record_id FROM {table} WHERE record_id = ANY($1)");
    let rows = sqlx::query(&sql)
        .bind(record_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err("check record ids"))?;

    rows.iter()
        .map(|r| r.try_get("record_id").map_err(storage_err("read record id")))
        .collect()
}

impl PostgresPiiStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self::new(connect_pool(cfg, "pii").await?))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `pii_fields` table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = acquire(&self.pool, "pii").await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pii_fields (
                record_id   UUID PRIMARY KEY,
                owner_id    BIGINT NOT NULL,
                category    TEXT NOT NULL,
                field_name  TEXT NOT NULL,
                sensitivity TEXT NOT NULL,
                ciphertext  BYTEA NOT NULL,
                iv          BYTEA NOT NULL,
                auth_tag    BYTEA NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(storage_err("create pii_fields"))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS pii_fields_owner_idx ON pii_fields (owner_id)")
            .execute(&mut *conn)
            .await
            .map_err(storage_err("create pii_fields owner index"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS pii_fields_created_idx ON pii_fields (created_at, record_id)",
        )
        .execute(&mut *conn)
        .await
        .map_err(storage_err("create pii_fields created index"))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn labels_from_row(r: &PgRow) -> Result<FieldLabels> {
    let sensitivity: String = r.try_get("sensitivity").map_err(storage_err("read field"))?;
    Ok(FieldLabels {
        owner_id: r.try_get("owner_id").map_err(storage_err("read field"))?,
        category: r.try_get("category").map_err(storage_err("read field"))?,
        field_name: r.try_get("field_name").map_err(storage_err("read field"))?,
        sensitivity: sensitivity.parse()?,
    })
}

fn field_from_row(r: &PgRow) -> Result<EncryptedField> {
    Ok(EncryptedField {
        record_id: r.try_get("record_id").map_err(storage_err("read field"))?,
        labels: labels_from_row(r)?,
        ciphertext: r.try_get("ciphertext").map_err(storage_err("read field"))?,
        iv: r.try_get("iv").map_err(storage_err("read field"))?,
        auth_tag: r.try_get("auth_tag").map_err(storage_err("read field"))?,
        created_at: r.try_get("created_at").map_err(storage_err("read field"))?,
    })
}

#[async_trait]
impl PiiStore for PostgresPiiStore {
    async fn insert_field(&self, field: &EncryptedField) -> Result<()> {
        let mut conn = acquire(&self.pool, "pii").await?;
        sqlx::query(
            r#"
            INSERT INTO pii_fields (record_id, owner_id, category, field_name, sensitivity, ciphertext, iv, auth_tag, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(field.record_id)
        .bind(field.labels.owner_id)
        .bind(&field.labels.category)
        .bind(&field.labels.field_name)
        .bind(field.labels.sensitivity.as_str())
        .bind(&field.ciphertext)
        .bind(&field.iv)
        .bind(&field.auth_tag)
        .bind(field.created_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_err("store field"))?;

        Ok(())
    }

    async fn fetch_field(&self, record_id: &Uuid) -> Result<Option<EncryptedField>> {
        let mut conn = acquire(&self.pool, "pii").await?;
        let row = sqlx::query(
            r#"
            SELECT record_id, owner_id, category, field_name, sensitivity, ciphertext, iv, auth_tag, created_at
            FROM pii_fields
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err("get field"))?;

        row.as_ref().map(field_from_row).transpose()
    }

    async fn delete_field(&self, record_id: &Uuid) -> Result<bool> {
        let mut conn = acquire(&self.pool, "pii").await?;
        let result = sqlx::query("DELETE FROM pii_fields WHERE record_id = $1")
            .bind(record_id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err("delete field"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<FieldSummary>> {
        let mut conn = acquire(&self.pool, "pii").await?;
        let rows = sqlx::query(
            r#"
            SELECT record_id, owner_id, category, field_name, sensitivity, created_at
            FROM pii_fields
            WHERE owner_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err("list fields by owner"))?;

        rows.iter()
            .map(|r| {
                Ok(FieldSummary {
                    record_id: r.try_get("record_id").map_err(storage_err("read field"))?,
                    labels: labels_from_row(r)?,
                    created_at: r.try_get("created_at").map_err(storage_err("read field"))?,
                })
            })
            .collect()
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        scan_table(&self.pool, "pii", "pii_fields", page).await
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        existing_in(&self.pool, "pii", "pii_fields", record_ids).await
    }
}

impl PostgresKeyStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self::new(connect_pool(cfg, "key").await?))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `wrapped_keys` table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = acquire(&self.pool, "key").await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wrapped_keys (
                record_id   UUID PRIMARY KEY,
                wrapped_key BYTEA NOT NULL,
                kek_name    TEXT NOT NULL,
                kek_version TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(storage_err("create wrapped_keys"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS wrapped_keys_created_idx ON wrapped_keys (created_at, record_id)",
        )
        .execute(&mut *conn)
        .await
        .map_err(storage_err("create wrapped_keys created index"))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyStore for PostgresKeyStore {
    async fn insert_wrapped_key(&self, record: &crate::storage::WrappedKeyRecord) -> Result<()> {
        let mut conn = acquire(&self.pool, "key").await?;
        sqlx::query(
            r#"
            INSERT INTO wrapped_keys (record_id, wrapped_key, kek_name, kek_version, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.record_id)
        .bind(&record.wrapped.wrapped_key)
        .bind(&record.wrapped.key_ref.name)
        .bind(&record.wrapped.key_ref.version)
        .bind(record.created_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_err("store wrapped key"))?;

        Ok(())
    }

    async fn fetch_wrapped_key(
        &self,
        record_id: &Uuid,
    ) -> Result<Option<crate::storage::WrappedKeyRecord>> {
        let mut conn = acquire(&self.pool, "key").await?;
        let row = sqlx::query(
            r#"
            SELECT record_id, wrapped_key, kek_name, kek_version, created_at
            FROM wrapped_keys
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err("get wrapped key"))?;

        row.map(|r| {
            let name: String = r.try_get("kek_name").map_err(storage_err("read wrapped key"))?;
            let version: String = r.try_get("kek_version").map_err(storage_err("read wrapped key"))?;
            Ok(crate::storage::WrappedKeyRecord {
                record_id: r.try_get("record_id").map_err(storage_err("read wrapped key"))?,
                wrapped: WrappedDek {
                    wrapped_key: r.try_get("wrapped_key").map_err(storage_err("read wrapped key"))?,
                    key_ref: KeyReference::new(name, version),
                },
                created_at: r.try_get("created_at").map_err(storage_err("read wrapped key"))?,
            })
        })
        .transpose()
    }

    async fn delete_wrapped_key(&self, record_id: &Uuid) -> Result<bool> {
        let mut conn = acquire(&self.pool, "key").await?;
        let result = sqlx::query("DELETE FROM wrapped_keys WHERE record_id = $1")
            .bind(record_id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err("delete wrapped key"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn scan_created(&self, page: &ScanPage) -> Result<Vec<RowStamp>> {
        scan_table(&self.pool, "key", "wrapped_keys", page).await
    }

    async fn existing_ids(&self, record_ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        existing_in(&self.pool, "key", "wrapped_keys", record_ids).await
    }
}
