//! Service configuration loaded from the environment.

use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::retry::RetryConfig;

pub const DEFAULT_KEY_NAME: &str = "master-kek";
pub const DEFAULT_KMS_API_VERSION: &str = "7.4";

/// Key Vault binding.
#[derive(Debug, Clone)]
pub struct KmsConfig {
    pub vault_url: String,
    pub key_name: String,
    /// Pin a KEK version; the latest version is resolved at connect otherwise.
    pub key_version: Option<String>,
    pub api_version: String,
    pub identity: IdentityConfig,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl KmsConfig {
    pub fn new(vault_url: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            vault_url: vault_url.into(),
            key_name: key_name.into(),
            key_version: None,
            api_version: DEFAULT_KMS_API_VERSION.to_string(),
            identity: IdentityConfig::default(),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.vault_url.trim();
        if url.is_empty() {
            return Err(VaultError::Config("KMS vault URL is empty".into()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(VaultError::Config(format!(
                "KMS vault URL must be http(s): {}",
                url
            )));
        }
        if self.key_name.trim().is_empty() {
            return Err(VaultError::Config("KMS key name is empty".into()));
        }
        Ok(())
    }
}

/// Where the ambient managed identity token is obtained.
#[derive(Clone, Default)]
pub struct IdentityConfig {
    /// App Service style endpoint; instance metadata otherwise.
    pub endpoint: Option<String>,
    /// Value for `X-IDENTITY-HEADER` when `endpoint` is set.
    pub header: Option<String>,
    /// Override for the instance metadata endpoint.
    pub imds_endpoint: Option<String>,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("endpoint", &self.endpoint)
            .field("header", &self.header.as_ref().map(|_| "[REDACTED]"))
            .field("imds_endpoint", &self.imds_endpoint)
            .finish()
    }
}

/// One datastore connection.
#[derive(Clone)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout_ms: 5_000,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

// Connection strings carry credentials.
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .finish()
    }
}

/// Orphan sweep schedule.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Rows younger than this are never treated as orphans.
    pub grace_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            grace_secs: 600,
        }
    }
}

/// Everything needed to bring the vault up.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub kms: KmsConfig,
    pub pii_store: StoreConfig,
    pub key_store: StoreConfig,
    pub retry: RetryConfig,
    pub reconcile: ReconcileConfig,
}

impl VaultConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).ok_or_else(|| VaultError::Config(format!("{} is not set", key)))
        };

        let mut kms = KmsConfig::new(
            require("AZURE_VAULT_URL")?,
            get("KMS_KEY_NAME").unwrap_or_else(|| DEFAULT_KEY_NAME.to_string()),
        );
        kms.key_version = get("KMS_KEY_VERSION");
        if let Some(api_version) = get("KMS_API_VERSION") {
            kms.api_version = api_version;
        }
        kms.identity = IdentityConfig {
            endpoint: get("IDENTITY_ENDPOINT"),
            header: get("IDENTITY_HEADER"),
            imds_endpoint: get("IMDS_ENDPOINT"),
        };

        let mut pii_store = StoreConfig::new(require("PII_DATABASE_URL")?);
        let mut key_store = StoreConfig::new(require("KEY_DATABASE_URL")?);
        if let Some(n) = parse(&get, "PII_DB_MAX_CONNECTIONS")? {
            pii_store.max_connections = n;
        }
        if let Some(n) = parse(&get, "KEY_DB_MAX_CONNECTIONS")? {
            key_store.max_connections = n;
        }

        let mut retry = RetryConfig::default();
        if let Some(n) = parse(&get, "KMS_RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = n;
        }
        if let Some(n) = parse(&get, "KMS_RETRY_BASE_DELAY_MS")? {
            retry.base_delay_ms = n;
        }
        if let Some(n) = parse(&get, "KMS_RETRY_MAX_DELAY_MS")? {
            retry.max_delay_ms = n;
        }

        let mut reconcile = ReconcileConfig::default();
        if let Some(n) = parse(&get, "RECONCILE_INTERVAL_SECS")? {
            reconcile.interval_secs = n;
        }
        if let Some(n) = parse(&get, "RECONCILE_GRACE_SECS")? {
            reconcile.grace_secs = n;
        }

        let config = Self {
            kms,
            pii_store,
            key_store,
            retry,
            reconcile,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.kms.validate()?;
        if self.pii_store.url == self.key_store.url {
            return Err(VaultError::Config(
                "PII_DATABASE_URL and KEY_DATABASE_URL must point at different datastores".into(),
            ));
        }
        if self.kms.identity.endpoint.is_some() && self.kms.identity.header.is_none() {
            return Err(VaultError::Config(
                "IDENTITY_ENDPOINT is set but IDENTITY_HEADER is missing".into(),
            ));
        }
        for (name, store) in [("pii", &self.pii_store), ("key", &self.key_store)] {
            if store.max_connections == 0 {
                return Err(VaultError::Config(format!(
                    "{} store max_connections must be at least 1",
                    name
                )));
            }
        }
        if self.reconcile.interval_secs == 0 {
            return Err(VaultError::Config(
                "RECONCILE_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| VaultError::Config(format!("{} is not a valid number: {}", key, raw))),
        None => Ok(None),
    }
}
