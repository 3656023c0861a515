//! Azure Key Vault key wrapping over REST.
//!
//! The KEK is an RSA key inside the vault. Wrap and unwrap are delegated to
//! the vault's `wrapkey` / `unwrapkey` operations with RSA-OAEP; the service
//! authenticates with a managed identity token and never holds a static
//! secret.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::config::{IdentityConfig, KmsConfig};
use crate::crypto::SecureKey;
use crate::error::{Result, VaultError};
use crate::kms::{KeyReference, KeyWrapper, WrappedDek};

/// Algorithm requested for every wrap/unwrap.
pub const WRAP_ALGORITHM: &str = "RSA-OAEP";

const VAULT_RESOURCE: &str = "https://vault.azure.net";
const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
enum TokenSource {
    AppService { endpoint: String, header: String },
    Imds { endpoint: String },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Managed identity bearer tokens for the Key Vault resource.
pub struct ManagedIdentityCredential {
    http: Client,
    source: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl ManagedIdentityCredential {
    pub fn new(http: Client, identity: &IdentityConfig) -> Self {
        let source = match (&identity.endpoint, &identity.header) {
            (Some(endpoint), Some(header)) => TokenSource::AppService {
                endpoint: endpoint.clone(),
                header: header.clone(),
            },
            _ => TokenSource::Imds {
                endpoint: identity
                    .imds_endpoint
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMDS_ENDPOINT.to_string()),
            },
        };
        Self {
            http,
            source,
            cached: Mutex::new(None),
        }
    }

    /// Return a cached token or fetch a new one.
    pub async fn token(&self) -> Result<String> {
        let refresh_after = Utc::now() + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        let fresh = self
            .cached
            .lock()
            .as_ref()
            .filter(|c| c.expires_at > refresh_after)
            .map(|c| c.value.clone());
        if let Some(token) = fresh {
            return Ok(token);
        }

        let request = match &self.source {
            TokenSource::AppService { endpoint, header } => self
                .http
                .get(endpoint)
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", VAULT_RESOURCE)])
                .header("X-IDENTITY-HEADER", header),
            TokenSource::Imds { endpoint } => self
                .http
                .get(endpoint)
                .query(&[("api-version", IMDS_API_VERSION), ("resource", VAULT_RESOURCE)])
                .header("Metadata", "true"),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| VaultError::KmsUnavailable(format!("identity endpoint unreachable: {}", e)))?;
        if !resp.status().is_success() {
            return Err(VaultError::KmsUnavailable(format!(
                "identity endpoint returned {}",
                resp.status().as_u16()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::KmsUnavailable(format!("malformed identity token response: {}", e)))?;

        let expires_at = token_expiry(&body);
        debug!(%expires_at, "managed identity token acquired");

        let value = body.access_token;
        *self.cached.lock() = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    /// Drop the cached token so the next call fetches a new one.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn token_expiry(body: &TokenResponse) -> DateTime<Utc> {
    if let Some(ts) = body.expires_on.as_ref().and_then(json_i64) {
        if let Some(at) = Utc.timestamp_opt(ts, 0).single() {
            return at;
        }
    }
    let secs = body.expires_in.as_ref().and_then(json_i64).unwrap_or(0);
    Utc::now() + chrono::Duration::seconds(secs)
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
    kty: String,
}

#[derive(Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    value: String,
}

#[derive(Debug, Clone, Copy)]
enum KeyOperation {
    Wrap,
    Unwrap,
}

impl KeyOperation {
    fn path(&self) -> &'static str {
        match self {
            KeyOperation::Wrap => "wrapkey",
            KeyOperation::Unwrap => "unwrapkey",
        }
    }

    fn failure(&self, detail: String) -> VaultError {
        match self {
            KeyOperation::Wrap => VaultError::WrapFailure(detail),
            KeyOperation::Unwrap => VaultError::UnwrapFailure(detail),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Key Vault client bound to one named RSA key.
pub struct AzureKeyVaultClient {
    http: Client,
    vault_url: String,
    api_version: String,
    credential: ManagedIdentityCredential,
    key_ref: KeyReference,
}

impl AzureKeyVaultClient {
    /// Validate configuration, authenticate and resolve the KEK.
    ///
    /// Fails with `Config` on missing settings and `KeyNotFound` when the
    /// named key does not exist; either must stop startup.
    pub async fn connect(cfg: &KmsConfig) -> Result<Self> {
        cfg.validate()?;

        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()
            .map_err(|e| VaultError::Config(format!("failed to build http client: {}", e)))?;
        let credential = ManagedIdentityCredential::new(http.clone(), &cfg.identity);

        let mut client = Self {
            http,
            vault_url: cfg.vault_url.trim().trim_end_matches('/').to_string(),
            api_version: cfg.api_version.clone(),
            credential,
            key_ref: KeyReference::new(cfg.key_name.trim(), cfg.key_version.clone().unwrap_or_default()),
        };
        client.key_ref = client
            .resolve_key(cfg.key_name.trim(), cfg.key_version.as_deref())
            .await?;

        info!(key = %client.key_ref, vault = %client.vault_url, "KMS key resolved");
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.vault_url, path.trim_start_matches('/'))
    }

    async fn authorized(&self, req: RequestBuilder) -> Result<Response> {
        let token = self.credential.token().await?;
        let resp = req
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| VaultError::KmsUnavailable(format!("key vault unreachable: {}", e)))?;

        // A rejected token may be revoked before its expiry; the retry must not reuse it.
        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("key vault rejected the cached token");
            self.credential.invalidate();
        }
        Ok(resp)
    }

    async fn resolve_key(&self, name: &str, version: Option<&str>) -> Result<KeyReference> {
        let path = match version {
            Some(v) => format!("keys/{}/{}", name, v),
            None => format!("keys/{}", name),
        };
        let resp = self.authorized(self.http.get(self.url(&path))).await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VaultError::KeyNotFound(name.to_string()));
        }
        if is_transient_status(status) {
            return Err(VaultError::KmsUnavailable(format!(
                "key lookup returned {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(VaultError::Config(format!(
                "key lookup for {} returned {}",
                name,
                status.as_u16()
            )));
        }

        let bundle: KeyBundle = resp
            .json()
            .await
            .map_err(|e| VaultError::Config(format!("malformed key bundle: {}", e)))?;
        if !bundle.key.kty.starts_with("RSA") {
            return Err(VaultError::Config(format!(
                "key {} has type {}, RSA is required for {}",
                name, bundle.key.kty, WRAP_ALGORITHM
            )));
        }

        let resolved = bundle
            .key
            .kid
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|v| !v.is_empty() && *v != name)
            .ok_or_else(|| VaultError::Config(format!("key id {} has no version", bundle.key.kid)))?;

        Ok(KeyReference::new(name, resolved))
    }

    async fn key_operation(
        &self,
        key_ref: &KeyReference,
        op: KeyOperation,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let path = format!("keys/{}/{}/{}", key_ref.name, key_ref.version, op.path());
        let mut encoded = URL_SAFE_NO_PAD.encode(input);
        let request = self.http.post(self.url(&path)).json(&KeyOperationRequest {
            alg: WRAP_ALGORITHM,
            value: &encoded,
        });
        encoded.zeroize();

        let resp = self.authorized(request).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VaultError::KeyNotFound(key_ref.to_string()));
        }
        if is_transient_status(status) {
            return Err(VaultError::KmsUnavailable(format!(
                "{} returned {}",
                op.path(),
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(op.failure(format!("{} returned {}", op.path(), status.as_u16())));
        }

        let mut body: KeyOperationResult = resp
            .json()
            .await
            .map_err(|e| op.failure(format!("malformed {} response: {}", op.path(), e)))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(body.value.trim_end_matches('='))
            .map_err(|_| op.failure(format!("{} response is not base64url", op.path())));
        body.value.zeroize();
        decoded
    }
}

#[async_trait]
impl KeyWrapper for AzureKeyVaultClient {
    fn key_ref(&self) -> &KeyReference {
        &self.key_ref
    }

    async fn wrap(&self, dek: &SecureKey) -> Result<WrappedDek> {
        let wrapped_key = self
            .key_operation(&self.key_ref, KeyOperation::Wrap, dek.as_bytes())
            .await?;
        if wrapped_key.is_empty() {
            return Err(VaultError::WrapFailure("empty wrapped key".into()));
        }
        Ok(WrappedDek {
            wrapped_key,
            key_ref: self.key_ref.clone(),
        })
    }

    async fn unwrap(&self, wrapped: &WrappedDek) -> Result<SecureKey> {
        let mut dek_bytes = self
            .key_operation(&wrapped.key_ref, KeyOperation::Unwrap, &wrapped.wrapped_key)
            .await?;
        let dek = SecureKey::from_slice(&dek_bytes)
            .map_err(|_| VaultError::UnwrapFailure("unwrapped key has wrong length".into()));
        dek_bytes.zeroize();
        dek
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_imds(server: &MockServer, expected_calls: u64) {
        let expires_on = (Utc::now() + chrono::Duration::hours(1)).timestamp().to_string();
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("Metadata", "true"))
            .and(query_param("resource", VAULT_RESOURCE))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "test-token",
                "expires_on": expires_on,
                "token_type": "Bearer",
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mount_key(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/keys/master-kek"))
            .and(query_param("api-version", "7.4"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": {
                    "kid": format!("{}/keys/master-kek/0f3a9c", server.uri()),
                    "kty": "RSA-HSM",
                    "key_ops": ["wrapKey", "unwrapKey"],
                }
            })))
            .mount(server)
            .await;
    }

    fn config(server: &MockServer) -> KmsConfig {
        let mut cfg = KmsConfig::new(server.uri(), "master-kek");
        cfg.identity.imds_endpoint = Some(format!("{}/metadata/identity/oauth2/token", server.uri()));
        cfg
    }

    #[tokio::test]
    async fn test_connect_resolves_key_version() {
        let server = MockServer::start().await;
        mount_imds(&server, 1).await;
        mount_key(&server).await;

        let client = AzureKeyVaultClient::connect(&config(&server)).await.unwrap();
        assert_eq!(client.key_ref(), &KeyReference::new("master-kek", "0f3a9c"));
    }

    #[tokio::test]
    async fn test_connect_missing_key_is_fatal() {
        let server = MockServer::start().await;
        mount_imds(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/keys/master-kek"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = AzureKeyVaultClient::connect(&config(&server)).await;
        assert!(matches!(result, Err(VaultError::KeyNotFound(ref name)) if name == "master-kek"));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_config() {
        let cfg = KmsConfig::new("", "master-kek");
        assert!(matches!(
            AzureKeyVaultClient::connect(&cfg).await,
            Err(VaultError::Config(_))
        ));

        let cfg = KmsConfig::new("https://pii.vault.azure.net", " ");
        assert!(matches!(
            AzureKeyVaultClient::connect(&cfg).await,
            Err(VaultError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_wrap_and_unwrap_use_rsa_oaep() {
        let server = MockServer::start().await;
        mount_imds(&server, 1).await;
        mount_key(&server).await;

        let dek = SecureKey::from_slice(&[0x11; 32]).unwrap();
        let dek_b64 = URL_SAFE_NO_PAD.encode(dek.as_bytes());
        let wrapped_bytes = vec![0xA5; 256];
        let wrapped_b64 = URL_SAFE_NO_PAD.encode(&wrapped_bytes);

        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/wrapkey"))
            .and(body_partial_json(json!({ "alg": "RSA-OAEP", "value": dek_b64 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kid": "master-kek/0f3a9c",
                "value": wrapped_b64,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/unwrapkey"))
            .and(body_partial_json(json!({ "alg": "RSA-OAEP", "value": wrapped_b64 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kid": "master-kek/0f3a9c",
                "value": dek_b64,
            })))
            .expect(1)
            .mount(&server)
            .await;

        // One token fetch serves connect, wrap and unwrap.
        let client = AzureKeyVaultClient::connect(&config(&server)).await.unwrap();
        let wrapped = client.wrap(&dek).await.unwrap();
        assert_eq!(wrapped.wrapped_key, wrapped_bytes);
        assert_eq!(wrapped.key_ref.version, "0f3a9c");

        let unwrapped = client.unwrap(&wrapped).await.unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        mount_imds(&server, 1).await;
        mount_key(&server).await;
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/wrapkey"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/unwrapkey"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": "BadParameter" }
            })))
            .mount(&server)
            .await;

        let client = AzureKeyVaultClient::connect(&config(&server)).await.unwrap();
        let wrap = client.wrap(&SecureKey::generate()).await;
        assert!(matches!(wrap, Err(VaultError::KmsUnavailable(_))));

        let wrapped = WrappedDek {
            wrapped_key: vec![1; 256],
            key_ref: client.key_ref().clone(),
        };
        let unwrap = client.unwrap(&wrapped).await;
        assert!(matches!(unwrap, Err(VaultError::UnwrapFailure(_))));
    }

    async fn mount_token(server: &MockServer, token: &str, uses: u64, priority: u8) {
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_on": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
            })))
            .up_to_n_times(uses)
            .with_priority(priority)
            .expect(uses)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_refetched_on_retry() {
        let server = MockServer::start().await;
        mount_token(&server, "tok0", 1, 1).await;
        mount_token(&server, "tok1", 1, 5).await;
        Mock::given(method("GET"))
            .and(path("/keys/master-kek"))
            .and(header("Authorization", "Bearer tok0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": {
                    "kid": format!("{}/keys/master-kek/0f3a9c", server.uri()),
                    "kty": "RSA",
                }
            })))
            .mount(&server)
            .await;
        // tok0 is revoked after connect.
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/wrapkey"))
            .and(header("Authorization", "Bearer tok0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/wrapkey"))
            .and(header("Authorization", "Bearer tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": URL_SAFE_NO_PAD.encode([0xA5u8; 256]),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = AzureKeyVaultClient::connect(&config(&server)).await.unwrap();
        let retry = crate::retry::RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let dek = SecureKey::generate();
        let wrapped = crate::retry::with_backoff(&retry, "wrap", || client.wrap(&dek))
            .await
            .unwrap();
        assert_eq!(wrapped.wrapped_key, vec![0xA5; 256]);

        let received = server.received_requests().await.unwrap();
        let token_fetches = received
            .iter()
            .filter(|r| r.url.path() == "/metadata/identity/oauth2/token")
            .count();
        assert_eq!(token_fetches, 2);
    }

    #[tokio::test]
    async fn test_unwrap_rejects_wrong_length_key() {
        let server = MockServer::start().await;
        mount_imds(&server, 1).await;
        mount_key(&server).await;
        Mock::given(method("POST"))
            .and(path("/keys/master-kek/0f3a9c/unwrapkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": URL_SAFE_NO_PAD.encode([7u8; 16]),
            })))
            .mount(&server)
            .await;

        let client = AzureKeyVaultClient::connect(&config(&server)).await.unwrap();
        let wrapped = WrappedDek {
            wrapped_key: vec![1; 256],
            key_ref: client.key_ref().clone(),
        };
        assert!(matches!(
            client.unwrap(&wrapped).await,
            Err(VaultError::UnwrapFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_app_service_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/msi/token"))
            .and(header("X-IDENTITY-HEADER", "opaque-header"))
            .and(query_param("api-version", APP_SERVICE_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "test-token",
                "expires_on": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_key(&server).await;

        let mut cfg = KmsConfig::new(server.uri(), "master-kek");
        cfg.identity.endpoint = Some(format!("{}/msi/token", server.uri()));
        cfg.identity.header = Some("opaque-header".into());

        let client = AzureKeyVaultClient::connect(&cfg).await.unwrap();
        assert_eq!(client.key_ref().version, "0f3a9c");
    }

    #[tokio::test]
    async fn test_identity_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = AzureKeyVaultClient::connect(&config(&server)).await;
        assert!(matches!(result, Err(VaultError::KmsUnavailable(_))));
    }
}
