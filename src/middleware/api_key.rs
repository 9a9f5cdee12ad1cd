//! # API Key Authentication Middleware
//!
//! Resolves a caller-supplied API key to its account record and meters
//! usage. This stage is advisory: it attaches identity when a valid key
//! is presented but never blocks a request, neither for a missing or
//! unknown key nor for a key-store fault. Enforcement belongs to
//! downstream handlers that require an authenticated context.
//!
//! Keys are hashed with SHA-256 before lookup; plaintext keys are never
//! compared or stored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::ApiKeyConfig;
use crate::core::error::{SentinelError, SentinelResult};
use crate::core::types::{AuthContext, IncomingRequest, RequestContext};
use crate::middleware::pipeline::GateStage;

/// Hash a raw API key for storage or lookup.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lifecycle state of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Revoked,
}

/// One issued API key, as the store knows it.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    /// SHA-256 hex digest of the raw key
    pub key_hash: String,
    pub application_id: String,
    pub status: KeyStatus,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The application a key belongs to.
#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    pub id: String,
    pub name: String,
    /// Origins this application may send browser requests from
    pub allowed_origins: Vec<String>,
}

/// Persistent key store abstraction.
///
/// `record_usage` must increment atomically inside the store; the stage
/// never reads, modifies, and writes the counter itself, so concurrent
/// hits on one key are never lost.
#[async_trait]
pub trait KeyStore: Send + Sync + fmt::Debug {
    /// Find an active key by its hash, joined to its application.
    /// Returns `Ok(None)` for unknown or revoked keys.
    async fn find_active(
        &self,
        key_hash: &str,
    ) -> SentinelResult<Option<(ApiKeyRecord, ApplicationRecord)>>;

    /// Count one use of the key and bump its last-used time. Returns
    /// the usage count including this use.
    async fn record_usage(&self, key_id: &str, now: DateTime<Utc>) -> SentinelResult<u64>;
}

struct StoredKey {
    id: String,
    application_id: String,
    status: KeyStatus,
    usage: AtomicU64,
    last_used: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKey")
            .field("id", &self.id)
            .field("application_id", &self.application_id)
            .field("status", &self.status)
            .field("usage", &self.usage.load(Ordering::Relaxed))
            .finish()
    }
}

/// In-process key store for embedding and tests.
///
/// Usage counters are atomics, so `record_usage` is lock-free and
/// concurrent authenticated requests each count.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    /// Keyed by key hash
    keys: DashMap<String, Arc<StoredKey>>,
    /// Secondary index: key id to key hash, for usage recording
    ids: DashMap<String, String>,
    applications: DashMap<String, ApplicationRecord>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application so keys can join to it.
    pub fn insert_application(&self, application: ApplicationRecord) {
        self.applications.insert(application.id.clone(), application);
    }

    /// Issue a key for an application from its raw value. The raw key
    /// is hashed immediately and discarded.
    pub fn insert_key(&self, id: &str, raw_key: &str, application_id: &str, status: KeyStatus) {
        let key_hash = hash_key(raw_key);
        self.ids.insert(id.to_string(), key_hash.clone());
        self.keys.insert(
            key_hash,
            Arc::new(StoredKey {
                id: id.to_string(),
                application_id: application_id.to_string(),
                status,
                usage: AtomicU64::new(0),
                last_used: parking_lot::Mutex::new(None),
            }),
        );
    }

    /// Current usage count of a key, for assertions and diagnostics.
    pub fn usage_count(&self, key_id: &str) -> Option<u64> {
        let hash = self.ids.get(key_id)?;
        self.keys
            .get(hash.value())
            .map(|key| key.usage.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn find_active(
        &self,
        key_hash: &str,
    ) -> SentinelResult<Option<(ApiKeyRecord, ApplicationRecord)>> {
        let Some(stored) = self.keys.get(key_hash) else {
            return Ok(None);
        };
        if stored.status != KeyStatus::Active {
            return Ok(None);
        }

        let application = self
            .applications
            .get(&stored.application_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SentinelError::key_lookup(format!(
                    "key '{}' references missing application '{}'",
                    stored.id, stored.application_id
                ))
            })?;

        let record = ApiKeyRecord {
            id: stored.id.clone(),
            key_hash: key_hash.to_string(),
            application_id: stored.application_id.clone(),
            status: stored.status,
            usage_count: stored.usage.load(Ordering::Relaxed),
            last_used_at: *stored.last_used.lock(),
        };
        Ok(Some((record, application)))
    }

    async fn record_usage(&self, key_id: &str, now: DateTime<Utc>) -> SentinelResult<u64> {
        let hash = self
            .ids
            .get(key_id)
            .ok_or_else(|| SentinelError::key_lookup(format!("unknown key id '{}'", key_id)))?;
        let stored = self
            .keys
            .get(hash.value())
            .ok_or_else(|| SentinelError::key_lookup(format!("unknown key id '{}'", key_id)))?;

        let count = stored.usage.fetch_add(1, Ordering::Relaxed) + 1;
        *stored.last_used.lock() = Some(now);
        Ok(count)
    }
}

/// Pipeline stage resolving the caller's API key.
#[derive(Debug)]
pub struct ApiKeyStage {
    config: ApiKeyConfig,
    store: Arc<dyn KeyStore>,
}

impl ApiKeyStage {
    pub fn new(config: ApiKeyConfig, store: Arc<dyn KeyStore>) -> Self {
        Self { config, store }
    }

    /// Pull the raw key from the configured header, falling back to the
    /// configured query parameters in order.
    fn extract_key(&self, request: &IncomingRequest) -> Option<String> {
        if let Some(value) = request.header(&self.config.header_name) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }

        let query = request.query()?;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if self.config.query_params.iter().any(|param| param == &name) && !value.is_empty() {
                return Some(value.into_owned());
            }
        }
        None
    }
}

#[async_trait]
impl GateStage for ApiKeyStage {
    fn name(&self) -> &'static str {
        "api_key"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> SentinelResult<()> {
        let Some(raw_key) = self.extract_key(&ctx.request) else {
            // Anonymous requests pass untouched
            return Ok(());
        };

        let key_hash = hash_key(&raw_key);
        match self.store.find_active(&key_hash).await {
            Ok(Some((record, application))) => {
                let usage_count = match self.store.record_usage(&record.id, Utc::now()).await {
                    Ok(count) => count,
                    Err(err) => {
                        warn!(
                            request_id = %ctx.request.id,
                            key_id = %record.id,
                            error = %err,
                            "Usage metering failed, identity kept"
                        );
                        record.usage_count + 1
                    }
                };

                debug!(
                    request_id = %ctx.request.id,
                    application = %application.name,
                    "API key resolved"
                );
                counter!("sentinel_api_key_hits_total").increment(1);

                ctx.set_auth(AuthContext {
                    key_id: record.id,
                    application_id: application.id,
                    application_name: application.name,
                    allowed_origins: application.allowed_origins,
                    usage_count,
                });
                Ok(())
            }
            Ok(None) => {
                warn!(
                    request_id = %ctx.request.id,
                    path = %ctx.request.path(),
                    "Unknown or inactive API key, continuing unauthenticated"
                );
                counter!("sentinel_api_key_misses_total").increment(1);
                Ok(())
            }
            Err(err) => {
                // Fail-open: a store fault must not take requests down
                warn!(
                    request_id = %ctx.request.id,
                    error = %err,
                    "Key store lookup failed, continuing unauthenticated"
                );
                counter!("sentinel_api_key_faults_total").increment(1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};

    fn store_with_key(status: KeyStatus) -> InMemoryKeyStore {
        let store = InMemoryKeyStore::new();
        store.insert_application(ApplicationRecord {
            id: "app-1".to_string(),
            name: "Conversion Portal".to_string(),
            allowed_origins: vec!["https://portal.example.org".to_string()],
        });
        store.insert_key("key-1", "secret-key-value", "app-1", status);
        store
    }

    fn ctx_for(headers: HeaderMap, path_and_query: &str) -> RequestContext {
        let request = IncomingRequest::new(
            Method::GET,
            path_and_query.parse().unwrap(),
            headers,
            Vec::new(),
            "198.51.100.4:5000".parse().unwrap(),
        );
        RequestContext::new(Arc::new(request))
    }

    #[tokio::test]
    async fn test_valid_header_key_attaches_identity() {
        let stage = ApiKeyStage::new(
            ApiKeyConfig::default(),
            Arc::new(store_with_key(KeyStatus::Active)),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret-key-value".parse().unwrap());
        let mut ctx = ctx_for(headers, "/api/convert");

        stage.on_request(&mut ctx).await.unwrap();
        let auth = ctx.auth.as_ref().expect("identity missing");
        assert_eq!(auth.application_name, "Conversion Portal");
        assert_eq!(auth.usage_count, 1);
    }

    #[tokio::test]
    async fn test_query_parameter_fallback() {
        let stage = ApiKeyStage::new(
            ApiKeyConfig::default(),
            Arc::new(store_with_key(KeyStatus::Active)),
        );
        let mut ctx = ctx_for(HeaderMap::new(), "/api/convert?apiKey=secret-key-value");

        stage.on_request(&mut ctx).await.unwrap();
        assert!(ctx.is_authenticated());

        let mut ctx = ctx_for(HeaderMap::new(), "/api/convert?api_key=secret-key-value");
        stage.on_request(&mut ctx).await.unwrap();
        assert!(ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_missing_key_passes_anonymous() {
        let stage = ApiKeyStage::new(
            ApiKeyConfig::default(),
            Arc::new(store_with_key(KeyStatus::Active)),
        );
        let mut ctx = ctx_for(HeaderMap::new(), "/api/convert");

        stage.on_request(&mut ctx).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_unknown_key_passes_anonymous() {
        let stage = ApiKeyStage::new(
            ApiKeyConfig::default(),
            Arc::new(store_with_key(KeyStatus::Active)),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong-key".parse().unwrap());
        let mut ctx = ctx_for(headers, "/api/convert");

        stage.on_request(&mut ctx).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_revoked_key_passes_anonymous() {
        let stage = ApiKeyStage::new(
            ApiKeyConfig::default(),
            Arc::new(store_with_key(KeyStatus::Revoked)),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret-key-value".parse().unwrap());
        let mut ctx = ctx_for(headers, "/api/convert");

        stage.on_request(&mut ctx).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_store_fault_is_fail_open() {
        #[derive(Debug)]
        struct BrokenStore;

        #[async_trait]
        impl KeyStore for BrokenStore {
            async fn find_active(
                &self,
                _key_hash: &str,
            ) -> SentinelResult<Option<(ApiKeyRecord, ApplicationRecord)>> {
                Err(SentinelError::key_lookup("store offline"))
            }

            async fn record_usage(&self, _key_id: &str, _now: DateTime<Utc>) -> SentinelResult<u64> {
                Err(SentinelError::key_lookup("store offline"))
            }
        }

        let stage = ApiKeyStage::new(ApiKeyConfig::default(), Arc::new(BrokenStore));
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret-key-value".parse().unwrap());
        let mut ctx = ctx_for(headers, "/api/convert");

        // The fault is swallowed, never surfaced as a rejection
        stage.on_request(&mut ctx).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_concurrent_usage_metering_loses_nothing() {
        let store = Arc::new(store_with_key(KeyStatus::Active));
        let stage = Arc::new(ApiKeyStage::new(ApiKeyConfig::default(), store.clone()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let stage = Arc::clone(&stage);
            handles.push(tokio::spawn(async move {
                let mut headers = HeaderMap::new();
                headers.insert("x-api-key", "secret-key-value".parse().unwrap());
                let mut ctx = ctx_for(headers, "/api/convert");
                stage.on_request(&mut ctx).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.usage_count("key-1"), Some(32));
    }

    #[test]
    fn test_hash_key_is_one_way_and_stable() {
        let first = hash_key("secret-key-value");
        let second = hash_key("secret-key-value");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, hash_key("other-key"));
        assert!(!first.contains("secret"));
    }
}
