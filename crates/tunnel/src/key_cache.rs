//! Space public-key resolution and caching.
//!
//! # Architecture
//!
//! ```text
//! send(username) → check cache
//!                → miss? resolve via EncryptionKeyResolver (backend HTTP)
//!                → None? ENCRYPTION_KEY_MISSING (never cached)
//!                → cache key for `key_cache_ttl`
//! reply tag mismatch → invalidate(username) → next send refetches
//! ```
//!
//! Two concurrent misses for the same username may both fetch; the later
//! insert overwrites the earlier one with identical content.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fail::fail_point;
use moka::future::Cache;
use serde::Deserialize;

use crate::{
    crypto::SpacePublicKey,
    error::{Result, TunnelError},
};

/// Path under the backend URL serving Space encryption keys.
pub const ENCRYPTION_KEY_PATH: [&str; 4] = ["api", "v1", "nats", "encryption-key"];

/// Default HTTP timeout for key lookups.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Looks up a Space's long-term public key.
#[async_trait]
pub trait EncryptionKeyResolver: Send + Sync {
    /// Returns `Ok(None)` when the Space has no registered key.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::EncryptionKeyFetchFailed`] for transport
    /// failures, unexpected statuses, or malformed keys.
    async fn resolve(&self, username: &str) -> Result<Option<SpacePublicKey>>;
}

#[derive(Deserialize)]
struct EncryptionKeyResponse {
    #[serde(default)]
    encryption_public_key: Option<String>,
}

/// Resolves keys with `GET {backend}/api/v1/nats/encryption-key/{username}`.
#[derive(Debug, Clone)]
pub struct HttpKeyResolver {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpKeyResolver {
    /// Creates a resolver against `backend_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the URL cannot serve as a base or
    /// the HTTP client cannot be built.
    pub fn new(backend_url: &str) -> Result<Self> {
        Self::with_timeout(backend_url, DEFAULT_FETCH_TIMEOUT)
    }

    /// Creates a resolver with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// See [`HttpKeyResolver::new`].
    pub fn with_timeout(backend_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = reqwest::Url::parse(backend_url)
            .map_err(|e| TunnelError::config(format!("backend_url '{backend_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            let reason = format!("backend_url '{backend_url}' cannot be a base");
            return Err(TunnelError::config(reason));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// URL queried for `username`; each segment is percent-encoded.
    #[must_use]
    pub fn key_url(&self, username: &str) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(ENCRYPTION_KEY_PATH).push(username);
        }
        url
    }
}

#[async_trait]
impl EncryptionKeyResolver for HttpKeyResolver {
    #[tracing::instrument(skip(self))]
    async fn resolve(&self, username: &str) -> Result<Option<SpacePublicKey>> {
        let response = self
            .client
            .get(self.key_url(username))
            .send()
            .await
            .map_err(|e| TunnelError::key_fetch_failed(username, e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let reason = format!("backend returned {status}");
            return Err(TunnelError::key_fetch_failed(username, reason));
        }

        let body: EncryptionKeyResponse = response.json().await.map_err(|e| {
            TunnelError::key_fetch_failed(username, format!("invalid response body: {e}"))
        })?;

        match body.encryption_public_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(encoded) => SpacePublicKey::from_base64(encoded)
                .map(Some)
                .map_err(|e| TunnelError::key_fetch_failed(username, e.to_string())),
        }
    }
}

/// TTL cache of Space public keys in front of an [`EncryptionKeyResolver`].
pub struct SpaceKeyCache {
    cache: Cache<String, SpacePublicKey>,
    resolver: Arc<dyn EncryptionKeyResolver>,
    invalidation_gen: AtomicU64,
}

impl SpaceKeyCache {
    /// Creates a cache with the given TTL and capacity.
    #[must_use]
    pub fn new(resolver: Arc<dyn EncryptionKeyResolver>, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).max_capacity(max_capacity).build(),
            resolver,
            invalidation_gen: AtomicU64::new(0),
        }
    }

    /// Returns the Space's public key, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::EncryptionKeyMissing`] if the Space has no key
    /// - [`TunnelError::EncryptionKeyFetchFailed`] if the lookup failed
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, username: &str) -> Result<SpacePublicKey> {
        if let Some(key) = self.cache.get(username).await {
            tracing::debug!("space key cache hit");
            return Ok(key);
        }
        tracing::debug!("space key cache miss");

        // An invalidation racing with the fetch means the fetched key may
        // already be stale; hand it out once but do not cache it.
        let gen_before = self.invalidation_gen.load(Ordering::Acquire);

        fail_point!("key-cache-before-fetch", |_| {
            Err(TunnelError::key_fetch_failed(username, "injected failure before key fetch"))
        });
        let key = self
            .resolver
            .resolve(username)
            .await?
            .ok_or_else(|| TunnelError::key_missing(username))?;

        if self.invalidation_gen.load(Ordering::Acquire) != gen_before {
            tracing::debug!("discarding fetched space key: invalidated during fetch");
            return Ok(key);
        }

        self.cache.insert(username.to_owned(), key).await;
        Ok(key)
    }

    /// Evicts the cached key for `username`.
    pub async fn invalidate(&self, username: &str) {
        self.invalidation_gen.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(username).await;
        tracing::debug!(username, "space key evicted");
    }

    /// Returns `true` if a fresh key for `username` is cached.
    pub async fn contains(&self, username: &str) -> bool {
        self.cache.get(username).await.is_some()
    }

    /// Evicts every cached key.
    pub fn clear(&self) {
        self.invalidation_gen.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for SpaceKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceKeyCache")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}
