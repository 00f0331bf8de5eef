//! Tunnel transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::TunnelError;

/// Default NATS server URL.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Default time to wait for a Space's reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default freshness of a cached Space public key.
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default maximum number of cached Space public keys.
pub const DEFAULT_KEY_CACHE_CAPACITY: u64 = 10_000;

/// Configuration for [`TunnelTransport`](crate::TunnelTransport).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use syfthub_tunnel::TunnelConfig;
///
/// let config = TunnelConfig::builder()
///     .backend_url("http://backend:8000")
///     .nats_auth_token("s3cret")
///     .default_timeout(Duration::from_secs(10))
///     .build()?;
/// assert_eq!(config.key_cache_ttl(), Duration::from_secs(300));
/// # Ok::<(), syfthub_tunnel::TunnelError>(())
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub(crate) nats_url: String,

    /// NATS auth token, if the server requires one.
    #[serde(default)]
    pub(crate) nats_auth_token: Option<Zeroizing<String>>,

    /// Base URL of the backend serving Space encryption keys.
    pub(crate) backend_url: String,

    /// Reply timeout used when a call does not specify its own.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) default_timeout: Duration,

    /// How long a fetched Space public key stays fresh.
    #[serde(with = "humantime_serde", default = "default_key_cache_ttl")]
    pub(crate) key_cache_ttl: Duration,

    /// Maximum number of cached Space public keys.
    #[serde(default = "default_key_cache_capacity")]
    pub(crate) key_cache_capacity: u64,
}

fn default_nats_url() -> String {
    DEFAULT_NATS_URL.to_owned()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_key_cache_ttl() -> Duration {
    DEFAULT_KEY_CACHE_TTL
}

fn default_key_cache_capacity() -> u64 {
    DEFAULT_KEY_CACHE_CAPACITY
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("nats_url", &self.nats_url)
            .field("nats_auth_token", &self.nats_auth_token.as_ref().map(|_| "<redacted>"))
            .field("backend_url", &self.backend_url)
            .field("default_timeout", &self.default_timeout)
            .field("key_cache_ttl", &self.key_cache_ttl)
            .field("key_cache_capacity", &self.key_cache_capacity)
            .finish()
    }
}

#[bon::bon]
impl TunnelConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if:
    /// - `nats_url` is empty
    /// - `backend_url` is not an absolute http(s) URL
    /// - `default_timeout` or `key_cache_ttl` is zero
    /// - `key_cache_capacity` is zero
    #[builder]
    pub fn new(
        #[builder(into, default = default_nats_url())] nats_url: String,
        #[builder(into)] nats_auth_token: Option<String>,
        #[builder(into)] backend_url: String,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] default_timeout: Duration,
        #[builder(default = DEFAULT_KEY_CACHE_TTL)] key_cache_ttl: Duration,
        #[builder(default = DEFAULT_KEY_CACHE_CAPACITY)] key_cache_capacity: u64,
    ) -> Result<Self, TunnelError> {
        let config = Self {
            nats_url,
            nats_auth_token: nats_auth_token.map(Zeroizing::new),
            backend_url,
            default_timeout,
            key_cache_ttl,
            key_cache_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants; deserialized configurations should call this.
    ///
    /// # Errors
    ///
    /// See [`TunnelConfig::new`].
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.nats_url.trim().is_empty() {
            return Err(TunnelError::config("nats_url cannot be empty"));
        }
        let backend = reqwest::Url::parse(&self.backend_url).map_err(|e| {
            TunnelError::config(format!("backend_url '{}' is invalid: {e}", self.backend_url))
        })?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(TunnelError::config(format!(
                "backend_url must be http or https, got '{}'",
                backend.scheme()
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(TunnelError::config("default_timeout must be greater than zero"));
        }
        if self.key_cache_ttl.is_zero() {
            return Err(TunnelError::config("key_cache_ttl must be greater than zero"));
        }
        if self.key_cache_capacity == 0 {
            return Err(TunnelError::config("key_cache_capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the NATS server URL.
    #[must_use]
    pub fn nats_url(&self) -> &str {
        &self.nats_url
    }

    /// Returns the NATS auth token, if configured.
    #[must_use]
    pub fn nats_auth_token(&self) -> Option<&str> {
        self.nats_auth_token.as_deref().map(String::as_str)
    }

    /// Returns the backend base URL.
    #[must_use]
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Returns the default reply timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns the Space public key cache TTL.
    #[must_use]
    pub fn key_cache_ttl(&self) -> Duration {
        self.key_cache_ttl
    }

    /// Returns the Space public key cache capacity.
    #[must_use]
    pub fn key_cache_capacity(&self) -> u64 {
        self.key_cache_capacity
    }
}
