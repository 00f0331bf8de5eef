//! Configuration for the key store and token service.
//!
//! [`KeyStoreConfig`] decides where RSA key material comes from;
//! [`TokenConfig`] decides what the minted tokens look like and who may
//! receive them. Both deserialize with `deny_unknown_fields` and can be
//! constructed programmatically through validating builders.

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{error::AuthError, validation::normalize_audience};

/// Default directory for auto-generated key files.
pub const DEFAULT_KEYS_DIR: &str = ".keys";

/// Default bound on waiting for another process to finish key generation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default RSA modulus size in bits.
pub const DEFAULT_KEY_SIZE: usize = 2048;

/// Smallest RSA modulus accepted for signing keys.
pub const MIN_KEY_SIZE: usize = 2048;

/// Default satellite token lifetime in seconds.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 60;

/// Where the key store obtains its RSA key material.
///
/// Sources are tried in priority order: inline PEM, then PEM file paths,
/// then auto-generation into `keys_dir`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use syfthub_authn::KeyStoreConfig;
///
/// let config = KeyStoreConfig::builder()
///     .keys_dir("/var/lib/syfthub/keys")
///     .lock_timeout(Duration::from_secs(5))
///     .build()?;
/// assert!(config.auto_generate());
/// # Ok::<(), syfthub_authn::AuthError>(())
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyStoreConfig {
    /// Base64-encoded private key PEM (PKCS#8 or PKCS#1).
    #[serde(default)]
    pub(crate) private_key_pem: Option<Zeroizing<String>>,

    /// Base64-encoded public key PEM. Optional; derived from the private key when absent.
    #[serde(default)]
    pub(crate) public_key_pem: Option<String>,

    /// Path to a private key PEM file.
    #[serde(default)]
    pub(crate) private_key_path: Option<PathBuf>,

    /// Path to a public key PEM file.
    #[serde(default)]
    pub(crate) public_key_path: Option<PathBuf>,

    /// Key id for the signing key. Defaults to the RFC 7638 JWK thumbprint.
    #[serde(default)]
    pub(crate) key_id: Option<String>,

    /// Generate and persist a key pair when no configured source yields one.
    #[serde(default = "default_auto_generate")]
    pub(crate) auto_generate: bool,

    /// Directory holding auto-generated key files and the generation lock.
    #[serde(default = "default_keys_dir")]
    pub(crate) keys_dir: PathBuf,

    /// How long to wait for another process holding the generation lock.
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub(crate) lock_timeout: Duration,

    /// RSA modulus size in bits for generated keys.
    #[serde(default = "default_key_size")]
    pub(crate) key_size: usize,
}

fn default_auto_generate() -> bool {
    true
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from(DEFAULT_KEYS_DIR)
}

fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

fn default_key_size() -> usize {
    DEFAULT_KEY_SIZE
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreConfig")
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .field("public_key_pem", &self.public_key_pem.is_some())
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .field("key_id", &self.key_id)
            .field("auto_generate", &self.auto_generate)
            .field("keys_dir", &self.keys_dir)
            .field("lock_timeout", &self.lock_timeout)
            .field("key_size", &self.key_size)
            .finish()
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            private_key_pem: None,
            public_key_pem: None,
            private_key_path: None,
            public_key_path: None,
            key_id: None,
            auto_generate: default_auto_generate(),
            keys_dir: default_keys_dir(),
            lock_timeout: default_lock_timeout(),
            key_size: default_key_size(),
        }
    }
}

#[bon::bon]
impl KeyStoreConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if:
    /// - `key_size` is below [`MIN_KEY_SIZE`]
    /// - `public_key_path` is set without `private_key_path`
    /// - `key_id` is set but empty
    #[builder]
    pub fn new(
        #[builder(into)] private_key_pem: Option<String>,
        #[builder(into)] public_key_pem: Option<String>,
        #[builder(into)] private_key_path: Option<PathBuf>,
        #[builder(into)] public_key_path: Option<PathBuf>,
        #[builder(into)] key_id: Option<String>,
        #[builder(default = default_auto_generate())] auto_generate: bool,
        #[builder(into, default = default_keys_dir())] keys_dir: PathBuf,
        #[builder(default = DEFAULT_LOCK_TIMEOUT)] lock_timeout: Duration,
        #[builder(default = DEFAULT_KEY_SIZE)] key_size: usize,
    ) -> Result<Self, AuthError> {
        let config = Self {
            private_key_pem: private_key_pem.map(Zeroizing::new),
            public_key_pem,
            private_key_path,
            public_key_path,
            key_id,
            auto_generate,
            keys_dir,
            lock_timeout,
            key_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants; called by the builder and by the key store for
    /// deserialized configurations.
    ///
    /// # Errors
    ///
    /// See [`KeyStoreConfig::new`].
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.key_size < MIN_KEY_SIZE {
            return Err(AuthError::config(format!(
                "key_size {} is below the minimum of {MIN_KEY_SIZE} bits",
                self.key_size
            )));
        }
        if self.public_key_path.is_some() && self.private_key_path.is_none() {
            return Err(AuthError::config("public_key_path requires private_key_path"));
        }
        if self.key_id.as_deref().is_some_and(str::is_empty) {
            return Err(AuthError::config("key_id cannot be empty"));
        }
        Ok(())
    }

    /// Returns whether auto-generation is enabled.
    #[must_use]
    pub fn auto_generate(&self) -> bool {
        self.auto_generate
    }

    /// Returns the directory used for generated key files.
    #[must_use]
    pub fn keys_dir(&self) -> &std::path::Path {
        &self.keys_dir
    }

    /// Returns the generation lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Returns the RSA modulus size for generated keys.
    #[must_use]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Returns the configured key id, if any.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }
}

/// Claims policy for minted satellite tokens.
///
/// # Example
///
/// ```
/// use syfthub_authn::TokenConfig;
///
/// let config = TokenConfig::builder()
///     .issuer_url("https://hub.syft.org")
///     .allowed_audiences(["syftai-space", " Partner-Search "])
///     .build()?;
/// assert!(config.allowed_audiences().contains("partner-search"));
/// assert_eq!(config.ttl_seconds(), 60);
/// # Ok::<(), syfthub_authn::AuthError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// Value of the `iss` claim.
    pub(crate) issuer_url: String,

    /// Audiences a token may be minted for (stored normalized).
    #[serde(default)]
    pub(crate) allowed_audiences: BTreeSet<String>,

    /// Token lifetime; `exp - iat` equals this exactly.
    #[serde(default = "default_ttl_seconds")]
    pub(crate) ttl_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TOKEN_TTL_SECONDS
}

#[bon::bon]
impl TokenConfig {
    /// Creates a new token configuration.
    ///
    /// Audiences are normalized (trimmed, lowercased); blank entries are dropped.
    /// An empty allow-list is valid and rejects every mint request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the issuer URL is empty or the TTL is zero.
    #[builder]
    pub fn new(
        #[builder(into)] issuer_url: String,
        #[builder(with = |iter: impl IntoIterator<Item = impl Into<String>>| {
            iter.into_iter().map(Into::into).collect()
        })]
        allowed_audiences: Vec<String>,
        #[builder(default = DEFAULT_TOKEN_TTL_SECONDS)] ttl_seconds: u64,
    ) -> Result<Self, AuthError> {
        let allowed_audiences = allowed_audiences.into_iter().collect();
        let config = Self { issuer_url, allowed_audiences, ttl_seconds };
        config.validate()?;
        Ok(config.normalized())
    }

    /// Re-checks invariants.
    ///
    /// # Errors
    ///
    /// See [`TokenConfig::new`].
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.issuer_url.trim().is_empty() {
            return Err(AuthError::config("issuer_url cannot be empty"));
        }
        if self.ttl_seconds == 0 {
            return Err(AuthError::config("ttl_seconds must be greater than zero"));
        }
        Ok(())
    }

    /// Returns a copy whose audience set is normalized. Deserialized configs
    /// go through this so hand-written entries compare the same way.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.allowed_audiences = self
            .allowed_audiences
            .iter()
            .map(|a| normalize_audience(a))
            .filter(|a| !a.is_empty())
            .collect();
        self
    }

    /// Returns the issuer URL.
    #[must_use]
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    /// Returns the normalized audience allow-list.
    #[must_use]
    pub fn allowed_audiences(&self) -> &BTreeSet<String> {
        &self.allowed_audiences
    }

    /// Returns the token lifetime in seconds.
    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_store_defaults() {
        let config = KeyStoreConfig::builder().build().unwrap();
        assert!(config.auto_generate());
        assert_eq!(config.keys_dir(), std::path::Path::new(DEFAULT_KEYS_DIR));
        assert_eq!(config.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.key_size(), DEFAULT_KEY_SIZE);
        assert!(config.key_id().is_none());
    }

    #[test]
    fn test_key_store_builder_defaults_match_default_impl() {
        let built = KeyStoreConfig::builder().build().unwrap();
        let default = KeyStoreConfig::default();
        assert_eq!(built.auto_generate, default.auto_generate);
        assert_eq!(built.keys_dir, default.keys_dir);
        assert_eq!(built.lock_timeout, default.lock_timeout);
        assert_eq!(built.key_size, default.key_size);
    }

    #[test]
    fn test_key_store_rejects_small_modulus() {
        let result = KeyStoreConfig::builder().key_size(1024).build();
        assert!(matches!(result, Err(AuthError::Config { .. })));
    }

    #[test]
    fn test_key_store_rejects_public_path_alone() {
        let result = KeyStoreConfig::builder().public_key_path("/keys/public.pem").build();
        assert!(matches!(result, Err(AuthError::Config { .. })));
    }

    #[test]
    fn test_key_store_debug_redacts_private_key() {
        let config = KeyStoreConfig::builder()
            .private_key_pem("c2VjcmV0LWtleS1tYXRlcmlhbA==")
            .build()
            .unwrap();
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("c2VjcmV0"));
    }

    #[test]
    fn test_key_store_deserialize_humantime() {
        let config: KeyStoreConfig = serde_json::from_str(
            r#"{"keys_dir": "/srv/keys", "lock_timeout": "3s", "auto_generate": false}"#,
        )
        .unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_secs(3));
        assert!(!config.auto_generate());
        assert_eq!(config.key_size(), DEFAULT_KEY_SIZE);
    }

    #[test]
    fn test_key_store_deserialize_rejects_unknown_fields() {
        let result: Result<KeyStoreConfig, _> = serde_json::from_str(r#"{"keydir": "/srv"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_token_config_normalizes_audiences() {
        let config = TokenConfig::builder()
            .issuer_url("https://hub.example")
            .allowed_audiences(["  SyftAI-Space ", "", "search"])
            .build()
            .unwrap();

        let audiences: Vec<&str> = config.allowed_audiences().iter().map(String::as_str).collect();
        assert_eq!(audiences, vec!["search", "syftai-space"]);
    }

    #[test]
    fn test_token_config_rejects_zero_ttl() {
        let result = TokenConfig::builder()
            .issuer_url("https://hub.example")
            .allowed_audiences(["search"])
            .ttl_seconds(0)
            .build();
        assert!(matches!(result, Err(AuthError::Config { .. })));
    }

    #[test]
    fn test_token_config_rejects_empty_issuer() {
        let result =
            TokenConfig::builder().issuer_url("  ").allowed_audiences(["search"]).build();
        assert!(matches!(result, Err(AuthError::Config { .. })));
    }

    #[test]
    fn test_token_config_deserialized_is_normalized() {
        let config: TokenConfig = serde_json::from_str(
            r#"{"issuer_url": "https://hub.example", "allowed_audiences": ["Space-A"]}"#,
        )
        .unwrap();
        let config = config.normalized();
        assert!(config.allowed_audiences().contains("space-a"));
        assert_eq!(config.ttl_seconds(), DEFAULT_TOKEN_TTL_SECONDS);
    }
}
