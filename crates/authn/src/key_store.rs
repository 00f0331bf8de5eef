//! RSA key material for signing and verifying satellite tokens.
//!
//! A [`KeyStore`] is created once at process start, initialized, and then
//! shared by reference (typically `Arc<KeyStore>`) with every component that
//! signs or verifies tokens.
//!
//! # Sources
//!
//! [`KeyStore::initialize`] tries, in order:
//!
//! 1. Inline base64 PEM from configuration
//! 2. PEM file paths from configuration
//! 3. Auto-generation into `keys_dir`
//!
//! A configured source that fails to load is logged and the next source is
//! tried. If none succeeds and auto-generation is disabled, the first failure
//! is returned. With nothing configured and auto-generation disabled the store
//! is "initialized but unconfigured":
//! minting fails with [`AuthError::NotConfigured`] and verification reports
//! `idp_not_configured`, but startup succeeds.
//!
//! # Multi-worker generation
//!
//! ```text
//! persisted files exist? ── yes ──> load, done
//!        │ no
//! acquire lock (poll, bounded) ── timeout ──> persisted now? ── yes ──> load
//!        │ held                                     │ no
//! persisted now? ── yes ──> load, release           └──> KeyLoad error
//!        │ no
//! generate, persist (0600 private), release
//! ```
//!
//! The second existence check closes the window between a worker's first
//! check and its lock acquisition, during which another worker may have
//! generated and released.

use std::{
    collections::BTreeMap,
    fmt,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use base64::{Engine, engine::general_purpose::STANDARD};
use fail::fail_point;
use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use zeroize::Zeroizing;

use crate::{
    config::KeyStoreConfig,
    error::AuthError,
    jwks::{Jwk, Jwks, jwk_thumbprint},
    lock::KeyGenerationLock,
    validation::validate_kid,
};

/// File name of the persisted private key inside `keys_dir`.
pub const PRIVATE_KEY_FILE: &str = "idp_private.pem";

/// File name of the persisted public key inside `keys_dir`.
pub const PUBLIC_KEY_FILE: &str = "idp_public.pem";

/// File name of the generation lock inside `keys_dir`.
pub const LOCK_FILE: &str = ".idp_keys.lock";

/// Where the active signing key came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySource {
    /// Inline base64 PEM configuration.
    Inline,
    /// PEM file paths from configuration.
    Files,
    /// Generated by this process and persisted to `keys_dir`.
    Generated,
    /// Loaded from `keys_dir`, generated earlier or by another process.
    Persisted,
    /// Supplied directly through [`KeyStore::with_signing_key`].
    InMemory,
}

/// The active private key together with its id and signing handle.
pub struct SigningKey {
    kid: String,
    private_key: RsaPrivateKey,
    encoding_key: EncodingKey,
}

impl SigningKey {
    fn new(kid: String, private_key: RsaPrivateKey) -> Result<Self, AuthError> {
        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| AuthError::key_load(format!("encode private key: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());
        Ok(Self { kid, private_key, encoding_key })
    }

    /// Key id placed in the `kid` header of new tokens.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The RSA private key.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Handle for `jsonwebtoken::encode`.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// A verification key with its precomputed JWK and decoding handle.
struct PublicKeyEntry {
    key: RsaPublicKey,
    jwk: Jwk,
    decoding_key: Arc<DecodingKey>,
}

impl PublicKeyEntry {
    fn new(kid: &str, key: RsaPublicKey) -> Result<Self, AuthError> {
        let jwk = Jwk::from_rsa_public_key(kid, &key);
        let decoding_key = Arc::new(jwk.decoding_key()?);
        Ok(Self { key, jwk, decoding_key })
    }
}

#[derive(Default)]
struct KeyMaterial {
    signing_key: Option<Arc<SigningKey>>,
    public_keys: BTreeMap<String, PublicKeyEntry>,
    source: Option<KeySource>,
}

/// Holds the process's RSA key material.
///
/// One private key is used for new signatures (its id is the
/// [current key id](Self::current_key_id)); any number of public keys may be
/// valid for verification at once to support rotation.
pub struct KeyStore {
    config: KeyStoreConfig,
    material: RwLock<KeyMaterial>,
    initialized: AtomicBool,
    init_guard: tokio::sync::Mutex<()>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let material = self.material.read();
        f.debug_struct("KeyStore")
            .field("initialized", &self.is_initialized())
            .field("source", &material.source)
            .field("current_key_id", &material.signing_key.as_ref().map(|k| k.kid.clone()))
            .field("public_keys", &material.public_keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyStore {
    /// Creates an uninitialized key store. Call [`initialize`](Self::initialize)
    /// before use.
    #[must_use]
    pub fn new(config: KeyStoreConfig) -> Self {
        Self {
            config,
            material: RwLock::new(KeyMaterial::default()),
            initialized: AtomicBool::new(false),
            init_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates an initialized key store around an existing private key.
    ///
    /// Nothing is read from or written to disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKid`] if `kid` is malformed, or
    /// [`AuthError::KeyLoad`] if the key cannot be encoded for signing.
    pub fn with_signing_key(
        kid: impl Into<String>,
        private_key: RsaPrivateKey,
    ) -> Result<Self, AuthError> {
        let store = Self::new(KeyStoreConfig { auto_generate: false, ..KeyStoreConfig::default() });
        store.install(Some(kid.into()), private_key, KeySource::InMemory)?;
        store.initialized.store(true, Ordering::Release);
        Ok(store)
    }

    /// Loads or generates key material. Idempotent: later calls return
    /// immediately once a call has succeeded.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Config`] if the configuration is invalid
    /// - [`AuthError::KeyLoad`] if a configured source fails and auto-generation is disabled, or if
    ///   the generation lock times out and no persisted keys appeared
    /// - [`AuthError::KeyGeneration`] / [`AuthError::Io`] if generation or persistence fails
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), AuthError> {
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.init_guard.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.config.validate()?;

        let mut configured_failure = None;

        if let Some(pem_b64) = &self.config.private_key_pem {
            match self.load_inline(pem_b64) {
                Ok(key) => return self.finish(key, KeySource::Inline),
                Err(err) => {
                    tracing::warn!(error = %err, "inline key material could not be loaded");
                    configured_failure = Some(err);
                },
            }
        }

        if let Some(path) = &self.config.private_key_path {
            match self.load_files(path, self.config.public_key_path.as_deref()) {
                Ok(key) => return self.finish(key, KeySource::Files),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "key files could not be loaded"
                    );
                    configured_failure.get_or_insert(err);
                },
            }
        }

        if self.config.auto_generate {
            match self.load_or_generate().await {
                Ok((key, source)) => return self.finish(key, source),
                Err(err) => {
                    tracing::error!(error = %err, "key auto-generation failed");
                    return Err(err);
                },
            }
        }

        if let Some(err) = configured_failure {
            tracing::error!(
                error = %err,
                "no key source succeeded and auto-generation is disabled"
            );
            return Err(AuthError::key_load(err.to_string()));
        }

        tracing::info!("no key material configured; token issuance is disabled");
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Drops all key material and runs [`initialize`](Self::initialize) again.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize).
    pub async fn reinitialize(&self) -> Result<(), AuthError> {
        {
            let _guard = self.init_guard.lock().await;
            *self.material.write() = KeyMaterial::default();
            self.initialized.store(false, Ordering::Release);
        }
        self.initialize().await
    }

    /// Returns `true` once [`initialize`](Self::initialize) has completed,
    /// whether or not keys were found.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns `true` if a signing key is available.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.material.read().signing_key.is_some()
    }

    /// Returns `true` if at least one verification key is known.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        !self.material.read().public_keys.is_empty()
    }

    /// Where the signing key came from, if one is loaded.
    #[must_use]
    pub fn key_source(&self) -> Option<KeySource> {
        self.material.read().source
    }

    /// Key id used for new signatures.
    #[must_use]
    pub fn current_key_id(&self) -> Option<String> {
        self.material.read().signing_key.as_ref().map(|k| k.kid.clone())
    }

    /// The active signing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotConfigured`] if no private key is loaded.
    pub fn signing_key(&self) -> Result<Arc<SigningKey>, AuthError> {
        self.material
            .read()
            .signing_key
            .clone()
            .ok_or_else(|| AuthError::not_configured("no signing key loaded"))
    }

    /// Public key registered under `kid`.
    #[must_use]
    pub fn public_key(&self, kid: &str) -> Option<RsaPublicKey> {
        self.material.read().public_keys.get(kid).map(|entry| entry.key.clone())
    }

    /// Decoding handle for the public key registered under `kid`.
    #[must_use]
    pub fn decoding_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.material.read().public_keys.get(kid).map(|entry| Arc::clone(&entry.decoding_key))
    }

    /// Registers (or replaces) a verification key. The signing key is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKid`] if `kid` is malformed, or
    /// [`AuthError::InvalidPublicKey`] if the key cannot be used for RS256.
    pub fn add_public_key(&self, kid: &str, key: RsaPublicKey) -> Result<(), AuthError> {
        validate_kid(kid)?;
        let entry = PublicKeyEntry::new(kid, key)?;
        let replaced = self.material.write().public_keys.insert(kid.to_owned(), entry).is_some();
        tracing::info!(kid, replaced, "registered verification key");
        Ok(())
    }

    /// Every known public key in JWKS form.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotConfigured`] if no keys are known.
    pub fn get_jwks(&self) -> Result<Jwks, AuthError> {
        let material = self.material.read();
        if material.public_keys.is_empty() {
            return Err(AuthError::not_configured("no verification keys loaded"));
        }
        Ok(Jwks { keys: material.public_keys.values().map(|entry| entry.jwk.clone()).collect() })
    }

    fn finish(&self, key: RsaPrivateKey, source: KeySource) -> Result<(), AuthError> {
        self.install(self.config.key_id.clone(), key, source)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn install(
        &self,
        kid: Option<String>,
        private_key: RsaPrivateKey,
        source: KeySource,
    ) -> Result<(), AuthError> {
        let public_key = private_key.to_public_key();
        let kid = kid.unwrap_or_else(|| jwk_thumbprint(&public_key));
        validate_kid(&kid)?;

        let entry = PublicKeyEntry::new(&kid, public_key)?;
        let signing_key = SigningKey::new(kid.clone(), private_key)?;

        let mut material = self.material.write();
        material.public_keys.insert(kid.clone(), entry);
        material.signing_key = Some(Arc::new(signing_key));
        material.source = Some(source);
        drop(material);

        tracing::info!(kid = %kid, source = ?source, "signing key loaded");
        Ok(())
    }

    fn load_inline(&self, pem_b64: &str) -> Result<RsaPrivateKey, AuthError> {
        let private_pem = decode_inline_pem(pem_b64, "private_key_pem")?;
        let private_key = parse_private_pem(&private_pem)?;
        if let Some(public_b64) = &self.config.public_key_pem {
            let public_pem = decode_inline_pem(public_b64, "public_key_pem")?;
            ensure_pair(&private_key, &parse_public_pem(&public_pem)?)?;
        }
        Ok(private_key)
    }

    fn load_files(
        &self,
        private_path: &Path,
        public_path: Option<&Path>,
    ) -> Result<RsaPrivateKey, AuthError> {
        let private_pem = read_pem(private_path)?;
        let private_key = parse_private_pem(&private_pem)?;
        if let Some(public_path) = public_path {
            ensure_pair(&private_key, &parse_public_pem(&read_pem(public_path)?)?)?;
        }
        Ok(private_key)
    }

    async fn load_or_generate(&self) -> Result<(RsaPrivateKey, KeySource), AuthError> {
        let paths = KeyPaths::new(&self.config.keys_dir);
        std::fs::create_dir_all(&paths.dir).map_err(|e| AuthError::io(&paths.dir, e))?;

        if let Some(key) = paths.load_persisted()? {
            return Ok((key, KeySource::Persisted));
        }

        let lock = match KeyGenerationLock::acquire(&paths.lock, self.config.lock_timeout).await {
            Ok(lock) => lock,
            Err(AuthError::LockTimeout { waited_ms, .. }) => {
                tracing::warn!(waited_ms, "key generation lock timed out; re-checking for keys");
                return match paths.load_persisted()? {
                    Some(key) => Ok((key, KeySource::Persisted)),
                    None => Err(AuthError::key_load(format!(
                        "timed out after {waited_ms}ms waiting for key generation \
                         and no keys were persisted in {}",
                        paths.dir.display()
                    ))),
                };
            },
            Err(err) => return Err(err),
        };

        if let Some(key) = paths.load_persisted()? {
            tracing::debug!("keys were generated by another worker while waiting for the lock");
            return Ok((key, KeySource::Persisted));
        }

        fail_point!("key-store-before-generate", |_| {
            Err(AuthError::key_generation("injected failure before key generation"))
        });

        let bits = self.config.key_size;
        tracing::info!(bits, dir = %paths.dir.display(), "generating RSA key pair");
        let key =
            tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut rand::rngs::OsRng, bits))
                .await
                .map_err(|e| AuthError::key_generation(format!("generation task failed: {e}")))?
                .map_err(|e| AuthError::key_generation(e.to_string()))?;

        paths.persist(&key)?;
        drop(lock);

        Ok((key, KeySource::Generated))
    }
}

/// Locations of the persisted key files.
struct KeyPaths {
    dir: PathBuf,
    private: PathBuf,
    public: PathBuf,
    lock: PathBuf,
}

impl KeyPaths {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            private: dir.join(PRIVATE_KEY_FILE),
            public: dir.join(PUBLIC_KEY_FILE),
            lock: dir.join(LOCK_FILE),
        }
    }

    /// Loads the persisted private key if both files are in place.
    fn load_persisted(&self) -> Result<Option<RsaPrivateKey>, AuthError> {
        if !(self.private.is_file() && self.public.is_file()) {
            return Ok(None);
        }
        let key = parse_private_pem(&read_pem(&self.private)?)?;
        tracing::info!(path = %self.private.display(), "loaded persisted key pair");
        Ok(Some(key))
    }

    /// Writes both PEM files. The public file lands first and the private
    /// file last, so [`load_persisted`](Self::load_persisted) never sees a
    /// private key without its public counterpart.
    fn persist(&self, key: &RsaPrivateKey) -> Result<(), AuthError> {
        let private_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AuthError::key_generation(format!("encode private key: {e}")))?;
        let public_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AuthError::key_generation(format!("encode public key: {e}")))?;

        write_file_atomic(&self.public, public_pem.as_bytes(), 0o644)?;
        write_file_atomic(&self.private, private_pem.as_bytes(), 0o600)?;

        tracing::info!(dir = %self.dir.display(), "persisted generated key pair");
        Ok(())
    }
}

fn write_file_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), AuthError> {
    let tmp = path.with_extension("pem.tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).map_err(|e| AuthError::io(&tmp, e))?;
    file.write_all(contents).map_err(|e| AuthError::io(&tmp, e))?;
    file.sync_all().map_err(|e| AuthError::io(&tmp, e))?;
    drop(file);

    // The umask may have narrowed the creation mode; set it exactly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))
            .map_err(|e| AuthError::io(&tmp, e))?;
    }

    std::fs::rename(&tmp, path).map_err(|e| AuthError::io(path, e))
}

fn read_pem(path: &Path) -> Result<Zeroizing<String>, AuthError> {
    std::fs::read_to_string(path).map(Zeroizing::new).map_err(|e| AuthError::io(path, e))
}

fn decode_inline_pem(value: &str, field: &str) -> Result<Zeroizing<String>, AuthError> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(value.trim().as_bytes())
            .map_err(|e| AuthError::key_load(format!("{field}: base64 decode: {e}")))?,
    );
    let pem = std::str::from_utf8(&bytes)
        .map_err(|e| AuthError::key_load(format!("{field}: not UTF-8: {e}")))?;
    Ok(Zeroizing::new(pem.to_owned()))
}

fn parse_private_pem(pem: &str) -> Result<RsaPrivateKey, AuthError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::key_load(format!("private key is not PKCS#8 or PKCS#1 PEM: {e}")))
}

fn parse_public_pem(pem: &str) -> Result<RsaPublicKey, AuthError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::invalid_public_key(format!("not SPKI or PKCS#1 PEM: {e}")))
}

fn ensure_pair(private_key: &RsaPrivateKey, public_key: &RsaPublicKey) -> Result<(), AuthError> {
    if &private_key.to_public_key() != public_key {
        return Err(AuthError::key_load("configured public key does not match the private key"));
    }
    Ok(())
}
