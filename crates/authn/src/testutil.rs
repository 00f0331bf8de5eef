//! Shared test utilities for key store and token testing.
//!
//! RSA key generation is slow in unoptimized builds, so the two fixed test
//! keys are generated once per process and cloned on each call. Helpers here
//! also sign arbitrary claims (for expired or foreign-issuer tokens) and craft
//! unsigned raw JWTs (for `alg: none` and algorithm-confusion attacks).
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! syfthub-authn = { path = "../authn", features = ["testutil"] }
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::OnceLock;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use rsa::RsaPrivateKey;

use crate::{
    config::{KeyStoreConfig, TokenConfig},
    key_store::KeyStore,
    token::TokenService,
};

/// Issuer used by [`test_token_service`].
pub const TEST_ISSUER: &str = "https://hub.test.syfthub.org";

/// Audiences allowed by [`test_token_service`].
pub const TEST_AUDIENCES: &[&str] = &["syftai-space", "partner-search"];

static PRIMARY_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
static SECONDARY_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

fn generate(bits: usize) -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::rngs::OsRng, bits).expect("RSA key generation")
}

/// A 2048-bit RSA key, identical for every call within one test process.
#[must_use]
pub fn test_rsa_key() -> RsaPrivateKey {
    PRIMARY_KEY.get_or_init(|| generate(2048)).clone()
}

/// A second 2048-bit RSA key, distinct from [`test_rsa_key`].
#[must_use]
pub fn test_rsa_key_secondary() -> RsaPrivateKey {
    SECONDARY_KEY.get_or_init(|| generate(2048)).clone()
}

/// An initialized in-memory key store signing with [`test_rsa_key`].
///
/// # Panics
///
/// Panics if `kid` is not a valid key id.
#[must_use]
pub fn test_key_store(kid: &str) -> KeyStore {
    KeyStore::with_signing_key(kid, test_rsa_key()).expect("test key store")
}

/// An initialized key store with no key material.
///
/// # Panics
///
/// Panics if initialization fails, which it cannot without configured sources.
pub async fn unconfigured_key_store() -> KeyStore {
    let config = KeyStoreConfig::builder().auto_generate(false).build().expect("config");
    let store = KeyStore::new(config);
    store.initialize().await.expect("unconfigured initialize");
    store
}

/// Key store configuration that auto-generates into a fresh temporary
/// directory. Keep the returned [`tempfile::TempDir`] alive for the duration
/// of the test.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
#[must_use]
pub fn temp_keys_config() -> (tempfile::TempDir, KeyStoreConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = KeyStoreConfig::builder().keys_dir(dir.path()).build().expect("config");
    (dir, config)
}

/// A token service with [`TEST_ISSUER`], [`TEST_AUDIENCES`] and the default TTL.
///
/// # Panics
///
/// Panics if the fixed configuration is rejected.
#[must_use]
pub fn test_token_service() -> TokenService {
    let config = TokenConfig::builder()
        .issuer_url(TEST_ISSUER)
        .allowed_audiences(TEST_AUDIENCES.iter().copied())
        .build()
        .expect("token config");
    TokenService::new(config)
}

/// Claims for a token that would verify against [`test_token_service`],
/// as a JSON object that tests can edit before signing.
#[must_use]
pub fn valid_claims(audience: &str) -> serde_json::Value {
    let now = Utc::now().timestamp();
    serde_json::json!({
        "sub": "42",
        "iss": TEST_ISSUER,
        "aud": audience,
        "role": "user",
        "iat": now,
        "exp": now + 60,
    })
}

/// Signs arbitrary claims with the store's signing key. `kid` overrides the
/// header key id; `None` omits the `kid` header entirely.
///
/// # Panics
///
/// Panics if the store has no signing key or encoding fails.
#[must_use]
pub fn sign_claims(store: &KeyStore, kid: Option<&str>, claims: &serde_json::Value) -> String {
    let signing_key = store.signing_key().expect("store has a signing key");
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_owned);
    jsonwebtoken::encode(&header, claims, signing_key.encoding_key()).expect("encode test JWT")
}

/// Creates a raw JWT string from arbitrary header and payload JSON.
///
/// The result is `{header_b64}.{payload_b64}.{signature}` where the signature
/// segment is `signature` as given (often empty). Useful for testing rejection
/// of `alg: none` and algorithm-confusion tokens.
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[must_use]
pub fn craft_raw_jwt(
    header_json: &serde_json::Value,
    payload_json: &serde_json::Value,
    signature: &str,
) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.{signature}")
}

/// Asserts that a [`Result<T, AuthError>`](crate::AuthError) is an `Err`
/// matching the given variant.
///
/// ```no_run
/// use syfthub_authn::{AuthError, assert_auth_error};
///
/// let result: Result<(), AuthError> = Err(AuthError::invalid_audience("x"));
/// assert_auth_error!(result, InvalidAudience);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

/// Asserts that a verification result is rejected with the given
/// [`VerificationErrorCode`](crate::VerificationErrorCode) variant.
///
/// ```no_run
/// use syfthub_authn::{VerificationError, assert_rejected};
///
/// let result: Result<(), VerificationError> = Err(VerificationError::token_expired());
/// assert_rejected!(result, TokenExpired);
/// ```
#[macro_export]
macro_rules! assert_rejected {
    ($result:expr, $code:ident) => {
        match &$result {
            Err(err) => assert_eq!(
                err.code,
                $crate::error::VerificationErrorCode::$code,
                "unexpected rejection: {err}"
            ),
            Ok(claims) => panic!(
                "expected rejection with {}, token verified: {:?}",
                stringify!($code),
                claims
            ),
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::{AuthError, VerificationError};

    #[test]
    fn test_keys_are_cached_and_distinct() {
        assert_eq!(test_rsa_key(), test_rsa_key());
        assert_ne!(test_rsa_key(), test_rsa_key_secondary());
    }

    #[test]
    fn test_craft_raw_jwt_format() {
        let jwt = craft_raw_jwt(
            &serde_json::json!({"alg": "none", "typ": "JWT"}),
            &serde_json::json!({"sub": "test"}),
            "",
        );
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty());
    }

    #[test]
    fn test_sign_claims_without_kid() {
        let store = test_key_store("k1");
        let token = sign_claims(&store, None, &valid_claims("syftai-space"));
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert!(header.kid.is_none());
        assert_eq!(header.alg, Algorithm::RS256);
    }

    #[test]
    fn test_assert_macros() {
        let result: Result<(), AuthError> = Err(AuthError::not_configured("x"));
        assert_auth_error!(result, NotConfigured);
        assert_auth_error!(result, NotConfigured, "store is empty");

        let result: Result<(), VerificationError> = Err(VerificationError::missing_kid());
        assert_rejected!(result, MissingKid);
    }
}
