//! # SyftHub Authentication
//!
//! RSA key material and audience-bound satellite tokens for SyftHub services.
//!
//! This crate provides:
//! - **Key store**: loads RSA keys from inline PEM, PEM files, or auto-generates them with
//!   cross-process coordination so every worker converges on one key pair
//! - **JWKS**: publishes every verification key as `{kty, kid, use, alg, n, e}`
//! - **Satellite tokens**: short-lived RS256 JWTs bound to exactly one audience, verified
//!   statelessly by the receiving service
//!
//! ## Security
//!
//! - Only RS256 is accepted; `none` and HMAC algorithms are rejected before key lookup
//! - Verification checks the audience explicitly, so a token minted for one service cannot be
//!   replayed against another
//! - Persisted private keys are written owner-only (`0600`)
//!
//! ## Example
//!
//! ```no_run
//! use syfthub_authn::{KeyStore, KeyStoreConfig, TokenConfig, TokenService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KeyStoreConfig::builder().keys_dir("/var/lib/syfthub/keys").build()?;
//! let key_store = KeyStore::new(config);
//! key_store.initialize().await?;
//!
//! let tokens = TokenService::new(
//!     TokenConfig::builder()
//!         .issuer_url("https://hub.syft.org")
//!         .allowed_audiences(["syftai-space"])
//!         .build()?,
//! );
//!
//! let token = tokens.create_token(42, "user", "syftai-space", &key_store)?;
//! match tokens.verify_token_for_audience(&token, &key_store, "syftai-space") {
//!     Ok(claims) => println!("verified user {}", claims.sub),
//!     Err(rejection) => println!("rejected: {}", rejection.code),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Key store and token configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// JSON Web Key Set types.
pub mod jwks;
/// RSA key store.
pub mod key_store;
/// Cross-process key generation lock.
pub mod lock;
/// Satellite token minting and verification.
pub mod token;
/// Algorithm, key id, and audience validation.
pub mod validation;

/// Shared test utilities (requires the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use config::{KeyStoreConfig, TokenConfig};
pub use error::{AuthError, Result, VerificationError, VerificationErrorCode};
pub use jwks::{Jwk, Jwks, jwk_thumbprint};
pub use key_store::{KeySource, KeyStore, SigningKey};
pub use token::{SatelliteClaims, TokenGrant, TokenService};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
