//! # SyftHub Identity Provider
//!
//! HTTP endpoints that publish the hub's verification keys and hand out
//! audience-bound satellite tokens:
//!
//! - `GET /.well-known/jwks.json`: public key set, cacheable for an hour
//! - `GET /api/v1/token?aud=<audience>`: mints a token for the authenticated user
//! - `GET /api/v1/token/audiences`: the allow-list and whether signing is possible
//! - `POST /api/v1/verify`: checks a token on behalf of a registered service
//!
//! The crate does not store users. The host application plugs its user and
//! service registry in through [`IdentityDirectory`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use syfthub_authn::{KeyStore, KeyStoreConfig, TokenConfig, TokenService};
//! use syfthub_idp::{IdentityDirectory, IdpState, router};
//!
//! # async fn example(
//! #     directory: Arc<dyn IdentityDirectory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = KeyStoreConfig::builder().keys_dir("/var/lib/syfthub/keys").build()?;
//! let key_store = KeyStore::new(config);
//! key_store.initialize().await?;
//! let tokens = TokenService::new(
//!     TokenConfig::builder()
//!         .issuer_url("https://hub.syft.org")
//!         .allowed_audiences(["syftai-space"])
//!         .build()?,
//! );
//!
//! let app = router(IdpState::new(Arc::new(key_store), Arc::new(tokens), directory));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Caller authentication seam.
pub mod directory;
/// HTTP error responses.
pub mod error;
/// Endpoint handlers and router.
pub mod routes;

/// In-memory directory and router fixtures (requires the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use directory::{IdentityDirectory, UserIdentity, UserProfile, bearer_token};
pub use error::{ApiError, ErrorBody};
pub use routes::{
    AudiencesResponse, IdpState, JWKS_CACHE_CONTROL, JWKS_PATH, TokenQuery, USER_NOT_FOUND,
    VerifyRequest, VerifyResponse, router,
};
