//! Identity provider endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use syfthub_authn::{KeyStore, TokenGrant, TokenService};

use crate::{
    directory::{IdentityDirectory, bearer_token},
    error::ApiError,
};

/// Path of the public key set.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// `Cache-Control` sent with the key set.
pub const JWKS_CACHE_CONTROL: &str = "public, max-age=3600";

/// Error code reported by `/verify` when the token's subject no longer exists.
pub const USER_NOT_FOUND: &str = "user_not_found";

/// Shared state for every endpoint.
#[derive(Clone)]
pub struct IdpState {
    /// Signing and verification keys.
    pub key_store: Arc<KeyStore>,
    /// Token minting and verification.
    pub tokens: Arc<TokenService>,
    /// Caller authentication and user lookup.
    pub directory: Arc<dyn IdentityDirectory>,
}

impl IdpState {
    /// Bundles the components the router needs.
    pub fn new(
        key_store: Arc<KeyStore>,
        tokens: Arc<TokenService>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self { key_store, tokens, directory }
    }
}

/// Builds the identity provider router.
pub fn router(state: IdpState) -> Router {
    Router::new()
        .route(JWKS_PATH, get(jwks))
        .route("/api/v1/token", get(issue_token))
        .route("/api/v1/token/audiences", get(audiences))
        .route("/api/v1/verify", post(verify))
        .with_state(state)
}

async fn jwks(State(state): State<IdpState>) -> Result<Response, ApiError> {
    let keys = state.key_store.get_jwks()?;
    let mut response = Json(keys).into_response();
    response.headers_mut().insert(CACHE_CONTROL, HeaderValue::from_static(JWKS_CACHE_CONTROL));
    Ok(response)
}

/// Query string of the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    /// Target audience.
    pub aud: Option<String>,
}

#[tracing::instrument(skip_all)]
async fn issue_token(
    State(state): State<IdpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenGrant>, ApiError> {
    let bearer = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    let user = state.directory.authenticate_user(bearer).await.ok_or(ApiError::Unauthorized)?;

    let audience = query.aud.as_deref().map(str::trim).filter(|a| !a.is_empty());
    let audience = audience.ok_or(ApiError::MissingAudience)?;

    let grant = state.tokens.issue_token(&user.id, &user.role, audience, &state.key_store)?;
    tracing::info!(user_id = %user.id, audience, "issued satellite token");
    Ok(Json(grant))
}

/// Body of the audience discovery endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudiencesResponse {
    /// Sorted, normalized audiences tokens can be minted for.
    pub allowed_audiences: Vec<String>,
    /// Whether the key store holds a signing key.
    pub idp_configured: bool,
}

async fn audiences(State(state): State<IdpState>) -> Json<AudiencesResponse> {
    Json(AudiencesResponse {
        allowed_audiences: state.tokens.allowed_audiences().iter().cloned().collect(),
        idp_configured: state.key_store.is_configured(),
    })
}

/// Body of a verification request.
#[derive(Debug, Deserialize, Serialize)]
pub struct VerifyRequest {
    /// Satellite token presented to the calling service.
    pub token: String,
}

/// Body of a verification response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VerifyResponse {
    /// The token is valid for the calling service.
    Valid {
        /// Always `true`.
        valid: bool,
        /// Hub user id.
        sub: String,
        /// User email.
        email: String,
        /// Username.
        username: String,
        /// Hub role.
        role: String,
        /// Audience the token is bound to.
        aud: String,
        /// Expiry, seconds since the Unix epoch.
        exp: i64,
        /// Issued at, seconds since the Unix epoch.
        iat: i64,
    },
    /// The token was rejected.
    Invalid {
        /// Always `false`.
        valid: bool,
        /// Machine-readable rejection code.
        error: String,
        /// Human-readable reason.
        message: String,
    },
}

impl VerifyResponse {
    fn invalid(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid { valid: false, error: error.into(), message: message.into() }
    }

    /// Whether the token was accepted.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Verifies a token on behalf of the calling service, whose registered
/// audience is the only one the token may be bound to.
#[tracing::instrument(skip_all, fields(audience))]
async fn verify(
    State(state): State<IdpState>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let bearer = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    let audience =
        state.directory.authenticate_service(bearer).await.ok_or(ApiError::Unauthorized)?;
    tracing::Span::current().record("audience", audience.as_str());

    let claims =
        match state.tokens.verify_token_for_audience(&request.token, &state.key_store, &audience) {
            Ok(claims) => claims,
            Err(rejection) => {
                let body = VerifyResponse::invalid(rejection.code.as_str(), rejection.message);
                return Ok(Json(body));
            },
        };

    let Some(profile) = state.directory.lookup_user(&claims.sub).await else {
        tracing::warn!(sub = %claims.sub, "verified token for unknown user");
        return Ok(Json(VerifyResponse::invalid(
            USER_NOT_FOUND,
            format!("User '{}' no longer exists", claims.sub),
        )));
    };

    Ok(Json(VerifyResponse::Valid {
        valid: true,
        sub: claims.sub,
        email: profile.email,
        username: profile.username,
        role: claims.role,
        aud: claims.aud,
        exp: claims.exp,
        iat: claims.iat,
    }))
}
