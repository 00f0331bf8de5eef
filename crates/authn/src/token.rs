//! Audience-bound satellite tokens.
//!
//! A satellite token is a short-lived RS256 JWT that lets the hub vouch for a
//! user to exactly one downstream service (the audience). The downstream
//! service verifies it statelessly against the hub's published JWKS, so no
//! session store is shared.
//!
//! ```json
//! // header
//! { "alg": "RS256", "typ": "JWT", "kid": "<current key id>" }
//! // claims
//! { "sub": "42", "iss": "https://hub.syft.org", "aud": "syftai-space",
//!   "role": "user", "iat": 1700000000, "exp": 1700000060 }
//! ```
//!
//! # Verification order
//!
//! 1. Header decodes, else `invalid_token_format`
//! 2. `kid` present, else `missing_kid`; non-empty, bounded and free of control
//!    characters, else `invalid_token_format`
//! 3. Algorithm is RS256, else `invalid_token_format`
//! 4. Key store has keys, else `idp_not_configured`; knows `kid`, else `unknown_key`
//! 5. Signature, `iss`, and `exp` (no leeway)
//! 6. `aud` equals the authorized audience, else `audience_mismatch`
//!
//! Step 6 runs even though the signature is valid: a token minted for one
//! service must never be replayable against another.

use std::{collections::BTreeSet, fmt::Display};

use chrono::Utc;
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};

use crate::{
    config::TokenConfig,
    error::{AuthError, VerificationError},
    key_store::KeyStore,
    validation::{normalize_audience, validate_algorithm, validate_presented_kid},
};

/// Claims carried by a satellite token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteClaims {
    /// Subject: the hub user id, as a string.
    pub sub: String,
    /// Issuer URL of the hub.
    pub iss: String,
    /// The single service this token is valid for (normalized).
    pub aud: String,
    /// The user's role at the hub.
    pub role: String,
    /// Issued at, seconds since the Unix epoch.
    pub iat: i64,
    /// Expiry, seconds since the Unix epoch. Always `iat + ttl`.
    pub exp: i64,
}

/// A freshly minted token and its lifetime, as returned by the token endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// The signed satellite token.
    pub target_token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

/// Mints and verifies satellite tokens.
#[derive(Debug, Clone)]
pub struct TokenService {
    config: TokenConfig,
}

impl TokenService {
    /// Creates a token service. Audiences in `config` are normalized.
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        Self { config: config.normalized() }
    }

    /// Returns the token configuration.
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Audiences a token may be minted for.
    #[must_use]
    pub fn allowed_audiences(&self) -> &BTreeSet<String> {
        self.config.allowed_audiences()
    }

    /// Case-insensitive, whitespace-trimmed allow-list membership check.
    #[must_use]
    pub fn validate_audience(&self, audience: &str) -> bool {
        self.config.allowed_audiences().contains(&normalize_audience(audience))
    }

    /// Mints a token for `subject_id` bound to `audience`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidAudience`] if `audience` is not allowed
    /// - [`AuthError::NotConfigured`] if the key store has no signing key
    /// - [`AuthError::Signing`] if encoding fails
    #[tracing::instrument(skip_all, fields(audience = %audience, kid))]
    pub fn create_token(
        &self,
        subject_id: impl Display,
        role: &str,
        audience: &str,
        key_store: &KeyStore,
    ) -> Result<String, AuthError> {
        if !self.validate_audience(audience) {
            tracing::warn!(audience, "refusing to mint token for unknown audience");
            return Err(AuthError::invalid_audience(audience));
        }
        let signing_key = key_store.signing_key()?;
        tracing::Span::current().record("kid", signing_key.kid());

        let ttl = i64::try_from(self.config.ttl_seconds())
            .map_err(|_| AuthError::config("ttl_seconds does not fit in a timestamp"))?;
        let iat = Utc::now().timestamp();
        let claims = SatelliteClaims {
            sub: subject_id.to_string(),
            iss: self.config.issuer_url().to_owned(),
            aud: normalize_audience(audience),
            role: role.to_owned(),
            iat,
            exp: iat + ttl,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signing_key.kid().to_owned());

        let token = jsonwebtoken::encode(&header, &claims, signing_key.encoding_key())
            .map_err(|e| AuthError::signing(e.to_string()))?;

        tracing::debug!(aud = %claims.aud, exp = claims.exp, "minted satellite token");
        Ok(token)
    }

    /// Mints a token and reports its lifetime.
    ///
    /// # Errors
    ///
    /// Same as [`create_token`](Self::create_token).
    pub fn issue_token(
        &self,
        subject_id: impl Display,
        role: &str,
        audience: &str,
        key_store: &KeyStore,
    ) -> Result<TokenGrant, AuthError> {
        let target_token = self.create_token(subject_id, role, audience, key_store)?;
        Ok(TokenGrant { target_token, expires_in: self.config.ttl_seconds() })
    }

    /// Verifies `token` for `authorized_audience`.
    ///
    /// Never panics and never returns an [`AuthError`]: every rejection is a
    /// [`VerificationError`] the caller can forward to its own client.
    #[tracing::instrument(skip(self, token, key_store))]
    pub fn verify_token_for_audience(
        &self,
        token: &str,
        key_store: &KeyStore,
        authorized_audience: &str,
    ) -> Result<SatelliteClaims, VerificationError> {
        let result = self.verify(token, key_store, authorized_audience);
        match &result {
            Ok(claims) => tracing::debug!(sub = %claims.sub, "satellite token verified"),
            Err(err) => tracing::debug!(code = %err.code, "satellite token rejected"),
        }
        result
    }

    fn verify(
        &self,
        token: &str,
        key_store: &KeyStore,
        authorized_audience: &str,
    ) -> Result<SatelliteClaims, VerificationError> {
        let header = decode_header(token).map_err(|e| {
            VerificationError::invalid_token_format(format!("Malformed token header: {e}"))
        })?;

        let kid = header.kid.ok_or_else(VerificationError::missing_kid)?;
        validate_presented_kid(&kid)
            .map_err(|e| VerificationError::invalid_token_format(e.to_string()))?;
        validate_algorithm(&format!("{:?}", header.alg))
            .map_err(|e| VerificationError::invalid_token_format(e.to_string()))?;

        if !key_store.has_keys() {
            return Err(VerificationError::idp_not_configured());
        }
        let decoding_key =
            key_store.decoding_key(&kid).ok_or_else(|| VerificationError::unknown_key(&kid))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[self.config.issuer_url()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<SatelliteClaims>(token, &decoding_key, &validation)?.claims;

        let expected = normalize_audience(authorized_audience);
        if normalize_audience(&claims.aud) != expected {
            return Err(VerificationError::audience_mismatch(&expected, &claims.aud));
        }

        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        assert_auth_error, assert_rejected,
        config::TokenConfig,
        testutil::{
            TEST_ISSUER, sign_claims, test_key_store, test_token_service, unconfigured_key_store,
            valid_claims,
        },
    };

    #[test]
    fn test_validate_audience_is_case_and_space_insensitive() {
        let service = test_token_service();
        assert!(service.validate_audience("syftai-space"));
        assert!(service.validate_audience("  SyftAI-Space\t"));
        assert!(!service.validate_audience("other-service"));
        assert!(!service.validate_audience(""));
    }

    #[test]
    fn test_round_trip_recovers_claims() {
        let service = test_token_service();
        let store = test_key_store("hub-1");

        let token = service.create_token(42, "admin", "syftai-space", &store).unwrap();
        let claims = service.verify_token_for_audience(&token, &store, "syftai-space").unwrap();

        assert_eq!(claims.sub, "42");
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.aud, "syftai-space");
        assert_eq!(claims.iss, TEST_ISSUER);
    }

    #[test]
    fn test_header_carries_current_kid() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = service.create_token("7", "user", "syftai-space", &store).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("hub-1"));
    }

    #[test]
    fn test_audience_is_normalized_at_mint() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = service.create_token("7", "user", " SyftAI-Space ", &store).unwrap();

        let claims = service.verify_token_for_audience(&token, &store, "syftai-space").unwrap();
        assert_eq!(claims.aud, "syftai-space");
    }

    #[test]
    fn test_other_audience_is_rejected() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = service.create_token("7", "user", "syftai-space", &store).unwrap();

        let result = service.verify_token_for_audience(&token, &store, "partner-search");
        assert_rejected!(result, AudienceMismatch);
    }

    #[test]
    fn test_exp_minus_iat_equals_ttl() {
        let config = TokenConfig::builder()
            .issuer_url(TEST_ISSUER)
            .allowed_audiences(["syftai-space"])
            .ttl_seconds(300)
            .build()
            .unwrap();
        let service = TokenService::new(config);
        let store = test_key_store("hub-1");

        let grant = service.issue_token("7", "user", "syftai-space", &store).unwrap();
        assert_eq!(grant.expires_in, 300);
        let claims =
            service.verify_token_for_audience(&grant.target_token, &store, "syftai-space").unwrap();
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[test]
    fn test_unknown_audience_is_invalid() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let result = service.create_token("7", "user", "evil-service", &store);
        assert_auth_error!(result, InvalidAudience);
    }

    #[tokio::test]
    async fn test_unconfigured_store_cannot_mint() {
        let service = test_token_service();
        let store = unconfigured_key_store().await;
        let result = service.create_token("7", "user", "syftai-space", &store);
        assert_auth_error!(result, NotConfigured);
    }

    #[tokio::test]
    async fn test_unconfigured_store_cannot_verify() {
        let service = test_token_service();
        let signer = test_key_store("hub-1");
        let token = service.create_token("7", "user", "syftai-space", &signer).unwrap();

        let verifier = unconfigured_key_store().await;
        let result = service.verify_token_for_audience(&token, &verifier, "syftai-space");
        assert_rejected!(result, IdpNotConfigured);
    }

    #[test]
    fn test_unknown_kid() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = sign_claims(&store, Some("rotated-away"), &valid_claims("syftai-space"));

        let result = service.verify_token_for_audience(&token, &store, "syftai-space");
        assert_rejected!(result, UnknownKey);
    }

    #[test]
    fn test_missing_kid() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = sign_claims(&store, None, &valid_claims("syftai-space"));

        let result = service.verify_token_for_audience(&token, &store, "syftai-space");
        assert_rejected!(result, MissingKid);
    }

    #[test]
    fn test_expired_token() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let mut claims = valid_claims("syftai-space");
        let now = Utc::now().timestamp();
        claims["iat"] = (now - 120).into();
        claims["exp"] = (now - 60).into();
        let token = sign_claims(&store, Some("hub-1"), &claims);

        let result = service.verify_token_for_audience(&token, &store, "syftai-space");
        assert_rejected!(result, TokenExpired);
    }

    #[test]
    fn test_foreign_issuer() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let mut claims = valid_claims("syftai-space");
        claims["iss"] = "https://impostor.example".into();
        let token = sign_claims(&store, Some("hub-1"), &claims);

        let result = service.verify_token_for_audience(&token, &store, "syftai-space");
        assert_rejected!(result, InvalidIssuer);
    }

    #[test]
    fn test_garbage_is_invalid_format() {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        for token in ["", "not-a-jwt", "a.b.c", "....."] {
            let result = service.verify_token_for_audience(token, &store, "syftai-space");
            assert_rejected!(result, InvalidTokenFormat);
        }
    }

    #[test]
    fn test_rotated_public_key_still_verifies() {
        let service = test_token_service();
        let old = test_key_store("hub-old");
        let token = service.create_token("7", "user", "syftai-space", &old).unwrap();

        let new = KeyStore::with_signing_key("hub-new", crate::testutil::test_rsa_key_secondary())
            .unwrap();
        new.add_public_key("hub-old", old.public_key("hub-old").unwrap()).unwrap();

        let claims = service.verify_token_for_audience(&token, &new, "syftai-space").unwrap();
        assert_eq!(claims.sub, "7");
    }
}
