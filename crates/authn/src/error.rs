//! Authentication error types.
//!
//! Two families of failure live here:
//!
//! - [`AuthError`] is raised to the immediate caller. It covers startup failures (no usable key
//!   material) and request-time programming or configuration errors (unknown audience, key store
//!   not configured).
//! - [`VerificationError`] is the failure half of token verification. Verification never raises:
//!   a verifying service must be able to answer its own caller with a structured response, so
//!   every rejection is a value carrying a [`VerificationErrorCode`].

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key store and token minting errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The key store holds no signing key (or no keys at all).
    #[error("Identity provider not configured: {message}")]
    NotConfigured {
        /// What was missing.
        message: String,
    },

    /// The requested audience is not in the allow-list.
    #[error("Invalid audience: {audience}")]
    InvalidAudience {
        /// The rejected audience, as supplied by the caller.
        audience: String,
    },

    /// Key material could not be loaded from any configured source.
    #[error("Failed to load key material: {message}")]
    KeyLoad {
        /// Description of the load failure.
        message: String,
    },

    /// RSA key pair generation or persistence failed.
    #[error("Failed to generate key material: {message}")]
    KeyGeneration {
        /// Description of the generation failure.
        message: String,
    },

    /// The cross-process key generation lock could not be acquired in time.
    #[error("Timed out after {waited_ms}ms waiting for key generation lock {}", path.display())]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
        /// How long we waited before giving up.
        waited_ms: u64,
    },

    /// A PEM or JWK public key could not be parsed.
    #[error("Invalid public key: {message}")]
    InvalidPublicKey {
        /// Description of the parse failure.
        message: String,
    },

    /// Configuration is internally inconsistent.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// Filesystem error while reading or persisting key files.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Token signing failed.
    #[error("Token signing failed: {message}")]
    Signing {
        /// Description of the signing failure.
        message: String,
    },

    /// Algorithm not in allowed list.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Why the algorithm was rejected.
        message: String,
    },

    /// Key id is empty, too long, or contains characters outside the allowed set.
    #[error("Invalid key id: {message}")]
    InvalidKid {
        /// Why the key id was rejected.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `NotConfigured` error.
    #[must_use]
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured { message: message.into() }
    }

    /// Creates a new `InvalidAudience` error.
    #[must_use]
    pub fn invalid_audience(audience: impl Into<String>) -> Self {
        Self::InvalidAudience { audience: audience.into() }
    }

    /// Creates a new `KeyLoad` error.
    #[must_use]
    pub fn key_load(message: impl Into<String>) -> Self {
        Self::KeyLoad { message: message.into() }
    }

    /// Creates a new `KeyGeneration` error.
    #[must_use]
    pub fn key_generation(message: impl Into<String>) -> Self {
        Self::KeyGeneration { message: message.into() }
    }

    /// Creates a new `LockTimeout` error.
    #[must_use]
    pub fn lock_timeout(path: impl Into<PathBuf>, waited_ms: u64) -> Self {
        Self::LockTimeout { path: path.into(), waited_ms }
    }

    /// Creates a new `InvalidPublicKey` error.
    #[must_use]
    pub fn invalid_public_key(message: impl Into<String>) -> Self {
        Self::InvalidPublicKey { message: message.into() }
    }

    /// Creates a new `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Creates a new `Io` error for the given path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Creates a new `Signing` error.
    #[must_use]
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing { message: message.into() }
    }

    /// Creates a new `UnsupportedAlgorithm` error.
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates a new `InvalidKid` error.
    #[must_use]
    pub fn invalid_kid(message: impl Into<String>) -> Self {
        Self::InvalidKid { message: message.into() }
    }

    /// Returns `true` for failures that mean "no usable key material",
    /// which callers should surface as a service-unavailable condition.
    #[must_use]
    pub fn is_not_configured(&self) -> bool {
        matches!(self, Self::NotConfigured { .. })
    }
}

/// Result type alias for key store and minting operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Machine-readable reason a token failed verification.
///
/// Serialized in snake_case; these strings are part of the verify endpoint's
/// response contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationErrorCode {
    /// Token is not a well-formed RS256 JWT.
    InvalidTokenFormat,
    /// Header has no `kid`.
    MissingKid,
    /// `kid` is not present in the verifier's key store.
    UnknownKey,
    /// Verifier has no keys at all.
    IdpNotConfigured,
    /// `exp` is in the past.
    TokenExpired,
    /// Token was minted for a different audience.
    AudienceMismatch,
    /// Signature does not verify against the key named by `kid`.
    InvalidSignature,
    /// `iss` is not this issuer.
    InvalidIssuer,
}

impl VerificationErrorCode {
    /// Returns the wire representation of this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTokenFormat => "invalid_token_format",
            Self::MissingKid => "missing_kid",
            Self::UnknownKey => "unknown_key",
            Self::IdpNotConfigured => "idp_not_configured",
            Self::TokenExpired => "token_expired",
            Self::AudienceMismatch => "audience_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidIssuer => "invalid_issuer",
        }
    }
}

impl fmt::Display for VerificationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected token: an error code plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct VerificationError {
    /// Machine-readable rejection reason.
    pub code: VerificationErrorCode,
    /// Human-readable detail, safe to return to the caller.
    pub message: String,
}

impl VerificationError {
    /// Creates a verification error with the given code and message.
    #[must_use]
    pub fn new(code: VerificationErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Creates an `invalid_token_format` rejection.
    #[must_use]
    pub fn invalid_token_format(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorCode::InvalidTokenFormat, message)
    }

    /// Creates a `missing_kid` rejection.
    #[must_use]
    pub fn missing_kid() -> Self {
        Self::new(VerificationErrorCode::MissingKid, "Token header is missing 'kid'")
    }

    /// Creates an `unknown_key` rejection.
    #[must_use]
    pub fn unknown_key(kid: &str) -> Self {
        Self::new(VerificationErrorCode::UnknownKey, format!("Unknown signing key '{kid}'"))
    }

    /// Creates an `idp_not_configured` rejection.
    #[must_use]
    pub fn idp_not_configured() -> Self {
        Self::new(
            VerificationErrorCode::IdpNotConfigured,
            "Identity provider has no verification keys",
        )
    }

    /// Creates a `token_expired` rejection.
    #[must_use]
    pub fn token_expired() -> Self {
        Self::new(VerificationErrorCode::TokenExpired, "Token has expired")
    }

    /// Creates an `audience_mismatch` rejection.
    #[must_use]
    pub fn audience_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            VerificationErrorCode::AudienceMismatch,
            format!("Token audience '{actual}' does not match '{expected}'"),
        )
    }

    /// Creates an `invalid_signature` rejection.
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::new(VerificationErrorCode::InvalidSignature, "Token signature is invalid")
    }

    /// Creates an `invalid_issuer` rejection.
    #[must_use]
    pub fn invalid_issuer() -> Self {
        Self::new(VerificationErrorCode::InvalidIssuer, "Token issuer is not trusted")
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::token_expired(),
            ErrorKind::InvalidSignature => Self::invalid_signature(),
            ErrorKind::InvalidIssuer => Self::invalid_issuer(),
            ErrorKind::InvalidAlgorithm => {
                Self::invalid_token_format("Token algorithm does not match the signing key")
            },
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::invalid_token_format(format!("Missing required claim '{claim}'"))
            },
            _ => Self::invalid_token_format(format!("Malformed token: {err}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuthError::invalid_audience("unknown-service");
        assert_eq!(err.to_string(), "Invalid audience: unknown-service");

        let err = AuthError::not_configured("no private key");
        assert_eq!(err.to_string(), "Identity provider not configured: no private key");

        let err = AuthError::lock_timeout("/tmp/keys/idp.lock", 10_000);
        assert_eq!(
            err.to_string(),
            "Timed out after 10000ms waiting for key generation lock /tmp/keys/idp.lock"
        );
    }

    #[test]
    fn test_is_not_configured() {
        assert!(AuthError::not_configured("x").is_not_configured());
        assert!(!AuthError::invalid_audience("x").is_not_configured());
    }

    #[test]
    fn test_io_error_preserves_source_chain() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = AuthError::io("/keys/private.pem", io);

        let source = err.source().expect("source exists");
        assert_eq!(source.to_string(), "denied");
    }

    #[test]
    fn test_verification_code_wire_format() {
        let json = serde_json::to_string(&VerificationErrorCode::AudienceMismatch).unwrap();
        assert_eq!(json, "\"audience_mismatch\"");

        let code: VerificationErrorCode = serde_json::from_str("\"idp_not_configured\"").unwrap();
        assert_eq!(code, VerificationErrorCode::IdpNotConfigured);
        assert_eq!(code.as_str(), "idp_not_configured");
    }

    #[test]
    fn test_verification_error_from_jsonwebtoken() {
        use jsonwebtoken::errors::{Error, ErrorKind};

        let err: VerificationError = Error::from(ErrorKind::ExpiredSignature).into();
        assert_eq!(err.code, VerificationErrorCode::TokenExpired);

        let err: VerificationError = Error::from(ErrorKind::InvalidSignature).into();
        assert_eq!(err.code, VerificationErrorCode::InvalidSignature);

        let err: VerificationError = Error::from(ErrorKind::InvalidIssuer).into();
        assert_eq!(err.code, VerificationErrorCode::InvalidIssuer);

        let err: VerificationError = Error::from(ErrorKind::InvalidToken).into();
        assert_eq!(err.code, VerificationErrorCode::InvalidTokenFormat);
    }
}
