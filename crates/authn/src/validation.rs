//! Header and audience validation.
//!
//! Checks that run before any key lookup or signature verification:
//! algorithm policy, `kid` shape, and audience normalization.
//!
//! Key ids this store assigns are held to [`validate_kid`]. A `kid` presented
//! in a token header is only held to [`validate_presented_kid`], so a
//! printable id from another issuer is reported as unknown rather than
//! malformed.
//!
//! # Security
//!
//! - Strict algorithm checks prevent algorithm substitution attacks
//! - Only RS256 is accepted; symmetric algorithms and "none" are always rejected
//! - `kid` values are bounded before they are used as map keys or logged

use crate::error::AuthError;

/// Forbidden JWT algorithms that are never accepted.
///
/// - `none`: No signature verification (trivially bypassable)
/// - `HS256`, `HS384`, `HS512`: Symmetric algorithms; a verifier holding only the public JWKS
///   could be tricked into using the public modulus as an HMAC secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Accepted JWT algorithms. The key store only holds RSA keys.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["RS256"];

/// Maximum accepted length of a `kid` header value.
pub const MAX_KID_LENGTH: usize = 128;

/// Validate JWT algorithm against security policies.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if the algorithm is forbidden
/// or not in [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use syfthub_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("RS256").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("EdDSA").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not in accepted list (only RS256 is supported)"
        )));
    }

    Ok(())
}

/// Validate the shape of a `kid` header value.
///
/// Key ids are URL-safe identifiers: ASCII alphanumerics plus `-`, `_`, `.`
/// and `:`, at most [`MAX_KID_LENGTH`] bytes. JWK thumbprints (base64url)
/// satisfy this.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKid`] if the value is empty, too long, or
/// contains a character outside the allowed set.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::invalid_kid("kid is empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::invalid_kid(format!(
            "kid is {} bytes, maximum is {MAX_KID_LENGTH}",
            kid.len()
        )));
    }
    if let Some(bad) =
        kid.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(AuthError::invalid_kid(format!("kid contains disallowed character {bad:?}")));
    }
    Ok(())
}

/// Validate a `kid` taken from a token header before it is used for lookup.
///
/// Only emptiness, length, and control characters are rejected. Any other
/// value is safe to look up and simply will not match if this store did not
/// assign it.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKid`] if the value is empty, longer than
/// [`MAX_KID_LENGTH`], or contains a control character.
pub fn validate_presented_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::invalid_kid("kid is empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::invalid_kid(format!(
            "kid is {} bytes, maximum is {MAX_KID_LENGTH}",
            kid.len()
        )));
    }
    if let Some(bad) = kid.chars().find(|c| c.is_control()) {
        return Err(AuthError::invalid_kid(format!("kid contains control character {bad:?}")));
    }
    Ok(())
}

/// Normalize an audience identifier for comparison: trim surrounding
/// whitespace and lowercase.
#[must_use]
pub fn normalize_audience(audience: &str) -> String {
    audience.trim().to_lowercase()
}
