//! JSON Web Key Set types.
//!
//! Public RSA keys are published as `{kty, kid, use, alg, n, e}` records with
//! the modulus and exponent encoded as unsigned big-endian integers in
//! base64url without padding (RFC 7518 §6.3.1).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::DecodingKey;
use rsa::{BigUint, RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Intended use of a published key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUse {
    /// Signature verification.
    Sig,
}

/// A single RSA public key in JWK form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; always `RSA`.
    pub kty: String,
    /// Key id matching the `kid` header of tokens signed with this key.
    pub kid: String,
    /// Key use; always `sig`.
    #[serde(rename = "use")]
    pub key_use: KeyUse,
    /// Signature algorithm; always `RS256`.
    pub alg: String,
    /// Modulus, base64url big-endian.
    pub n: String,
    /// Public exponent, base64url big-endian.
    pub e: String,
}

impl Jwk {
    /// Builds the JWK for an RSA public key.
    #[must_use]
    pub fn from_rsa_public_key(kid: impl Into<String>, key: &RsaPublicKey) -> Self {
        Self {
            kty: "RSA".to_owned(),
            kid: kid.into(),
            key_use: KeyUse::Sig,
            alg: "RS256".to_owned(),
            n: encode_biguint(key.n()),
            e: encode_biguint(key.e()),
        }
    }

    /// Reconstructs the RSA public key from `n` and `e`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPublicKey`] if the key type is not RSA, the
    /// components are not valid base64url, or they do not form a valid key.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, AuthError> {
        if self.kty != "RSA" {
            return Err(AuthError::invalid_public_key(format!(
                "expected kty 'RSA', got '{}'",
                self.kty
            )));
        }
        let n = decode_biguint(&self.n, "n")?;
        let e = decode_biguint(&self.e, "e")?;
        RsaPublicKey::new(n, e).map_err(|e| AuthError::invalid_public_key(e.to_string()))
    }

    /// Returns a jsonwebtoken decoding key for this JWK.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidPublicKey`] if the components are rejected.
    pub fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        DecodingKey::from_rsa_components(&self.n, &self.e)
            .map_err(|e| AuthError::invalid_public_key(e.to_string()))
    }
}

/// Published key set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    /// Every currently valid verification key.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Finds a key by id.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// Computes the RFC 7638 JWK thumbprint of an RSA public key.
///
/// The thumbprint is SHA-256 over the canonical JSON
/// `{"e":..,"kty":"RSA","n":..}` (members in lexicographic order, no
/// whitespace), base64url-encoded. Every process holding the same key derives
/// the same value, which makes it a stable default key id.
#[must_use]
pub fn jwk_thumbprint(key: &RsaPublicKey) -> String {
    let canonical = format!(
        r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
        encode_biguint(key.e()),
        encode_biguint(key.n())
    );
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

fn encode_biguint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_biguint(value: &str, field: &str) -> Result<BigUint, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.as_bytes())
        .map_err(|e| AuthError::invalid_public_key(format!("{field}: base64 decode: {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}
