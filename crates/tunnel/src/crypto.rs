//! End-to-end envelope encryption.
//!
//! Every request uses a fresh X25519 key pair. The ECDH secret between that
//! ephemeral key and the Space's long-term key is expanded with HKDF-SHA256
//! into one AES-256-GCM key per direction. The correlation id is mixed into
//! the HKDF info and used as AEAD associated data, so a reply sealed for one
//! request cannot be substituted for another.
//!
//! ```text
//! key(direction) = HKDF-SHA256(salt = "syfthub-tunnel/v1",
//!                              ikm  = X25519(ephemeral, space),
//!                              info = "{direction}:{correlation_id}")
//! ```

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::STANDARD},
};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, ReusableSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::protocol::{EncryptionInfo, PROTOCOL_VERSION, TunnelRequest};

/// Algorithm identifier carried in [`EncryptionInfo::algorithm`].
pub const ALGORITHM: &str = "X25519-ECDH-AES-256-GCM";

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const REQUEST_DIRECTION: &str = "request";
const RESPONSE_DIRECTION: &str = "response";

/// base64url without padding on output; padded input is accepted.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors from envelope encryption and decryption.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// A public key was not 32 bytes of valid base64url.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// The ECDH output was all zeroes (low-order peer key).
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    /// Unknown algorithm or an envelope bound to a different ephemeral key.
    #[error("envelope mismatch: {0}")]
    Mismatch(String),

    /// Nonce or ciphertext was not valid base64, or had the wrong length.
    #[error("malformed envelope: {0}")]
    Encoding(String),

    /// AEAD authentication failed (wrong key, tampered data, or wrong
    /// correlation id).
    #[error("authentication tag mismatch")]
    Aead,
}

impl CryptoError {
    /// Returns `true` for an authentication tag failure.
    #[must_use]
    pub fn is_tag_mismatch(&self) -> bool {
        matches!(self, Self::Aead)
    }
}

/// A Space's long-term X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpacePublicKey(PublicKey);

impl SpacePublicKey {
    /// Decodes a base64url (padded or not) 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if decoding fails or the length is
    /// not 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        decode_public_key(encoded.trim()).map(Self)
    }

    /// Encodes the key as base64url without padding.
    #[must_use]
    pub fn to_base64(&self) -> String {
        URL_SAFE_LENIENT.encode(self.0.as_bytes())
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for SpacePublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl std::fmt::Debug for SpacePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SpacePublicKey").field(&self.to_base64()).finish()
    }
}

/// Per-call encryption context held by the caller awaiting the reply.
///
/// The ephemeral private key never leaves this value and is dropped with it.
pub struct RequestCipher {
    secret: ReusableSecret,
    ephemeral_public: PublicKey,
    space_public: PublicKey,
    correlation_id: String,
}

impl RequestCipher {
    /// Generates a fresh ephemeral key pair for one request.
    #[must_use]
    pub fn new(space_key: &SpacePublicKey, correlation_id: impl Into<String>) -> Self {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&secret);
        Self {
            secret,
            ephemeral_public,
            space_public: space_key.0,
            correlation_id: correlation_id.into(),
        }
    }

    /// Correlation id this context is bound to.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Base64url ephemeral public key sent with the request.
    #[must_use]
    pub fn ephemeral_public_key(&self) -> String {
        URL_SAFE_LENIENT.encode(self.ephemeral_public.as_bytes())
    }

    /// Encrypts the request payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonContributory`] if the Space key is a
    /// low-order point.
    pub fn encrypt_request(
        &self,
        plaintext: &[u8],
    ) -> Result<(EncryptionInfo, String), CryptoError> {
        let key = self.derive(REQUEST_DIRECTION)?;
        let (nonce, ciphertext) = seal(&key, self.correlation_id.as_bytes(), plaintext)?;
        Ok((self.info(&nonce), STANDARD.encode(ciphertext)))
    }

    /// Decrypts the Space's reply.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Mismatch`] if the reply names another algorithm or
    ///   another ephemeral key
    /// - [`CryptoError::Encoding`] for malformed nonce or ciphertext
    /// - [`CryptoError::Aead`] if authentication fails
    pub fn decrypt_response(
        &self,
        info: &EncryptionInfo,
        encrypted_payload: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        check_algorithm(info)?;
        let echoed = decode_public_key(&info.ephemeral_public_key)
            .map_err(|e| CryptoError::Mismatch(format!("reply ephemeral key: {e}")))?;
        if echoed.as_bytes() != self.ephemeral_public.as_bytes() {
            return Err(CryptoError::Mismatch("reply is bound to a different ephemeral key".into()));
        }
        let key = self.derive(RESPONSE_DIRECTION)?;
        open(&key, self.correlation_id.as_bytes(), &info.nonce, encrypted_payload)
    }

    fn derive(&self, direction: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&self.space_public);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        derive_key(shared.as_bytes(), direction, &self.correlation_id)
    }

    fn info(&self, nonce: &[u8; NONCE_LEN]) -> EncryptionInfo {
        EncryptionInfo {
            algorithm: ALGORITHM.to_owned(),
            ephemeral_public_key: self.ephemeral_public_key(),
            nonce: STANDARD.encode(nonce),
        }
    }
}

impl std::fmt::Debug for RequestCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCipher")
            .field("correlation_id", &self.correlation_id)
            .field("ephemeral_public_key", &self.ephemeral_public_key())
            .finish_non_exhaustive()
    }
}

/// Space-side key pair able to open requests and seal replies.
pub struct SpaceCipher {
    secret: StaticSecret,
    public: PublicKey,
}

impl SpaceCipher {
    /// Generates a new long-term key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restores a key pair from its 32 private key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, as published through the backend.
    #[must_use]
    pub fn public_key(&self) -> SpacePublicKey {
        SpacePublicKey(self.public)
    }

    /// Decrypts a request and returns a sealer bound to it for the reply.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RequestCipher::decrypt_response`].
    pub fn open_request(
        &self,
        request: &TunnelRequest,
    ) -> Result<(Zeroizing<Vec<u8>>, ResponseSealer), CryptoError> {
        let info = &request.encryption_info;
        check_algorithm(info)?;
        let ephemeral = decode_public_key(&info.ephemeral_public_key)?;
        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        let cid = &request.correlation_id;
        let request_key = derive_key(shared.as_bytes(), REQUEST_DIRECTION, cid)?;
        let plaintext =
            open(&request_key, cid.as_bytes(), &info.nonce, &request.encrypted_payload)?;

        let sealer = ResponseSealer {
            key: derive_key(shared.as_bytes(), RESPONSE_DIRECTION, cid)?,
            ephemeral_public_key: info.ephemeral_public_key.clone(),
            correlation_id: cid.clone(),
        };
        Ok((plaintext, sealer))
    }
}

impl std::fmt::Debug for SpaceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceCipher")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Seals the reply to one opened request.
pub struct ResponseSealer {
    key: Zeroizing<[u8; 32]>,
    ephemeral_public_key: String,
    correlation_id: String,
}

impl ResponseSealer {
    /// Correlation id of the request being answered.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Encrypts the reply payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Aead`] if the cipher rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(EncryptionInfo, String), CryptoError> {
        let (nonce, ciphertext) = seal(&self.key, self.correlation_id.as_bytes(), plaintext)?;
        let info = EncryptionInfo {
            algorithm: ALGORITHM.to_owned(),
            ephemeral_public_key: self.ephemeral_public_key.clone(),
            nonce: STANDARD.encode(nonce),
        };
        Ok((info, STANDARD.encode(ciphertext)))
    }
}

impl std::fmt::Debug for ResponseSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSealer")
            .field("correlation_id", &self.correlation_id)
            .field("ephemeral_public_key", &self.ephemeral_public_key)
            .finish_non_exhaustive()
    }
}

fn derive_key(
    shared: &[u8; 32],
    direction: &str,
    correlation_id: &str,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(PROTOCOL_VERSION.as_bytes()), shared);
    let info = format!("{direction}:{correlation_id}");
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info.as_bytes(), &mut okm[..])
        .map_err(|e| CryptoError::Encoding(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

fn seal(
    key: &[u8; 32],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let aead = Aes256Gcm::new(key.into());
    let ciphertext = aead
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Aead)?;
    Ok((nonce, ciphertext))
}

fn open(
    key: &[u8; 32],
    aad: &[u8],
    nonce_b64: &str,
    ciphertext_b64: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce = STANDARD
        .decode(nonce_b64)
        .map_err(|e| CryptoError::Encoding(format!("nonce: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Encoding(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::Encoding(format!("ciphertext: {e}")))?;

    let aead = Aes256Gcm::new(key.into());
    let plaintext = aead
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad })
        .map_err(|_| CryptoError::Aead)?;
    Ok(Zeroizing::new(plaintext))
}

fn check_algorithm(info: &EncryptionInfo) -> Result<(), CryptoError> {
    if info.algorithm != ALGORITHM {
        return Err(CryptoError::Mismatch(format!("unsupported algorithm '{}'", info.algorithm)));
    }
    Ok(())
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = URL_SAFE_LENIENT
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
    })?;
    Ok(PublicKey::from(bytes))
}
