//! Wire envelopes exchanged with Spaces over the message bus.
//!
//! Requests are published to [`space_subject`] and replies arrive on
//! [`peer_subject`]. Both directions are UTF-8 JSON; the application payload
//! itself only ever travels encrypted inside `encrypted_payload`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

/// Protocol identifier carried in every envelope.
pub const PROTOCOL_VERSION: &str = "syfthub-tunnel/v1";

/// Prefix of the subject a Space listens on for requests.
pub const SPACE_SUBJECT_PREFIX: &str = "syfthub.spaces";

/// Prefix of the per-call reply subject.
pub const PEER_SUBJECT_PREFIX: &str = "syfthub.peer";

/// Maximum length of a Space username used as a subject token.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Request subject for the Space owned by `username`.
#[must_use]
pub fn space_subject(username: &str) -> String {
    format!("{SPACE_SUBJECT_PREFIX}.{username}")
}

/// Reply subject for a peer channel.
#[must_use]
pub fn peer_subject(peer_channel: &str) -> String {
    format!("{PEER_SUBJECT_PREFIX}.{peer_channel}")
}

/// Checks that `username` is safe to embed as a single subject token.
///
/// NATS treats `.` as a token separator and `*`/`>` as wildcards, so a
/// username containing them would publish to the wrong Space (or to many).
///
/// # Errors
///
/// Returns [`TunnelError::InvalidTarget`] for empty, oversized, or
/// non `[A-Za-z0-9_-]` usernames.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(TunnelError::invalid_target("username cannot be empty"));
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(TunnelError::invalid_target(format!(
            "username exceeds {MAX_USERNAME_LENGTH} characters"
        )));
    }
    let allowed = |c: &char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_');
    if let Some(c) = username.chars().find(|c| !allowed(c)) {
        return Err(TunnelError::invalid_target(format!(
            "username contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Hub to Space.
    EndpointRequest,
    /// Space to hub.
    EndpointResponse,
}

/// Kind of endpoint being invoked on the Space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Retrieval endpoint returning documents.
    DataSource,
    /// Generation endpoint returning a chat message.
    Model,
}

/// Endpoint addressed by a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Endpoint slug on the Space.
    pub slug: String,
    /// Endpoint kind.
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
}

/// Parameters needed to decrypt an envelope's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// Always [`ALGORITHM`](crate::crypto::ALGORITHM).
    pub algorithm: String,
    /// Sender's single-use X25519 public key, base64url.
    pub ephemeral_public_key: String,
    /// AES-GCM nonce, standard base64.
    pub nonce: String,
}

/// Request published to `syfthub.spaces.{username}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// Protocol identifier.
    pub protocol: String,
    /// Always [`MessageType::EndpointRequest`].
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Binds this request to exactly one reply.
    pub correlation_id: String,
    /// Peer channel the reply must be published to.
    pub reply_to: String,
    /// Target endpoint.
    pub endpoint: EndpointRef,
    /// How long the hub waits for the reply.
    pub timeout_ms: u64,
    /// Opaque caller token the Space may verify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_token: Option<String>,
    /// Encryption parameters.
    pub encryption_info: EncryptionInfo,
    /// Base64 AES-256-GCM ciphertext of the JSON payload.
    pub encrypted_payload: String,
}

/// Outcome reported by the Space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The endpoint ran; the payload holds its output.
    Success,
    /// The endpoint failed; see [`TunnelResponse::error`].
    Error,
}

/// Error details attached to an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    /// Space-defined error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Reply published by the Space to the peer channel.
///
/// Encryption fields are optional on the wire so that a reply from an older
/// Space still parses and can be reported as incompatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelResponse {
    /// Protocol identifier.
    pub protocol: String,
    /// Always [`MessageType::EndpointResponse`].
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Correlation id echoed from the request.
    pub correlation_id: String,
    /// Outcome.
    pub status: ResponseStatus,
    /// Encryption parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_info: Option<EncryptionInfo>,
    /// Base64 AES-256-GCM ciphertext of the JSON result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    /// Error details when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteErrorBody>,
}

impl TunnelResponse {
    /// Builds an unencrypted error reply.
    #[must_use]
    pub fn error(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_owned(),
            message_type: MessageType::EndpointResponse,
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Error,
            encryption_info: None,
            encrypted_payload: None,
            error: Some(RemoteErrorBody { code: code.into(), message: message.into() }),
        }
    }
}
