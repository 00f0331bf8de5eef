//! Tunnel error types.
//!
//! Every failure carries a stable machine-readable [`code`](TunnelError::code)
//! so callers and operators can tell apart "Space unregistered"
//! (`ENCRYPTION_KEY_MISSING`), "Space unreachable" (`ENCRYPTION_KEY_FETCH_FAILED`,
//! `BUS_ERROR`), "tampered or rotated key" (`DECRYPTION_FAILED`) and "slow Space"
//! (`TIMEOUT`).

use std::time::Duration;

use thiserror::Error;

/// Errors from the tunnel transport.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// The Space's public key could not be fetched (network, server error,
    /// or a malformed key).
    #[error("Failed to fetch encryption key for space '{username}': {message}")]
    EncryptionKeyFetchFailed {
        /// Target Space.
        username: String,
        /// Description of the fetch failure.
        message: String,
    },

    /// The Space has no registered encryption key.
    #[error("Space '{username}' has no registered encryption key")]
    EncryptionKeyMissing {
        /// Target Space.
        username: String,
    },

    /// No reply arrived within the request timeout.
    #[error("Space '{username}' did not reply within {timeout_ms}ms")]
    Timeout {
        /// Target Space.
        username: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The reply failed authentication or could not be decrypted.
    ///
    /// The cached key for the Space has been evicted; one retry (which
    /// refetches the key) is reasonable.
    #[error("Failed to decrypt reply from space '{username}': {message}")]
    DecryptionFailed {
        /// Target Space.
        username: String,
        /// Description of the failure.
        message: String,
    },

    /// The reply lacks encryption fields or speaks another protocol version.
    #[error("Incompatible reply from space '{username}': {message}")]
    IncompatibleResponse {
        /// Target Space.
        username: String,
        /// What was missing or unexpected.
        message: String,
    },

    /// The Space answered with an error status.
    #[error("Space '{username}' returned {code}: {message}")]
    RemoteError {
        /// Target Space.
        username: String,
        /// Error code reported by the Space.
        code: String,
        /// Error message reported by the Space.
        message: String,
    },

    /// The request payload could not be encrypted.
    #[error("Failed to encrypt request: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// The target name cannot be used as a bus subject token.
    #[error("Invalid tunnel target: {message}")]
    InvalidTarget {
        /// Why the target was rejected.
        message: String,
    },

    /// Message bus connection, subscription, or publish failure.
    #[error("Message bus error: {message}")]
    Bus {
        /// Description of the bus failure.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid tunnel configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },
}

impl TunnelError {
    /// Creates a new `EncryptionKeyFetchFailed` error.
    #[must_use]
    pub fn key_fetch_failed(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EncryptionKeyFetchFailed { username: username.into(), message: message.into() }
    }

    /// Creates a new `EncryptionKeyMissing` error.
    #[must_use]
    pub fn key_missing(username: impl Into<String>) -> Self {
        Self::EncryptionKeyMissing { username: username.into() }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(username: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            username: username.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a new `DecryptionFailed` error.
    #[must_use]
    pub fn decryption_failed(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecryptionFailed { username: username.into(), message: message.into() }
    }

    /// Creates a new `IncompatibleResponse` error.
    #[must_use]
    pub fn incompatible_response(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IncompatibleResponse { username: username.into(), message: message.into() }
    }

    /// Creates a new `RemoteError` error.
    #[must_use]
    pub fn remote(
        username: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteError { username: username.into(), code: code.into(), message: message.into() }
    }

    /// Creates a new `EncryptionFailed` error.
    #[must_use]
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed { message: message.into() }
    }

    /// Creates a new `InvalidTarget` error.
    #[must_use]
    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget { message: message.into() }
    }

    /// Creates a new `Bus` error.
    #[must_use]
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus { message: message.into() }
    }

    /// Creates a new `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EncryptionKeyFetchFailed { .. } => "ENCRYPTION_KEY_FETCH_FAILED",
            Self::EncryptionKeyMissing { .. } => "ENCRYPTION_KEY_MISSING",
            Self::Timeout { .. } => "TIMEOUT",
            Self::DecryptionFailed { .. } => "DECRYPTION_FAILED",
            Self::IncompatibleResponse { .. } => "INCOMPATIBLE_RESPONSE",
            Self::RemoteError { .. } => "REMOTE_ERROR",
            Self::EncryptionFailed { .. } => "ENCRYPTION_FAILED",
            Self::InvalidTarget { .. } => "INVALID_TARGET",
            Self::Bus { .. } => "BUS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// Returns `true` if repeating the call may succeed.
    ///
    /// A decryption failure has already evicted the cached key, so a retry
    /// fetches a fresh one. Key fetch failures are transient by definition;
    /// a missing key is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. } | Self::EncryptionKeyFetchFailed { .. })
    }

    /// Returns `true` for [`TunnelError::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TunnelError::key_fetch_failed("alice", "503"), "ENCRYPTION_KEY_FETCH_FAILED", true)]
    #[case(TunnelError::key_missing("alice"), "ENCRYPTION_KEY_MISSING", false)]
    #[case(TunnelError::timeout("alice", Duration::from_millis(100)), "TIMEOUT", false)]
    #[case(TunnelError::decryption_failed("alice", "tag"), "DECRYPTION_FAILED", true)]
    #[case(
        TunnelError::incompatible_response("alice", "no payload"),
        "INCOMPATIBLE_RESPONSE",
        false
    )]
    #[case(TunnelError::remote("alice", "NOT_FOUND", "no such endpoint"), "REMOTE_ERROR", false)]
    #[case(TunnelError::bus("disconnected"), "BUS_ERROR", false)]
    fn test_codes_and_retryability(
        #[case] err: TunnelError,
        #[case] code: &str,
        #[case] retryable: bool,
    ) {
        assert_eq!(err.code(), code);
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn test_timeout_display() {
        let err = TunnelError::timeout("alice", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Space 'alice' did not reply within 250ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_serde_error_converts() {
        let err: TunnelError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
