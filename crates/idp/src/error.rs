//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use syfthub_authn::AuthError;
use thiserror::Error;

/// Errors returned by the identity provider endpoints.
///
/// Each maps to one status code and a `{error, message}` JSON body.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Missing or unrecognized bearer credential.
    #[error("Authentication required")]
    Unauthorized,

    /// The `aud` query parameter is absent.
    #[error("Query parameter 'aud' is required")]
    MissingAudience,

    /// The audience is not in the allow-list.
    #[error("Audience '{0}' is not allowed")]
    InvalidAudience(String),

    /// The key store has no keys.
    #[error("Identity provider is not configured: {0}")]
    NotConfigured(String),

    /// Unexpected failure while signing.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MissingAudience => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidAudience(_) => StatusCode::BAD_REQUEST,
            Self::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code placed in the `error` field.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::MissingAudience => "missing_audience",
            Self::InvalidAudience(_) => "invalid_audience",
            Self::NotConfigured(_) => "idp_not_configured",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidAudience { audience } => Self::InvalidAudience(audience),
            AuthError::NotConfigured { message } => Self::NotConfigured(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody { error: self.code(), message: self.to_string() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ApiError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized")]
    #[case(ApiError::MissingAudience, StatusCode::UNPROCESSABLE_ENTITY, "missing_audience")]
    #[case(ApiError::InvalidAudience("x".into()), StatusCode::BAD_REQUEST, "invalid_audience")]
    #[case(
        ApiError::NotConfigured("no keys".into()),
        StatusCode::SERVICE_UNAVAILABLE,
        "idp_not_configured"
    )]
    fn test_status_and_code(#[case] err: ApiError, #[case] status: StatusCode, #[case] code: &str) {
        assert_eq!(err.status(), status);
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_auth_error_mapping() {
        assert!(matches!(
            ApiError::from(AuthError::invalid_audience("evil")),
            ApiError::InvalidAudience(a) if a == "evil"
        ));
        assert!(matches!(
            ApiError::from(AuthError::not_configured("no key")),
            ApiError::NotConfigured(_)
        ));
        assert!(matches!(ApiError::from(AuthError::signing("boom")), ApiError::Internal(_)));
    }
}
