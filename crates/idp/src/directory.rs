//! Caller authentication and user lookup, provided by the host application.

use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};

/// An authenticated end user asking for a satellite token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Hub user id, placed in `sub`.
    pub id: String,
    /// Hub role, placed in `role`.
    pub role: String,
}

/// Profile fields returned alongside a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// Email address.
    pub email: String,
    /// Username.
    pub username: String,
}

/// Resolves bearer credentials and user profiles.
///
/// The identity provider never stores users itself; the hub's user and
/// service registry implements this trait.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Returns the user owning `bearer`, or `None` if it is not a valid
    /// user credential.
    async fn authenticate_user(&self, bearer: &str) -> Option<UserIdentity>;

    /// Returns the audience a calling service is registered as, or `None`
    /// if `bearer` is not a valid service credential.
    async fn authenticate_service(&self, bearer: &str) -> Option<String>;

    /// Looks up the profile of a verified token's subject.
    async fn lookup_user(&self, subject: &str) -> Option<UserProfile>;
}

/// Extracts the credential from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::standard("Bearer abc", Some("abc"))]
    #[case::lowercase("bearer abc", Some("abc"))]
    #[case::padded("Bearer   abc  ", Some("abc"))]
    #[case::basic("Basic abc", None)]
    #[case::empty("Bearer ", None)]
    #[case::no_scheme("abc", None)]
    fn test_bearer_token(#[case] header: &str, #[case] expected: Option<&str>) {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(header).unwrap());
        assert_eq!(bearer_token(&headers), expected);
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
