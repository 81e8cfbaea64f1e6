//! Error mapping from internal failures onto the OAuth2/OIDC wire contract.
//!
//! Internal error strings never reach `error_description`; anything
//! unexpected collapses to a bare `server_error` after being logged.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use oxidp_shared::api::token::TokenErrorResponse;
use oxidp_shared::oauth::ErrorCode;

use crate::connectors::ConnectorError;
use crate::keys::KeyError;
use crate::storage::StorageError;

/// A protocol-level failure: the RFC error code plus an optional
/// client-safe description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthError {
    pub code: ErrorCode,
    pub description: Option<String>,
}

impl OAuthError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    pub fn code(code: ErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }

    pub fn server_error() -> Self {
        Self::code(ErrorCode::ServerError)
    }
}

impl From<StorageError> for OAuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(detail) => {
                tracing::warn!(error = %detail, "storage unavailable");
                OAuthError::code(ErrorCode::TemporarilyUnavailable)
            }
            // A NotFound that was not handled at the call site is a logic
            // failure, not a client error.
            other => {
                tracing::error!(error = %other, "unexpected storage error");
                OAuthError::server_error()
            }
        }
    }
}

impl From<KeyError> for OAuthError {
    fn from(err: KeyError) -> Self {
        tracing::error!(error = %err, "signing key failure");
        OAuthError::server_error()
    }
}

impl From<ConnectorError> for OAuthError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Retryable(detail) => {
                tracing::warn!(error = %detail, "connector upstream unavailable");
                OAuthError::code(ErrorCode::TemporarilyUnavailable)
            }
            ConnectorError::Denied(detail) => {
                tracing::info!(reason = %detail, "connector denied access");
                OAuthError::code(ErrorCode::AccessDenied)
            }
        }
    }
}

/// Token endpoint failure response: the JSON `{error, error_description?}`
/// body with the status mandated by RFC 6749 §5.2.
#[derive(Debug)]
pub struct TokenEndpointError(pub OAuthError);

impl<E: Into<OAuthError>> From<E> for TokenEndpointError {
    fn from(err: E) -> Self {
        TokenEndpointError(err.into())
    }
}

impl IntoResponse for TokenEndpointError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = TokenErrorResponse {
            error: self.0.code,
            error_description: self.0.description,
        };
        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
            .headers_mut()
            .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"oxidp\""),
            );
        }
        response
    }
}

/// 302 redirect, the status the authorization response contract specifies.
/// (`axum::response::Redirect` only offers 303/307/308.)
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Redirect an authorization failure back to the (already validated)
/// redirect URI with `error`, `error_description` and `state` attached in
/// the query or fragment as the response mode demands.
pub fn redirect_with_error(
    redirect_uri: &str,
    state: &str,
    err: &OAuthError,
    fragment: bool,
) -> Response {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("error", err.code.as_str());
    if let Some(description) = &err.description {
        params.append_pair("error_description", description);
    }
    if !state.is_empty() {
        params.append_pair("state", state);
    }
    let params = params.finish();

    let separator = if fragment {
        "#"
    } else if redirect_uri.contains('?') {
        "&"
    } else {
        "?"
    };
    found(&format!("{redirect_uri}{separator}{params}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_client_maps_to_401_with_challenge() {
        let response =
            TokenEndpointError(OAuthError::code(ErrorCode::InvalidClient)).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn invalid_grant_maps_to_400() {
        let response =
            TokenEndpointError(OAuthError::code(ErrorCode::InvalidGrant)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn server_error_maps_to_500() {
        let response = TokenEndpointError(OAuthError::server_error()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn token_errors_are_never_cacheable() {
        let response =
            TokenEndpointError(OAuthError::code(ErrorCode::InvalidGrant)).into_response();
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }

    #[tokio::test]
    async fn token_error_body_is_protocol_shaped() {
        let response = TokenEndpointError(OAuthError::new(
            ErrorCode::InvalidScope,
            "scope not granted",
        ))
        .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid_scope");
        assert_eq!(json["error_description"], "scope not granted");
    }

    #[test]
    fn storage_io_maps_to_temporarily_unavailable() {
        let err: OAuthError = StorageError::Io("connection refused".into()).into();
        assert_eq!(err.code, ErrorCode::TemporarilyUnavailable);
        assert!(err.description.is_none());
    }

    #[test]
    fn internal_details_never_reach_descriptions() {
        let err: OAuthError = StorageError::Io("password=hunter2 leaked".into()).into();
        assert!(err.description.is_none());
        let err: OAuthError = KeyError::Signing("pem parse failed".into()).into();
        assert!(err.description.is_none());
    }

    #[test]
    fn connector_errors_map_per_taxonomy() {
        let retryable: OAuthError = ConnectorError::Retryable("upstream 503".into()).into();
        assert_eq!(retryable.code, ErrorCode::TemporarilyUnavailable);
        let denied: OAuthError = ConnectorError::Denied("bad user".into()).into();
        assert_eq!(denied.code, ErrorCode::AccessDenied);
    }

    #[test]
    fn redirect_with_error_uses_query_for_code_flow() {
        let response = redirect_with_error(
            "https://rp.example/cb",
            "xyz",
            &OAuthError::code(ErrorCode::AccessDenied),
            false,
        );
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers().get(header::LOCATION).unwrap();
        assert_eq!(
            location.to_str().unwrap(),
            "https://rp.example/cb?error=access_denied&state=xyz"
        );
    }

    #[test]
    fn redirect_with_error_uses_fragment_for_implicit_flow() {
        let response = redirect_with_error(
            "https://rp.example/cb",
            "xyz",
            &OAuthError::code(ErrorCode::AccessDenied),
            true,
        );
        let location = response.headers().get(header::LOCATION).unwrap();
        assert_eq!(
            location.to_str().unwrap(),
            "https://rp.example/cb#error=access_denied&state=xyz"
        );
    }
}
