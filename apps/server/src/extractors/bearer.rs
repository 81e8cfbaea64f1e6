use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::state::AppState;
use crate::tokens::AccessTokenClaims;

/// Claims of a valid bearer access token, verified against the published
/// key set. Use as a handler parameter to require a bearer token:
/// ```ignore
/// async fn userinfo(token: BearerToken) -> impl IntoResponse { ... }
/// ```
#[derive(Debug)]
pub struct BearerToken(pub AccessTokenClaims);

#[derive(Debug)]
pub struct BearerRejection;

impl IntoResponse for BearerRejection {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid_token" })),
        )
            .into_response();
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer error=\"invalid_token\""),
        );
        response
    }
}

impl FromRequestParts<AppState> for BearerToken {
    type Rejection = BearerRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("bearer: missing or non-ASCII Authorization header");
                BearerRejection
            })?;

        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            tracing::debug!("bearer: Authorization header missing Bearer prefix");
            BearerRejection
        })?;

        let claims: AccessTokenClaims = state.keys.verify(token).await.map_err(|err| {
            tracing::debug!(error = %err, "bearer: token verification failed");
            BearerRejection
        })?;

        if claims.iss != state.config.issuer_base() {
            tracing::debug!(iss = %claims.iss, "bearer: issuer mismatch");
            return Err(BearerRejection);
        }

        Ok(BearerToken(claims))
    }
}
