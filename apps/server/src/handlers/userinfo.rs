use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;

use oxidp_shared::api::userinfo::UserInfoResponse;

use crate::extractors::bearer::BearerToken;

/// GET /userinfo — answers from the validated access token itself; the
/// identity claims were baked into it at issuance, gated by the scopes the
/// token was granted.
pub async fn userinfo(BearerToken(claims): BearerToken) -> Response {
    let body = UserInfoResponse {
        sub: claims.sub,
        name: claims.identity.name,
        preferred_username: claims.identity.preferred_username,
        email: claims.identity.email,
        email_verified: claims.identity.email_verified,
        groups: claims.identity.groups,
    };
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
