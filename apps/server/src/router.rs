use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the application router with all middleware and routes.
pub fn build_router(state: AppState) -> axum::Router {
    // Discovery, JWKS, token, and userinfo are called cross-origin by
    // browser-based relying parties.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    axum::Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(handlers::discovery::configuration),
        )
        .route("/keys", get(handlers::discovery::jwks))
        .route(
            "/auth",
            get(handlers::authorize::authorize).post(handlers::authorize::authorize_post),
        )
        .route("/auth/{connector}", get(handlers::authorize::connector_login))
        .route(
            "/auth/{connector}/login",
            post(handlers::authorize::password_login),
        )
        .route("/callback", get(handlers::authorize::callback))
        .route(
            "/approval",
            get(handlers::authorize::approval).post(handlers::authorize::approval_post),
        )
        .route("/token", post(handlers::token::token))
        .route(
            "/device",
            get(handlers::device::verification_page).post(handlers::device::device_authorization),
        )
        .route("/device/auth", post(handlers::device::verify_user_code))
        // Legacy polling location; the same grant also works at /token.
        .route("/device/token", post(handlers::token::token))
        .route("/device/callback", get(handlers::device::device_callback))
        .route("/userinfo", get(handlers::userinfo::userinfo))
        .route("/health/live", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn request_id_middleware(
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("request_id", request_id.as_str());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
