//! Discovery document, JWKS, userinfo, and health endpoints.

mod common;

use common::*;

#[tokio::test]
async fn discovery_document_advertises_the_core_surface() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let response = send(&app, get("/.well-known/openid-configuration")).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;

    assert_eq!(body["issuer"], "http://127.0.0.1:5556");
    assert_eq!(body["authorization_endpoint"], "http://127.0.0.1:5556/auth");
    assert_eq!(body["token_endpoint"], "http://127.0.0.1:5556/token");
    assert_eq!(body["jwks_uri"], "http://127.0.0.1:5556/keys");
    assert_eq!(body["userinfo_endpoint"], "http://127.0.0.1:5556/userinfo");
    assert_eq!(
        body["device_authorization_endpoint"],
        "http://127.0.0.1:5556/device"
    );
    assert_eq!(body["subject_types_supported"], serde_json::json!(["public"]));
    assert_eq!(
        body["id_token_signing_alg_values_supported"],
        serde_json::json!(["EdDSA"])
    );
    assert_eq!(
        body["code_challenge_methods_supported"],
        serde_json::json!(["plain", "S256"])
    );

    let scopes = body["scopes_supported"].as_array().unwrap();
    for scope in ["openid", "email", "profile", "groups", "offline_access"] {
        assert!(scopes.iter().any(|s| s == scope), "missing scope {scope}");
    }
    let grants = body["grant_types_supported"].as_array().unwrap();
    for grant in [
        "authorization_code",
        "refresh_token",
        "urn:ietf:params:oauth:grant-type:device_code",
        "urn:ietf:params:oauth:grant-type:token-exchange",
    ] {
        assert!(grants.iter().any(|g| g == grant), "missing grant {grant}");
    }
}

#[tokio::test]
async fn jwks_publishes_signing_key_material() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let response = send(&app, get("/keys")).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;

    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    let key = &keys[0];
    assert_eq!(key["use"], "sig");
    assert_eq!(key["kty"], "OKP");
    assert_eq!(key["alg"], "EdDSA");
    assert_eq!(key["crv"], "Ed25519");
    assert!(key["kid"].as_str().is_some());
    assert!(key["x"].as_str().is_some());
}

async fn obtain_access_token(app: &axum::Router, scope: &str) -> String {
    let (code, _) = run_code_flow(
        app,
        &[
            ("response_type", "code"),
            ("client_id", "client-a"),
            ("redirect_uri", "https://rp.example/cb"),
            ("scope", scope),
            ("state", "xyz"),
        ],
    )
    .await;
    let response = send(
        app,
        form_post_basic(
            "/token",
            "client-a",
            "s",
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", "https://rp.example/cb"),
            ],
        ),
    )
    .await;
    response_json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn userinfo_returns_scope_gated_claims() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let access_token = obtain_access_token(&app, "openid email profile").await;

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/userinfo")
        .header("Authorization", format!("Bearer {access_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;

    assert_eq!(body["sub"], "alice-user-id");
    assert_eq!(body["email"], "alice@example.com");
    assert_eq!(body["email_verified"], true);
    assert_eq!(body["name"], "alice");
}

#[tokio::test]
async fn userinfo_omits_claims_outside_the_granted_scopes() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let access_token = obtain_access_token(&app, "openid").await;

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/userinfo")
        .header("Authorization", format!("Bearer {access_token}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    let body = response_json(response).await;

    assert_eq!(body["sub"], "alice-user-id");
    assert!(body.get("email").is_none());
    assert!(body.get("name").is_none());
}

#[tokio::test]
async fn userinfo_without_a_token_is_unauthorized() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let response = send(&app, get("/userinfo")).await;
    assert_eq!(response.status(), 401);
    assert!(response.headers().contains_key("www-authenticate"));
}

#[tokio::test]
async fn userinfo_rejects_garbage_tokens() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/userinfo")
        .header("Authorization", "Bearer garbage")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let live = send(&app, get("/health/live")).await;
    assert_eq!(live.status(), 200);
    let ready = send(&app, get("/health/ready")).await;
    assert_eq!(ready.status(), 200);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let (app, _state) = build_test_app(BASE_CONFIG).await;
    let response = send(&app, get("/health/live")).await;
    assert!(response.headers().contains_key("x-request-id"));
}
