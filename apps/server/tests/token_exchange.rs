//! RFC 8693 token exchange through a token-exchange-capable connector.

mod common;

use common::*;

const EXCHANGE_CONFIG: &str = r#"
    issuer = "http://127.0.0.1:5556"
    signing_algorithm = "EdDSA"

    [oauth2]
    password_connector = "mock"

    [[connectors]]
    type = "mock"
    id = "mock"
    name = "Mock upstream"

    [connectors.config]
    user_id = "mock-user-id"
    username = "Kilgore Trout"
    email = "kilgore@kilgore.trout"
    email_verified = true

    [[clients]]
    id = "client-a"
    secret = "s"
    redirect_uris = ["https://rp.example/cb"]
"#;

async fn exchange(app: &axum::Router, params: &[(&str, &str)]) -> axum::response::Response {
    let mut all = vec![(
        "grant_type",
        "urn:ietf:params:oauth:grant-type:token-exchange",
    )];
    all.extend_from_slice(params);
    send(app, form_post_basic("/token", "client-a", "s", &all)).await
}

#[tokio::test]
async fn subject_token_exchanges_for_signed_tokens() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("scope", "openid email"),
        ],
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;

    assert_eq!(
        body["issued_token_type"],
        "urn:ietf:params:oauth:token-type:access_token"
    );
    assert!(body.get("refresh_token").is_none());

    let claims = verify_via_jwks(&app, body["id_token"].as_str().unwrap()).await;
    assert_eq!(claims["sub"], "mock-user-id");
    assert_eq!(claims["email"], "kilgore@kilgore.trout");
}

#[tokio::test]
async fn requested_id_token_is_returned_in_the_access_token_slot() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("requested_token_type", "urn:ietf:params:oauth:token-type:id_token"),
        ],
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(
        body["issued_token_type"],
        "urn:ietf:params:oauth:token-type:id_token"
    );
    assert_eq!(body["access_token"], body["id_token"]);
}

#[tokio::test]
async fn exchange_with_offline_access_mints_a_refresh_token() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("scope", "openid offline_access"),
        ],
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let refresh_token = body["refresh_token"].as_str().unwrap();

    // The refresh token works like any other.
    let refreshed = send(
        &app,
        form_post_basic(
            "/token",
            "client-a",
            "s",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        ),
    )
    .await;
    assert_eq!(refreshed.status(), 200);
}

#[tokio::test]
async fn missing_subject_token_is_invalid_request() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[("subject_token_type", "urn:ietf:params:oauth:token-type:access_token")],
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn unknown_connector_is_invalid_request() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("connector_id", "ghost"),
        ],
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn connector_without_the_capability_is_invalid_request() {
    let config = r#"
        issuer = "http://127.0.0.1:5556"
        signing_algorithm = "EdDSA"

        [[connectors]]
        type = "local"
        id = "local"

        [[clients]]
        id = "client-a"
        secret = "s"
    "#;
    let (app, _state) = build_test_app(config).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("connector_id", "local"),
        ],
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn unsupported_requested_token_type_is_invalid_request() {
    let (app, _state) = build_test_app(EXCHANGE_CONFIG).await;
    let response = exchange(
        &app,
        &[
            ("subject_token", "upstream-token"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("requested_token_type", "urn:ietf:params:oauth:token-type:saml2"),
        ],
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "invalid_request");
}
