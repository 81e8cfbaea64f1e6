//! Device authorization grant: code issuance, poll pacing, and the full
//! browser-side completion.

mod common;

use common::*;

const DEVICE_CONFIG: &str = r#"
    issuer = "http://127.0.0.1:5556"
    signing_algorithm = "EdDSA"

    [oauth2]
    skip_approval_screen = true

    [[connectors]]
    type = "local"
    id = "local"
    name = "Email"

    [[clients]]
    id = "cli"
    public = true
    name = "CLI"

    [[passwords]]
    email = "alice@example.com"
    plaintext = "pw"
    username = "alice"
    user_id = "alice-user-id"
"#;

/// Same setup with polling pacing disabled, for the completion tests.
const FAST_POLL_CONFIG: &str = r#"
    issuer = "http://127.0.0.1:5556"
    signing_algorithm = "EdDSA"

    [oauth2]
    skip_approval_screen = true

    [expiry]
    device_poll_interval_seconds = 0

    [[connectors]]
    type = "local"
    id = "local"
    name = "Email"

    [[clients]]
    id = "cli"
    public = true
    name = "CLI"

    [[passwords]]
    email = "alice@example.com"
    plaintext = "pw"
    username = "alice"
    user_id = "alice-user-id"
"#;

async fn start_device_flow(app: &axum::Router) -> serde_json::Value {
    let response = send(
        app,
        form_post(
            "/device",
            &[("client_id", "cli"), ("scope", "openid email offline_access")],
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    response_json(response).await
}

async fn poll(app: &axum::Router, device_code: &str) -> axum::response::Response {
    send(
        app,
        form_post(
            "/device/token",
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device_code),
                ("client_id", "cli"),
            ],
        ),
    )
    .await
}

#[tokio::test]
async fn device_authorization_returns_codes_and_uris() {
    let (app, _state) = build_test_app(DEVICE_CONFIG).await;
    let body = start_device_flow(&app).await;

    let user_code = body["user_code"].as_str().unwrap();
    assert_eq!(user_code.len(), 9);
    assert_eq!(&user_code[4..5], "-");
    assert!(body["device_code"].as_str().unwrap().len() >= 32);
    assert_eq!(body["verification_uri"], "http://127.0.0.1:5556/device");
    assert!(body["verification_uri_complete"]
        .as_str()
        .unwrap()
        .contains("user_code="));
    assert_eq!(body["interval"], 5);
    assert!(body["expires_in"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn pending_device_reports_authorization_pending() {
    let (app, _state) = build_test_app(DEVICE_CONFIG).await;
    let body = start_device_flow(&app).await;
    let device_code = body["device_code"].as_str().unwrap();

    let response = poll(&app, device_code).await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "authorization_pending");
}

#[tokio::test]
async fn polling_faster_than_the_interval_is_slowed_down() {
    let (app, _state) = build_test_app(DEVICE_CONFIG).await;
    let body = start_device_flow(&app).await;
    let device_code = body["device_code"].as_str().unwrap();

    // First poll is allowed; the immediate second one is not.
    let first = poll(&app, device_code).await;
    assert_eq!(response_json(first).await["error"], "authorization_pending");

    let second = poll(&app, device_code).await;
    assert_eq!(response_json(second).await["error"], "slow_down");
}

#[tokio::test]
async fn unknown_device_code_is_invalid_grant() {
    let (app, _state) = build_test_app(DEVICE_CONFIG).await;
    let response = poll(&app, "no-such-device-code").await;
    assert_eq!(response.status(), 400);
    assert_eq!(response_json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_user_code_rerenders_the_entry_form() {
    let (app, _state) = build_test_app(DEVICE_CONFIG).await;
    let response = send(
        &app,
        form_post("/device/auth", &[("user_code", "XXXX-XXXX")]),
    )
    .await;
    assert_eq!(response.status(), 400);
}

/// Walk the human half of the device flow: enter the user code, log in,
/// land on the internal device callback.
async fn approve_device(app: &axum::Router, user_code: &str) {
    let response = send(app, form_post("/device/auth", &[("user_code", user_code)])).await;
    assert_eq!(response.status(), 302);
    let connector_uri = location(&response);
    let req_id = connector_uri.split_once("req=").unwrap().1.to_string();

    let login = send(
        app,
        form_post(
            &format!("/auth/local/login?req={req_id}"),
            &[("login", "alice@example.com"), ("password", "pw")],
        ),
    )
    .await;
    assert_eq!(login.status(), 302);

    let finalize = send(app, get(&location(&login))).await;
    assert_eq!(finalize.status(), 302);
    let callback_uri = location(&finalize);
    assert!(callback_uri.starts_with("/device/callback?"));

    let callback = send(app, get(&callback_uri)).await;
    assert_eq!(callback.status(), 200, "device success page");
}

#[tokio::test]
async fn completed_device_flow_delivers_tokens_exactly_once() {
    let (app, _state) = build_test_app(FAST_POLL_CONFIG).await;
    let body = start_device_flow(&app).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let user_code = body["user_code"].as_str().unwrap().to_string();

    approve_device(&app, &user_code).await;

    let response = poll(&app, &device_code).await;
    assert_eq!(response.status(), 200);
    let token_body = response_json(response).await;
    assert_eq!(token_body["token_type"], "bearer");
    assert!(token_body["refresh_token"].as_str().is_some());

    let claims = verify_via_jwks(&app, token_body["id_token"].as_str().unwrap()).await;
    assert_eq!(claims["sub"], "alice-user-id");
    assert_eq!(claims["aud"], "cli");
    assert_eq!(claims["email"], "alice@example.com");

    // The stored response is single-shot.
    let again = poll(&app, &device_code).await;
    assert_eq!(again.status(), 400);
    assert_eq!(response_json(again).await["error"], "invalid_grant");
}

#[tokio::test]
async fn lowercase_user_code_is_accepted() {
    let (app, _state) = build_test_app(FAST_POLL_CONFIG).await;
    let body = start_device_flow(&app).await;
    let device_code = body["device_code"].as_str().unwrap().to_string();
    let user_code = body["user_code"].as_str().unwrap().to_lowercase();

    approve_device(&app, &user_code).await;

    let response = poll(&app, &device_code).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn device_cannot_be_approved_twice() {
    let (app, _state) = build_test_app(FAST_POLL_CONFIG).await;
    let body = start_device_flow(&app).await;
    let user_code = body["user_code"].as_str().unwrap().to_string();

    approve_device(&app, &user_code).await;

    // The second walk fails at the user-code entry step: the device token
    // is no longer pending.
    let response = send(&app, form_post("/device/auth", &[("user_code", &user_code)])).await;
    assert_eq!(response.status(), 400);
}
