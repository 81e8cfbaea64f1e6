#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tower::ServiceExt;

use oxidp_server::config::ServerConfig;
use oxidp_server::connectors::password::hash_password;
use oxidp_server::connectors::ConnectorRegistry;
use oxidp_server::keys::KeyManager;
use oxidp_server::router::build_router;
use oxidp_server::state::AppState;
use oxidp_server::storage::{Client, MemoryStorage, Password, Storage};

/// Base configuration most suites start from: one local password connector,
/// one confidential client, alice as the only account. EdDSA keeps key
/// generation fast in tests.
pub const BASE_CONFIG: &str = r#"
    issuer = "http://127.0.0.1:5556"
    signing_algorithm = "EdDSA"

    [oauth2]
    skip_approval_screen = true

    [[connectors]]
    type = "local"
    id = "local"
    name = "Email"

    [[clients]]
    id = "client-a"
    secret = "s"
    redirect_uris = ["https://rp.example/cb"]
    name = "Test RP"

    [[passwords]]
    email = "alice@example.com"
    plaintext = "pw"
    username = "alice"
    user_id = "alice-user-id"
"#;

/// Build the full application against in-memory storage, loading the static
/// clients and passwords exactly like the server boot path does.
pub async fn build_test_app(config_toml: &str) -> (axum::Router, AppState) {
    let config = Arc::new(ServerConfig::from_toml_str(config_toml).unwrap());
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    for static_client in &config.clients {
        storage
            .create_client(Client {
                id: static_client.id.clone(),
                secret: static_client.secret.clone(),
                redirect_uris: static_client.redirect_uris.clone(),
                trusted_peers: static_client.trusted_peers.clone(),
                public: static_client.public,
                name: static_client.name.clone(),
                logo_url: static_client.logo_url.clone(),
            })
            .await
            .unwrap();
    }
    for static_password in &config.passwords {
        let hash = if static_password.hash.is_empty() {
            hash_password(&static_password.plaintext).unwrap()
        } else {
            static_password.hash.clone()
        };
        storage
            .create_password(Password {
                email: static_password.email.clone(),
                hash,
                username: static_password.username.clone(),
                user_id: static_password.user_id.clone(),
            })
            .await
            .unwrap();
    }

    let keys = Arc::new(KeyManager::new(
        Arc::clone(&storage),
        config.signing_algorithm().unwrap(),
        config.expiry.signing_keys(),
        config.expiry.verification_window(),
    ));
    keys.rotate_if_needed(chrono::Utc::now()).await.unwrap();

    let connectors = Arc::new(
        ConnectorRegistry::from_config(&config.connectors, Arc::clone(&storage)).unwrap(),
    );
    let state = AppState::new(storage, keys, connectors, config);
    (build_router(state.clone()), state)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn form_post(uri: &str, params: &[(&str, &str)]) -> Request<Body> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        body.append_pair(key, value);
    }
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.finish()))
        .unwrap()
}

/// Form POST with HTTP Basic client credentials.
pub fn form_post_basic(
    uri: &str,
    client_id: &str,
    client_secret: &str,
    params: &[(&str, &str)],
) -> Request<Body> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        body.append_pair(key, value);
    }
    let credentials = BASE64_STANDARD.encode(format!("{client_id}:{client_secret}"));
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::AUTHORIZATION, format!("Basic {credentials}"))
        .body(Body::from(body.finish()))
        .unwrap()
}

pub async fn send(app: &axum::Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect response carries a Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Query (or fragment) parameters of a redirect target.
pub fn redirect_params(location: &str) -> std::collections::HashMap<String, String> {
    let raw = location
        .split_once('#')
        .map(|(_, frag)| frag.to_string())
        .or_else(|| location.split_once('?').map(|(_, q)| q.to_string()))
        .unwrap_or_default();
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}

pub fn encode_query(params: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Drive the browser half of the code flow for alice against the `local`
/// connector and return the `(code, state)` delivered to the relying party.
pub async fn run_code_flow(app: &axum::Router, auth_query: &[(&str, &str)]) -> (String, String) {
    let uri = format!("/auth?{}", encode_query(auth_query));
    let response = send(app, get(&uri)).await;
    assert_eq!(response.status(), 302, "expected redirect to the connector");
    let connector_uri = location(&response);
    assert!(
        connector_uri.starts_with("/auth/local?req="),
        "unexpected connector redirect: {connector_uri}"
    );
    let req_id = connector_uri.split_once("req=").unwrap().1.to_string();

    let form_response = send(app, get(&connector_uri)).await;
    assert_eq!(form_response.status(), 200, "expected the password form");

    let login_response = send(
        app,
        form_post(
            &format!("/auth/local/login?req={req_id}"),
            &[("login", "alice@example.com"), ("password", "pw")],
        ),
    )
    .await;
    assert_eq!(login_response.status(), 302, "expected redirect to approval");
    let approval_uri = location(&login_response);

    let final_response = send(app, get(&approval_uri)).await;
    assert_eq!(
        final_response.status(),
        302,
        "expected the authorization response redirect"
    );
    let redirect = location(&final_response);
    let params = redirect_params(&redirect);
    (
        params.get("code").cloned().unwrap_or_default(),
        params.get("state").cloned().unwrap_or_default(),
    )
}

/// Fetch the JWKS and verify a JWT against it, returning the payload.
pub async fn verify_via_jwks(app: &axum::Router, token: &str) -> serde_json::Value {
    let response = send(app, get("/keys")).await;
    assert_eq!(response.status(), 200);
    let jwks = response_json(response).await;

    let header = jsonwebtoken::decode_header(token).unwrap();
    let kid = header.kid.expect("token carries a kid");
    let jwk = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .find(|key| key["kid"] == kid.as_str())
        .unwrap_or_else(|| panic!("kid {kid} not found in JWKS"));

    let decoding_key = match jwk["kty"].as_str().unwrap() {
        "RSA" => jsonwebtoken::DecodingKey::from_rsa_components(
            jwk["n"].as_str().unwrap(),
            jwk["e"].as_str().unwrap(),
        )
        .unwrap(),
        "OKP" => jsonwebtoken::DecodingKey::from_ed_components(jwk["x"].as_str().unwrap())
            .unwrap(),
        other => panic!("unexpected kty {other}"),
    };
    let algorithm = match jwk["alg"].as_str().unwrap() {
        "RS256" => jsonwebtoken::Algorithm::RS256,
        "EdDSA" => jsonwebtoken::Algorithm::EdDSA,
        other => panic!("unexpected alg {other}"),
    };
    let mut validation = jsonwebtoken::Validation::new(algorithm);
    validation.validate_aud = false;

    jsonwebtoken::decode::<serde_json::Value>(token, &decoding_key, &validation)
        .unwrap()
        .claims
}
