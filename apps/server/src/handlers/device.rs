//! Device authorization grant (RFC 8628).
//!
//! `POST /device` hands the device a short user code and a long device
//! code. The human side enters the user code at `/device/auth` and runs
//! through the ordinary authorization pipeline with an internal redirect
//! URI; `/device/callback` redeems the resulting authorization code and
//! parks the token response on the device token, where the device's
//! `/token` polling picks it up.

use std::collections::HashMap;

use axum::extract::{Form, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use rand::Rng;
use serde::Deserialize;

use oxidp_shared::api::device::DeviceAuthorizationResponse;
use oxidp_shared::oauth::{ErrorCode, ResponseTypes};
use oxidp_shared::scopes::Scopes;

use crate::error::{OAuthError, TokenEndpointError};
use crate::handlers::authorize::{connector_selection, DEVICE_CALLBACK_URI};
use crate::handlers::token::handle_authorization_code;
use crate::pages;
use crate::state::AppState;
use crate::storage::{
    new_id, new_secret, AuthRequest, CodeChallengeMethod, DeviceRequest, DeviceToken,
    DeviceTokenStatus, Pkce, StorageError,
};

/// Unambiguous consonant alphabet for user codes: no vowels (no accidental
/// words), none of 0/O/1/I.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

fn new_user_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.random_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Uppercase the user's input and restore the middle hyphen if it was
/// dropped. User codes are case-insensitive by contract.
fn normalize_user_code(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if cleaned.len() == 8 && !cleaned.contains('-') {
        format!("{}-{}", &cleaned[..4], &cleaned[4..])
    } else {
        cleaned
    }
}

/// POST /device — device authorization endpoint.
pub async fn device_authorization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Response, TokenEndpointError> {
    let client = super::token::authenticate_client(&state, &headers, &params).await?;

    let scopes = match params.get("scope").filter(|v| !v.is_empty()) {
        Some(raw) => Scopes::parse(raw).map_err(|unknown| {
            OAuthError::new(ErrorCode::InvalidScope, format!("unknown scope {unknown:?}"))
        })?,
        None => Scopes::parse("openid").expect("static scope list"),
    };

    let pkce = match params.get("code_challenge").filter(|v| !v.is_empty()) {
        Some(challenge) => {
            let method = params
                .get("code_challenge_method")
                .map(String::as_str)
                .unwrap_or("plain");
            let method = CodeChallengeMethod::from_param(method).ok_or_else(|| {
                OAuthError::new(
                    ErrorCode::InvalidRequest,
                    format!("unsupported code_challenge_method {method:?}"),
                )
            })?;
            Some(Pkce {
                code_challenge: challenge.clone(),
                code_challenge_method: method,
            })
        }
        None => None,
    };

    let now = Utc::now();
    let expiry = now + state.config.expiry.device_requests();
    let poll_interval = state.config.expiry.device_poll_interval_seconds;
    let user_code = new_user_code();
    let device_code = new_secret();

    state
        .storage
        .create_device_request(DeviceRequest {
            user_code: user_code.clone(),
            device_code: device_code.clone(),
            client_id: client.id.clone(),
            scopes: scopes.clone(),
            expiry,
        })
        .await
        .map_err(OAuthError::from)?;
    state
        .storage
        .create_device_token(DeviceToken {
            device_code: device_code.clone(),
            client_id: client.id.clone(),
            status: DeviceTokenStatus::Pending,
            token_response: None,
            poll_interval_seconds: poll_interval,
            // Backdated so the device's first poll is never throttled.
            last_poll: now - Duration::seconds(poll_interval),
            expiry,
            pkce,
        })
        .await
        .map_err(OAuthError::from)?;

    let issuer = state.config.issuer_base();
    let body = DeviceAuthorizationResponse {
        device_code,
        verification_uri: format!("{issuer}/device"),
        verification_uri_complete: format!(
            "{issuer}/device?user_code={}",
            urlencode(&user_code)
        ),
        user_code,
        expires_in: (expiry - now).num_seconds(),
        interval: poll_interval,
    };
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[derive(Debug, Deserialize)]
pub struct DevicePageQuery {
    pub user_code: Option<String>,
}

/// GET /device — user code entry form.
pub async fn verification_page(Query(query): Query<DevicePageQuery>) -> Response {
    pages::device_code_form(query.user_code.as_deref().unwrap_or(""), false)
}

#[derive(Debug, Deserialize)]
pub struct UserCodeForm {
    #[serde(default)]
    pub user_code: String,
}

/// POST /device/auth — route the human into the authorization pipeline for
/// the device named by the user code.
pub async fn verify_user_code(
    State(state): State<AppState>,
    Form(form): Form<UserCodeForm>,
) -> Response {
    let user_code = normalize_user_code(&form.user_code);
    if user_code.is_empty() {
        return pages::device_code_form("", true);
    }

    let now = Utc::now();
    let device_request = match state.storage.get_device_request(&user_code).await {
        Ok(req) if req.expiry > now => req,
        Ok(_) | Err(StorageError::NotFound) => return pages::device_code_form(&user_code, true),
        Err(err) => {
            tracing::warn!(error = %err, "device request lookup failed");
            return pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            );
        }
    };

    // Only a still-pending device may be approved.
    match state
        .storage
        .get_device_token(&device_request.device_code)
        .await
    {
        Ok(token) if token.status == DeviceTokenStatus::Pending && token.expiry > now => {}
        Ok(_) | Err(StorageError::NotFound) => return pages::device_code_form(&user_code, true),
        Err(err) => {
            tracing::warn!(error = %err, "device token lookup failed");
            return pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            );
        }
    }

    let auth_request = AuthRequest {
        id: new_id(),
        client_id: device_request.client_id.clone(),
        response_types: ResponseTypes::CODE,
        scopes: device_request.scopes.clone(),
        redirect_uri: DEVICE_CALLBACK_URI.to_string(),
        nonce: String::new(),
        state: user_code.clone(),
        force_approval_prompt: false,
        expiry: now + state.config.expiry.device_requests(),
        logged_in: false,
        claims: None,
        connector_id: String::new(),
        connector_data: None,
        pkce: None,
    };
    if let Err(err) = state.storage.create_auth_request(auth_request.clone()).await {
        tracing::warn!(error = %err, "failed to create device auth request");
        return pages::error_page(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service unavailable",
            "please try again later",
        );
    }
    connector_selection(&state, &auth_request.id)
}

/// GET /device/callback — internal completion target of the device
/// authorization pipeline. Redeems the code and parks the token response
/// for the polling device.
pub async fn device_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(code), Some(user_code)) = (params.get("code"), params.get("state")) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing code or state parameter",
        );
    };

    let device_request = match state.storage.get_device_request(user_code).await {
        Ok(req) => req,
        Err(StorageError::NotFound) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "unknown or expired device session",
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "device request lookup failed");
            return pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            );
        }
    };
    let client = match state.storage.get_client(&device_request.client_id).await {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "device client lookup failed");
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "device client is no longer registered",
            );
        }
    };

    // Redeem the authorization code exactly like the token endpoint would.
    let mut exchange_params = HashMap::new();
    exchange_params.insert("code".to_string(), code.clone());
    exchange_params.insert("redirect_uri".to_string(), DEVICE_CALLBACK_URI.to_string());
    let token_response = match handle_authorization_code(&state, &client, &exchange_params).await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = ?err.0.code, "device code redemption failed");
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "device login could not be completed",
            );
        }
    };
    let token_json = match serde_json::to_value(&token_response) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize device token response");
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "device login could not be completed",
            );
        }
    };

    let result = state
        .storage
        .update_device_token(
            &device_request.device_code,
            Box::new(move |mut token| {
                if token.status != DeviceTokenStatus::Pending {
                    return Err(StorageError::AlreadyExists);
                }
                token.status = DeviceTokenStatus::Complete;
                token.token_response = Some(token_json);
                Ok(token)
            }),
        )
        .await;
    match result {
        Ok(()) => pages::device_success(),
        Err(StorageError::AlreadyExists) => pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "this device was already authorized",
        ),
        Err(err) => {
            tracing::warn!(error = %err, "failed to complete device token");
            pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            )
        }
    }
}
