//! The token endpoint: authorization_code, refresh_token, device_code, and
//! RFC 8693 token-exchange grants.
//!
//! Redemption guarantees live here. An authorization code commits by
//! deleting its row before any token is built, so of two concurrent
//! redemptions exactly one succeeds. A refresh token rotates its secret
//! inside a single storage update; a secret that matches neither the
//! current nor the obsolete hash is treated as replay and burns the whole
//! session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};

use oxidp_shared::api::token::TokenResponse;
use oxidp_shared::oauth::{ErrorCode, GrantType};
use oxidp_shared::scopes::Scopes;

use crate::connectors::{ConnectorError, Identity};
use crate::error::{OAuthError, TokenEndpointError};
use crate::state::AppState;
use crate::storage::{retry_read, Client, DeviceTokenStatus, RefreshToken, StorageError};
use crate::tokens::{constant_time_eq, hash_secret, verify_code_verifier, RefreshTokenValue};

const TOKEN_TYPE_ACCESS: &str = "urn:ietf:params:oauth:token-type:access_token";
const TOKEN_TYPE_ID: &str = "urn:ietf:params:oauth:token-type:id_token";

/// POST /token
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Response, TokenEndpointError> {
    let grant_type = params
        .get("grant_type")
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "missing grant_type"))?;
    let grant_type = GrantType::from_param(grant_type)
        .ok_or_else(|| OAuthError::code(ErrorCode::UnsupportedGrantType))?;

    let client = authenticate_client(&state, &headers, &params).await?;

    let response = match grant_type {
        GrantType::AuthorizationCode => handle_authorization_code(&state, &client, &params).await?,
        GrantType::RefreshToken => handle_refresh_token(&state, &client, &params).await?,
        GrantType::DeviceCode => handle_device_code(&state, &client, &params).await?,
        GrantType::TokenExchange => handle_token_exchange(&state, &client, &params).await?,
    };
    Ok(token_json(response))
}

fn token_json(body: TokenResponse) -> Response {
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
        .headers_mut()
        .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Authenticate the calling client from the Basic header or body
/// credentials. Public clients may omit the secret; they are bound to their
/// grant by PKCE instead.
pub(crate) async fn authenticate_client(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Client, TokenEndpointError> {
    let (client_id, client_secret) = match headers.get(header::AUTHORIZATION) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| OAuthError::code(ErrorCode::InvalidClient))?;
            let encoded = value
                .strip_prefix("Basic ")
                .ok_or_else(|| OAuthError::code(ErrorCode::InvalidClient))?;
            let decoded = BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|_| OAuthError::code(ErrorCode::InvalidClient))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| OAuthError::code(ErrorCode::InvalidClient))?;
            let (id, secret) = decoded
                .split_once(':')
                .ok_or_else(|| OAuthError::code(ErrorCode::InvalidClient))?;
            (id.to_string(), secret.to_string())
        }
        None => (
            params.get("client_id").cloned().unwrap_or_default(),
            params.get("client_secret").cloned().unwrap_or_default(),
        ),
    };
    if client_id.is_empty() {
        return Err(OAuthError::code(ErrorCode::InvalidClient).into());
    }

    let storage = state.storage.clone();
    let lookup_id = client_id.clone();
    let client = retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_client(&id).await }
    })
    .await
    .map_err(|err| match err {
        StorageError::NotFound => OAuthError::code(ErrorCode::InvalidClient),
        other => other.into(),
    })?;

    if client.public && client_secret.is_empty() {
        return Ok(client);
    }
    if !client.secret.is_empty() && constant_time_eq(&client.secret, &client_secret) {
        return Ok(client);
    }
    tracing::info!(client_id = %client.id, "client authentication failed");
    Err(OAuthError::code(ErrorCode::InvalidClient).into())
}

pub(crate) async fn handle_authorization_code(
    state: &AppState,
    client: &Client,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, TokenEndpointError> {
    let code_id = params
        .get("code")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "missing code"))?;

    let storage = state.storage.clone();
    let lookup_id = code_id.clone();
    let code = retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_auth_code(&id).await }
    })
    .await
    .map_err(|err| match err {
        StorageError::NotFound => OAuthError::code(ErrorCode::InvalidGrant),
        other => other.into(),
    })?;

    if code.expiry <= Utc::now() || code.client_id != client.id {
        return Err(OAuthError::code(ErrorCode::InvalidGrant).into());
    }

    match (&code.pkce, params.get("code_verifier").map(String::as_str)) {
        (Some(pkce), Some(verifier)) if !verifier.is_empty() => {
            if !verify_code_verifier(verifier, pkce) {
                return Err(OAuthError::new(
                    ErrorCode::InvalidGrant,
                    "failed to verify code_verifier",
                )
                .into());
            }
        }
        (Some(_), _) => {
            return Err(OAuthError::new(
                ErrorCode::InvalidGrant,
                "code_verifier required for this authorization code",
            )
            .into())
        }
        (None, Some(verifier)) if !verifier.is_empty() => {
            return Err(OAuthError::new(
                ErrorCode::InvalidRequest,
                "code_verifier provided but no code_challenge was present",
            )
            .into())
        }
        (None, _) => {}
    }

    // Commit point: deleting the code is what makes redemption
    // at-most-once. A concurrent redemption sees NotFound here.
    match state.storage.delete_auth_code(code_id).await {
        Ok(()) => {}
        Err(StorageError::NotFound) => {
            return Err(OAuthError::code(ErrorCode::InvalidGrant).into())
        }
        Err(err) => return Err(OAuthError::from(err).into()),
    }

    if params.get("redirect_uri").map(String::as_str) != Some(code.redirect_uri.as_str()) {
        return Err(OAuthError::new(ErrorCode::InvalidGrant, "redirect_uri mismatch").into());
    }

    let minted = state
        .tokens
        .mint(
            &client.id,
            &code.claims,
            &code.scopes,
            &code.nonce,
            &code.connector_id,
            true,
        )
        .await?;
    let refresh_token = state
        .tokens
        .create_refresh(
            &client.id,
            &code.claims,
            &code.scopes,
            &code.nonce,
            &code.connector_id,
            code.connector_data.clone(),
        )
        .await?;

    Ok(TokenResponse {
        access_token: minted.access_token,
        token_type: "bearer".to_string(),
        expires_in: minted.expires_in,
        refresh_token,
        id_token: Some(minted.id_token),
        issued_token_type: None,
    })
}

/// Delete a refresh token and its offline-session entry after replay or a
/// connector-denied refresh.
async fn invalidate_refresh(state: &AppState, token: &RefreshToken) {
    match state.storage.delete_refresh_token(&token.id).await {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(err) => tracing::warn!(error = %err, "failed to delete refresh token"),
    }
    let client_id = token.client_id.clone();
    match state
        .storage
        .update_offline_session(
            &token.claims.user_id,
            &token.connector_id,
            Box::new(move |mut session| {
                session.refresh_tokens.remove(&client_id);
                Ok(session)
            }),
        )
        .await
    {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(err) => tracing::warn!(error = %err, "failed to update offline session"),
    }
}

async fn handle_refresh_token(
    state: &AppState,
    client: &Client,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, TokenEndpointError> {
    let raw = params
        .get("refresh_token")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "missing refresh_token"))?;
    let value = RefreshTokenValue::parse(raw)
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "malformed refresh_token"))?;

    let storage = state.storage.clone();
    let lookup_id = value.id.clone();
    let row = retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_refresh_token(&id).await }
    })
    .await
    .map_err(|err| match err {
        StorageError::NotFound => OAuthError::code(ErrorCode::InvalidGrant),
        other => other.into(),
    })?;

    if row.client_id != client.id {
        tracing::warn!(
            client_id = %client.id,
            token_client = %row.client_id,
            "refresh token presented by the wrong client"
        );
        return Err(OAuthError::code(ErrorCode::InvalidGrant).into());
    }

    let presented = hash_secret(&value.secret);
    let matches_current = constant_time_eq(&presented, &row.token);
    let matches_obsolete =
        !row.obsolete_token.is_empty() && constant_time_eq(&presented, &row.obsolete_token);
    if !matches_current && !matches_obsolete {
        tracing::warn!(
            user_id = %row.claims.user_id,
            client_id = %row.client_id,
            "refresh token replay detected, invalidating session"
        );
        invalidate_refresh(state, &row).await;
        return Err(OAuthError::code(ErrorCode::InvalidGrant).into());
    }

    // Scopes may narrow on refresh, never widen.
    let scopes = match params.get("scope").filter(|v| !v.is_empty()) {
        Some(raw) => {
            let requested = Scopes::parse(raw).map_err(|unknown| {
                OAuthError::new(ErrorCode::InvalidScope, format!("unknown scope {unknown:?}"))
            })?;
            if !requested.is_subset_of(&row.scopes) {
                return Err(OAuthError::new(
                    ErrorCode::InvalidScope,
                    "requested scopes exceed the original grant",
                )
                .into());
            }
            requested
        }
        None => row.scopes.clone(),
    };

    // Let the connector refresh claims and its own opaque state.
    let mut identity = Identity {
        claims: row.claims.clone(),
        connector_data: row.connector_data.clone(),
    };
    let Some(registered) = state.connectors.get(&row.connector_id) else {
        tracing::warn!(connector = %row.connector_id, "refresh for a connector that no longer exists");
        invalidate_refresh(state, &row).await;
        return Err(OAuthError::code(ErrorCode::AccessDenied).into());
    };
    if let Some(refresher) = registered.connector.as_refresh() {
        match refresher.refresh(&row.scopes, identity).await {
            Ok(refreshed) => identity = refreshed,
            Err(ConnectorError::Retryable(detail)) => {
                tracing::warn!(error = %detail, connector = %row.connector_id, "connector refresh unavailable");
                return Err(OAuthError::code(ErrorCode::TemporarilyUnavailable).into());
            }
            Err(ConnectorError::Denied(detail)) => {
                tracing::warn!(
                    user_id = %row.claims.user_id,
                    client_id = %row.client_id,
                    reason = %detail,
                    "connector denied refresh, invalidating session"
                );
                invalidate_refresh(state, &row).await;
                return Err(OAuthError::code(ErrorCode::AccessDenied).into());
            }
        }
    }

    // Rotate inside a single update. The closure re-checks the presented
    // secret against the row it actually observes: if a concurrent
    // redemption rotated first, neither hash matches anymore and this
    // attempt is replay.
    let new_secret = crate::storage::new_secret();
    let new_hash = hash_secret(&new_secret);
    let stale = Arc::new(AtomicBool::new(false));
    let stale_in_updater = Arc::clone(&stale);
    let presented_for_updater = presented.clone();
    let claims_for_updater = identity.claims.clone();
    let connector_data_for_updater = identity.connector_data.clone();
    let now = Utc::now();

    let update_result = state
        .storage
        .update_refresh_token(
            &row.id,
            Box::new(move |mut token| {
                let current = constant_time_eq(&presented_for_updater, &token.token);
                let obsolete = !token.obsolete_token.is_empty()
                    && constant_time_eq(&presented_for_updater, &token.obsolete_token);
                if !current && !obsolete {
                    stale_in_updater.store(true, Ordering::SeqCst);
                    return Ok(token);
                }
                token.obsolete_token = token.token.clone();
                token.token = new_hash;
                token.last_used = now;
                token.claims = claims_for_updater;
                token.connector_data = connector_data_for_updater;
                Ok(token)
            }),
        )
        .await;
    match update_result {
        Ok(()) => {}
        Err(StorageError::NotFound) => {
            return Err(OAuthError::code(ErrorCode::InvalidGrant).into())
        }
        Err(err) => return Err(OAuthError::from(err).into()),
    }
    if stale.load(Ordering::SeqCst) {
        tracing::warn!(
            user_id = %row.claims.user_id,
            client_id = %row.client_id,
            "refresh token replay detected during rotation, invalidating session"
        );
        invalidate_refresh(state, &row).await;
        return Err(OAuthError::code(ErrorCode::InvalidGrant).into());
    }

    // Keep the offline session's connector state current.
    let session_data = identity.connector_data.clone();
    match state
        .storage
        .update_offline_session(
            &identity.claims.user_id,
            &row.connector_id,
            Box::new(move |mut session| {
                session.connector_data = session_data;
                Ok(session)
            }),
        )
        .await
    {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(err) => tracing::warn!(error = %err, "failed to update offline session"),
    }

    let minted = state
        .tokens
        .mint(
            &client.id,
            &identity.claims,
            &scopes,
            &row.nonce,
            &row.connector_id,
            true,
        )
        .await?;

    Ok(TokenResponse {
        access_token: minted.access_token,
        token_type: "bearer".to_string(),
        expires_in: minted.expires_in,
        refresh_token: Some(
            RefreshTokenValue {
                id: row.id.clone(),
                secret: new_secret,
            }
            .encode(),
        ),
        id_token: Some(minted.id_token),
        issued_token_type: None,
    })
}

async fn handle_device_code(
    state: &AppState,
    client: &Client,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, TokenEndpointError> {
    let device_code = params
        .get("device_code")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "missing device_code"))?;

    let storage = state.storage.clone();
    let lookup_id = device_code.clone();
    let token_row = retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_device_token(&id).await }
    })
    .await
    .map_err(|err| match err {
        StorageError::NotFound => OAuthError::code(ErrorCode::InvalidGrant),
        other => other.into(),
    })?;

    if token_row.client_id != client.id {
        return Err(OAuthError::code(ErrorCode::InvalidGrant).into());
    }

    let now = Utc::now();
    if token_row.expiry <= now {
        return Err(OAuthError::code(ErrorCode::ExpiredToken).into());
    }

    // Record this poll; a device polling faster than the advertised
    // interval gets slow_down and its clock restarted.
    let too_fast = now < token_row.last_poll + Duration::seconds(token_row.poll_interval_seconds);
    match state
        .storage
        .update_device_token(
            device_code,
            Box::new(move |mut token| {
                token.last_poll = now;
                Ok(token)
            }),
        )
        .await
    {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(err) => return Err(OAuthError::from(err).into()),
    }
    if too_fast {
        return Err(OAuthError::code(ErrorCode::SlowDown).into());
    }

    match token_row.status {
        DeviceTokenStatus::Pending => {
            Err(OAuthError::code(ErrorCode::AuthorizationPending).into())
        }
        DeviceTokenStatus::Denied => Err(OAuthError::code(ErrorCode::AccessDenied).into()),
        DeviceTokenStatus::Complete => {
            if let Some(pkce) = &token_row.pkce {
                match params.get("code_verifier").map(String::as_str) {
                    Some(verifier) if !verifier.is_empty() => {
                        if !verify_code_verifier(verifier, pkce) {
                            return Err(OAuthError::new(
                                ErrorCode::InvalidGrant,
                                "failed to verify code_verifier",
                            )
                            .into());
                        }
                    }
                    _ => {
                        return Err(OAuthError::new(
                            ErrorCode::InvalidGrant,
                            "code_verifier required for this device code",
                        )
                        .into())
                    }
                }
            }
            let response = token_row
                .token_response
                .clone()
                .ok_or_else(OAuthError::server_error)?;
            let response: TokenResponse =
                serde_json::from_value(response).map_err(|err| {
                    tracing::error!(error = %err, "stored device token response unparsable");
                    OAuthError::server_error()
                })?;
            // The response is delivered exactly once.
            match state.storage.delete_device_token(device_code).await {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(err) => tracing::warn!(error = %err, "failed to delete device token"),
            }
            Ok(response)
        }
    }
}

async fn handle_token_exchange(
    state: &AppState,
    client: &Client,
    params: &HashMap<String, String>,
) -> Result<TokenResponse, TokenEndpointError> {
    let connector_id = params
        .get("connector_id")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| state.config.oauth2.password_connector.clone());
    if connector_id.is_empty() {
        return Err(
            OAuthError::new(ErrorCode::InvalidRequest, "no connector_id specified").into(),
        );
    }
    let Some(registered) = state.connectors.get(&connector_id) else {
        return Err(OAuthError::new(
            ErrorCode::InvalidRequest,
            format!("unknown connector {connector_id:?}"),
        )
        .into());
    };
    let Some(exchanger) = registered.connector.as_token_exchange() else {
        return Err(OAuthError::new(
            ErrorCode::InvalidRequest,
            "connector does not support token exchange",
        )
        .into());
    };

    let subject_token = params
        .get("subject_token")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::new(ErrorCode::InvalidRequest, "missing subject_token"))?;
    let subject_token_type = params
        .get("subject_token_type")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            OAuthError::new(ErrorCode::InvalidRequest, "missing subject_token_type")
        })?;
    let requested_token_type = params
        .get("requested_token_type")
        .map(String::as_str)
        .unwrap_or(TOKEN_TYPE_ACCESS);
    if requested_token_type != TOKEN_TYPE_ACCESS && requested_token_type != TOKEN_TYPE_ID {
        return Err(OAuthError::new(
            ErrorCode::InvalidRequest,
            format!("unsupported requested_token_type {requested_token_type:?}"),
        )
        .into());
    }

    let scopes = match params.get("scope").filter(|v| !v.is_empty()) {
        Some(raw) => Scopes::parse(raw).map_err(|unknown| {
            OAuthError::new(ErrorCode::InvalidScope, format!("unknown scope {unknown:?}"))
        })?,
        None => Scopes::parse("openid").expect("static scope list"),
    };

    let identity = exchanger
        .token_identity(subject_token_type, subject_token)
        .await
        .map_err(OAuthError::from)?;

    let minted = state
        .tokens
        .mint(
            &client.id,
            &identity.claims,
            &scopes,
            "",
            &registered.id,
            true,
        )
        .await?;
    let refresh_token = state
        .tokens
        .create_refresh(
            &client.id,
            &identity.claims,
            &scopes,
            "",
            &registered.id,
            identity.connector_data.clone(),
        )
        .await?;

    let (access_token, issued_token_type) = if requested_token_type == TOKEN_TYPE_ID {
        (minted.id_token.clone(), TOKEN_TYPE_ID)
    } else {
        (minted.access_token.clone(), TOKEN_TYPE_ACCESS)
    };

    Ok(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: minted.expires_in,
        refresh_token,
        id_token: Some(minted.id_token),
        issued_token_type: Some(issued_token_type.to_string()),
    })
}
