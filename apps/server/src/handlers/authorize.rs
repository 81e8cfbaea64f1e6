//! The authorization-request lifecycle: `/auth` parsing and validation,
//! connector selection and login, the upstream callback, consent, and the
//! final authorization response.
//!
//! Failure routing follows the protocol contract: anything before the
//! client and redirect URI are verified renders a local error page (we
//! never redirect to an unverified URI); afterwards errors travel back to
//! the relying party as `error=...&state=...`.

use std::collections::HashMap;

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;

use oxidp_shared::oauth::{ErrorCode, ResponseTypes};
use oxidp_shared::scopes::{Scopes, SCOPE_OPENID};

use crate::connectors::{ConnectorError, Identity};
use crate::error::{found, redirect_with_error, OAuthError};
use crate::pages;
use crate::state::AppState;
use crate::storage::{
    new_id, retry_read, AuthCode, AuthRequest, CodeChallengeMethod, Pkce, StorageError,
};
use crate::validation::validate_redirect_uri;

/// Sentinel redirect URI that routes a finished device-flow authorization
/// to the internal completion handler instead of a relying party.
pub const DEVICE_CALLBACK_URI: &str = "/device/callback";

#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Pre-selects a connector, skipping the chooser.
    pub connector_id: Option<String>,
    pub approval_prompt: Option<String>,
    pub prompt: Option<String>,
}

/// GET /auth
pub async fn authorize(
    State(state): State<AppState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    handle_authorize(state, params).await
}

/// POST /auth
pub async fn authorize_post(
    State(state): State<AppState>,
    Form(params): Form<AuthorizeParams>,
) -> Response {
    handle_authorize(state, params).await
}

async fn handle_authorize(state: AppState, params: AuthorizeParams) -> Response {
    // 1. Required fields; nothing to redirect to yet, so render errors.
    let client_id = match params.client_id.as_deref() {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "missing client_id parameter",
            )
        }
    };
    let redirect_uri = match params.redirect_uri.as_deref() {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "missing redirect_uri parameter",
            )
        }
    };

    // 2. Client check. An unknown client or unregistered redirect URI must
    //    never produce a redirect.
    let storage = state.storage.clone();
    let lookup_id = client_id.clone();
    let client = match retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_client(&id).await }
    })
    .await
    {
        Ok(client) => client,
        Err(StorageError::NotFound) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "unknown client id",
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "client lookup failed");
            return pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            );
        }
    };
    if !validate_redirect_uri(&client, &redirect_uri) {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "unregistered redirect_uri",
        );
    }

    // 3. Response type and scope checks; failures redirect from here on.
    let req_state = params.state.clone().unwrap_or_default();
    let response_type_raw = params.response_type.as_deref().unwrap_or("");
    if response_type_raw.trim().is_empty() {
        return redirect_with_error(
            &redirect_uri,
            &req_state,
            &OAuthError::new(ErrorCode::InvalidRequest, "missing response_type parameter"),
            false,
        );
    }
    let response_types = match ResponseTypes::parse(response_type_raw) {
        Ok(types) => types,
        Err(unknown) => {
            return redirect_with_error(
                &redirect_uri,
                &req_state,
                &OAuthError::new(
                    ErrorCode::UnsupportedResponseType,
                    format!("unknown response type {unknown:?}"),
                ),
                false,
            )
        }
    };
    if !response_types.is_supported() {
        return redirect_with_error(
            &redirect_uri,
            &req_state,
            &OAuthError::code(ErrorCode::UnsupportedResponseType),
            false,
        );
    }
    let fragment = response_types.uses_fragment();

    let scopes = match Scopes::parse(params.scope.as_deref().unwrap_or("")) {
        Ok(scopes) => scopes,
        Err(unknown) => {
            return redirect_with_error(
                &redirect_uri,
                &req_state,
                &OAuthError::new(ErrorCode::InvalidScope, format!("unknown scope {unknown:?}")),
                fragment,
            )
        }
    };
    if !scopes.has(SCOPE_OPENID) {
        return redirect_with_error(
            &redirect_uri,
            &req_state,
            &OAuthError::new(ErrorCode::InvalidScope, "missing required scope \"openid\""),
            fragment,
        );
    }

    let nonce = params.nonce.clone().unwrap_or_default();
    if response_types.contains(ResponseTypes::ID_TOKEN) && fragment && nonce.is_empty() {
        return redirect_with_error(
            &redirect_uri,
            &req_state,
            &OAuthError::new(ErrorCode::InvalidRequest, "implicit flow requires a nonce"),
            fragment,
        );
    }

    let pkce = match params.code_challenge.as_deref() {
        None | Some("") => None,
        Some(challenge) => {
            let method = params.code_challenge_method.as_deref().unwrap_or("plain");
            match CodeChallengeMethod::from_param(method) {
                Some(method) => Some(Pkce {
                    code_challenge: challenge.to_string(),
                    code_challenge_method: method,
                }),
                None => {
                    return redirect_with_error(
                        &redirect_uri,
                        &req_state,
                        &OAuthError::new(
                            ErrorCode::InvalidRequest,
                            format!("unsupported code_challenge_method {method:?}"),
                        ),
                        fragment,
                    )
                }
            }
        }
    };

    let force_approval = params.approval_prompt.as_deref() == Some("force")
        || params.prompt.as_deref() == Some("consent");

    // 4. Persist the request; the login step mutates it exactly once.
    let auth_request = AuthRequest {
        id: new_id(),
        client_id,
        response_types,
        scopes,
        redirect_uri: redirect_uri.clone(),
        nonce,
        state: req_state.clone(),
        force_approval_prompt: force_approval,
        expiry: Utc::now() + state.config.expiry.auth_requests(),
        logged_in: false,
        claims: None,
        connector_id: String::new(),
        connector_data: None,
        pkce,
    };
    if let Err(err) = state.storage.create_auth_request(auth_request.clone()).await {
        return redirect_with_error(&redirect_uri, &req_state, &err.into(), fragment);
    }

    // 5. Connector selection.
    if let Some(connector_id) = params.connector_id.as_deref() {
        if state.connectors.get(connector_id).is_some() {
            return found(&format!("/auth/{connector_id}?req={}", auth_request.id));
        }
        return pages::error_page(
            StatusCode::NOT_FOUND,
            "Not found",
            "unknown connector id",
        );
    }
    connector_selection(&state, &auth_request.id)
}

/// Either redirect straight to the single configured connector or render
/// the chooser. Shared with the device-flow verification path.
pub(crate) fn connector_selection(state: &AppState, auth_req_id: &str) -> Response {
    if state.connectors.is_empty() {
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server error",
            "no connectors are configured",
        );
    }
    if state.connectors.len() == 1 && !state.config.oauth2.always_show_login_screen {
        let connector_id = &state.connectors.all()[0].id;
        return found(&format!("/auth/{connector_id}?req={auth_req_id}"));
    }
    pages::connector_chooser(state.connectors.all(), auth_req_id)
}

#[derive(Debug, Deserialize)]
pub struct ReqQuery {
    pub req: Option<String>,
}

/// Load a live auth request or produce the page describing why we cannot.
async fn load_auth_request(state: &AppState, id: &str) -> Result<AuthRequest, Response> {
    let storage = state.storage.clone();
    let lookup_id = id.to_string();
    match retry_read(|| {
        let storage = storage.clone();
        let id = lookup_id.clone();
        async move { storage.get_auth_request(&id).await }
    })
    .await
    {
        Ok(req) if req.expiry > Utc::now() => Ok(req),
        Ok(_) => Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Login session expired",
            "restart the login flow from your application",
        )),
        Err(StorageError::NotFound) => Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Invalid login session",
            "restart the login flow from your application",
        )),
        Err(err) => {
            tracing::warn!(error = %err, "auth request lookup failed");
            Err(pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            ))
        }
    }
}

/// GET /auth/{connector} — start the login step with one connector.
pub async fn connector_login(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
    Query(query): Query<ReqQuery>,
) -> Response {
    let Some(req_id) = query.req else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing req parameter",
        );
    };
    let auth_request = match load_auth_request(&state, &req_id).await {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(registered) = state.connectors.get(&connector_id) else {
        return pages::error_page(StatusCode::NOT_FOUND, "Not found", "unknown connector id");
    };

    // Remember which connector is driving this request so the callback can
    // find it again.
    let selected = connector_id.clone();
    if let Err(err) = state
        .storage
        .update_auth_request(
            &req_id,
            Box::new(move |mut req| {
                req.connector_id = selected;
                Ok(req)
            }),
        )
        .await
    {
        tracing::warn!(error = %err, "failed to persist connector selection");
        return pages::error_page(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service unavailable",
            "please try again later",
        );
    }

    if let Some(callback) = registered.connector.as_callback() {
        let callback_url = format!("{}/callback", state.config.issuer_base());
        return match callback.login_url(&auth_request.scopes, &callback_url, &req_id) {
            Ok(url) => found(&url),
            Err(err) => {
                tracing::warn!(error = %err, connector = %connector_id, "login_url failed");
                pages::error_page(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service unavailable",
                    "upstream identity provider is unavailable",
                )
            }
        };
    }
    if let Some(password) = registered.connector.as_password() {
        return pages::password_form(&connector_id, &req_id, password.prompt(), false);
    }
    pages::error_page(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Server error",
        "connector does not support interactive login",
    )
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

/// POST /auth/{connector}/login — password form submission.
pub async fn password_login(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
    Query(query): Query<ReqQuery>,
    Form(form): Form<PasswordForm>,
) -> Response {
    let Some(req_id) = query.req else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing req parameter",
        );
    };
    let auth_request = match load_auth_request(&state, &req_id).await {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(registered) = state.connectors.get(&connector_id) else {
        return pages::error_page(StatusCode::NOT_FOUND, "Not found", "unknown connector id");
    };
    let Some(password) = registered.connector.as_password() else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "connector does not support password login",
        );
    };

    match password
        .login(&auth_request.scopes, &form.login, &form.password)
        .await
    {
        Ok(Some(identity)) => finish_login(&state, &auth_request, &connector_id, identity).await,
        Ok(None) => pages::password_form(&connector_id, &req_id, password.prompt(), true),
        Err(ConnectorError::Retryable(detail)) => {
            tracing::warn!(error = %detail, connector = %connector_id, "password login upstream failure");
            pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "upstream identity provider is unavailable",
            )
        }
        Err(err @ ConnectorError::Denied(_)) => redirect_with_error(
            &auth_request.redirect_uri,
            &auth_request.state,
            &err.into(),
            auth_request.response_types.uses_fragment(),
        ),
    }
}

/// GET /callback — upstream redirect back from a callback connector. The
/// auth request id rode along in the `state` parameter.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(req_id) = params.get("state").cloned() else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing state parameter",
        );
    };
    let auth_request = match load_auth_request(&state, &req_id).await {
        Ok(req) => req,
        Err(response) => return response,
    };
    let Some(registered) = state.connectors.get(&auth_request.connector_id) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "login session has no connector attached",
        );
    };
    let Some(callback) = registered.connector.as_callback() else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "connector does not support callbacks",
        );
    };

    if let Some(upstream_error) = params.get("error") {
        tracing::info!(
            connector = %auth_request.connector_id,
            error = %upstream_error,
            "upstream reported an authorization error"
        );
        return redirect_with_error(
            &auth_request.redirect_uri,
            &auth_request.state,
            &OAuthError::code(ErrorCode::AccessDenied),
            auth_request.response_types.uses_fragment(),
        );
    }

    match callback.handle_callback(&auth_request.scopes, &params).await {
        Ok(identity) => {
            let connector_id = auth_request.connector_id.clone();
            finish_login(&state, &auth_request, &connector_id, identity).await
        }
        Err(err) => redirect_with_error(
            &auth_request.redirect_uri,
            &auth_request.state,
            &err.into(),
            auth_request.response_types.uses_fragment(),
        ),
    }
}

/// Attach the identity to the auth request. This is the single permitted
/// mutation of the row: a second login attempt against the same request is
/// refused.
async fn finish_login(
    state: &AppState,
    auth_request: &AuthRequest,
    connector_id: &str,
    identity: Identity,
) -> Response {
    let connector_id = connector_id.to_string();
    let result = state
        .storage
        .update_auth_request(
            &auth_request.id,
            Box::new(move |mut req| {
                if req.logged_in {
                    return Err(StorageError::AlreadyExists);
                }
                req.logged_in = true;
                req.claims = Some(identity.claims);
                req.connector_id = connector_id;
                req.connector_data = identity.connector_data;
                Ok(req)
            }),
        )
        .await;

    match result {
        Ok(()) => found(&format!("/approval?req={}", auth_request.id)),
        Err(StorageError::AlreadyExists) => pages::error_page(
            StatusCode::BAD_REQUEST,
            "Invalid login session",
            "this login session was already completed",
        ),
        Err(StorageError::NotFound) => pages::error_page(
            StatusCode::BAD_REQUEST,
            "Invalid login session",
            "restart the login flow from your application",
        ),
        Err(err) => {
            tracing::warn!(error = %err, "failed to attach identity");
            pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            )
        }
    }
}

/// GET /approval — consent step after a successful login.
pub async fn approval(State(state): State<AppState>, Query(query): Query<ReqQuery>) -> Response {
    let Some(req_id) = query.req else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing req parameter",
        );
    };
    let auth_request = match load_auth_request(&state, &req_id).await {
        Ok(req) => req,
        Err(response) => return response,
    };
    if !auth_request.logged_in {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "login has not completed yet",
        );
    }

    if state.config.oauth2.skip_approval_screen && !auth_request.force_approval_prompt {
        return finalize(&state, auth_request).await;
    }

    let client_name = match state.storage.get_client(&auth_request.client_id).await {
        Ok(client) if !client.name.is_empty() => client.name,
        _ => auth_request.client_id.clone(),
    };
    pages::approval_form(&auth_request.id, &client_name, &auth_request.scopes.0)
}

#[derive(Debug, Deserialize)]
pub struct ApprovalForm {
    #[serde(default)]
    pub approval: String,
}

/// POST /approval — the user granted or denied access.
pub async fn approval_post(
    State(state): State<AppState>,
    Query(query): Query<ReqQuery>,
    Form(form): Form<ApprovalForm>,
) -> Response {
    let Some(req_id) = query.req else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "missing req parameter",
        );
    };
    let auth_request = match load_auth_request(&state, &req_id).await {
        Ok(req) => req,
        Err(response) => return response,
    };
    if !auth_request.logged_in {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "login has not completed yet",
        );
    }

    if form.approval != "approve" {
        return redirect_with_error(
            &auth_request.redirect_uri,
            &auth_request.state,
            &OAuthError::new(ErrorCode::AccessDenied, "user denied the request"),
            auth_request.response_types.uses_fragment(),
        );
    }
    finalize(&state, auth_request).await
}

/// Consume the auth request and send the authorization response. Deleting
/// the row first makes consumption the single terminal transition; a
/// concurrent finalize of the same request loses the delete and fails.
async fn finalize(state: &AppState, auth_request: AuthRequest) -> Response {
    match state.storage.delete_auth_request(&auth_request.id).await {
        Ok(()) => {}
        Err(StorageError::NotFound) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Invalid login session",
                "this login session was already used",
            )
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to consume auth request");
            return pages::error_page(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "please try again later",
            );
        }
    }

    let Some(claims) = auth_request.claims.clone() else {
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server error",
            "login session has no identity attached",
        );
    };
    let fragment = auth_request.response_types.uses_fragment();
    let mut pairs: Vec<(&str, String)> = Vec::new();

    if auth_request.response_types.contains(ResponseTypes::CODE) {
        let code = AuthCode {
            id: new_id(),
            client_id: auth_request.client_id.clone(),
            scopes: auth_request.scopes.clone(),
            nonce: auth_request.nonce.clone(),
            redirect_uri: auth_request.redirect_uri.clone(),
            claims: claims.clone(),
            connector_id: auth_request.connector_id.clone(),
            connector_data: auth_request.connector_data.clone(),
            expiry: Utc::now() + state.config.expiry.auth_codes(),
            pkce: auth_request.pkce.clone(),
        };
        let code_id = code.id.clone();
        if let Err(err) = state.storage.create_auth_code(code).await {
            return redirect_with_error(
                &auth_request.redirect_uri,
                &auth_request.state,
                &err.into(),
                fragment,
            );
        }
        pairs.push(("code", code_id));
    }

    if auth_request.response_types.contains(ResponseTypes::ID_TOKEN)
        || auth_request.response_types.contains(ResponseTypes::TOKEN)
    {
        let with_access_token = auth_request.response_types.contains(ResponseTypes::TOKEN);
        let minted = match state
            .tokens
            .mint(
                &auth_request.client_id,
                &claims,
                &auth_request.scopes,
                &auth_request.nonce,
                &auth_request.connector_id,
                with_access_token,
            )
            .await
        {
            Ok(minted) => minted,
            Err(err) => {
                return redirect_with_error(
                    &auth_request.redirect_uri,
                    &auth_request.state,
                    &err,
                    fragment,
                )
            }
        };
        if with_access_token {
            pairs.push(("access_token", minted.access_token));
            pairs.push(("token_type", "bearer".to_string()));
            pairs.push(("expires_in", minted.expires_in.to_string()));
        }
        if auth_request.response_types.contains(ResponseTypes::ID_TOKEN) {
            pairs.push(("id_token", minted.id_token));
        }
    }

    if !auth_request.state.is_empty() {
        pairs.push(("state", auth_request.state.clone()));
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    let encoded = serializer.finish();

    let separator = if fragment {
        "#"
    } else if auth_request.redirect_uri.contains('?') {
        "&"
    } else {
        "?"
    };
    found(&format!("{}{}{}", auth_request.redirect_uri, separator, encoded))
}
