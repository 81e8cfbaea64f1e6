use axum::extract::State;
use axum::Json;

use oxidp_shared::api::discovery::ProviderMetadata;
use oxidp_shared::oauth::{GrantType, ResponseTypes};
use oxidp_shared::scopes::Scopes;

use crate::error::{OAuthError, TokenEndpointError};
use crate::state::AppState;

/// GET /.well-known/openid-configuration
pub async fn configuration(State(state): State<AppState>) -> Json<ProviderMetadata> {
    let issuer = state.config.issuer_base();
    Json(ProviderMetadata {
        authorization_endpoint: format!("{issuer}/auth"),
        token_endpoint: format!("{issuer}/token"),
        jwks_uri: format!("{issuer}/keys"),
        userinfo_endpoint: format!("{issuer}/userinfo"),
        device_authorization_endpoint: format!("{issuer}/device"),
        issuer,
        response_types_supported: ResponseTypes::supported_combinations(),
        subject_types_supported: vec!["public".to_string()],
        id_token_signing_alg_values_supported: vec![state.config.signing_algorithm.clone()],
        scopes_supported: Scopes::supported(),
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic".to_string(),
            "client_secret_post".to_string(),
        ],
        claims_supported: vec![
            "iss", "sub", "aud", "iat", "exp", "nonce", "at_hash", "name",
            "preferred_username", "email", "email_verified", "groups",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        grant_types_supported: GrantType::all().into_iter().map(String::from).collect(),
        code_challenge_methods_supported: vec!["plain".to_string(), "S256".to_string()],
    })
}

/// GET /keys — the JWKS document: the active signing key plus every
/// still-trusted verification key.
pub async fn jwks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, TokenEndpointError> {
    let keys = state
        .keys
        .jwks()
        .await
        .map_err(|err| TokenEndpointError(OAuthError::from(err)))?;
    Ok(Json(serde_json::json!({ "keys": keys })))
}
