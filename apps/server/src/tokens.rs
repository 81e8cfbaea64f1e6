//! Token construction: ID/access token claims, PKCE checks, and the
//! refresh-token wire format.
//!
//! Secrets are only ever compared constant-time, and refresh secrets are
//! stored as sha256 hashes so a storage dump cannot be replayed against the
//! token endpoint.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use oxidp_shared::claims::Claims;
use oxidp_shared::oauth::ErrorCode;
use oxidp_shared::scopes::{
    Scopes, SCOPE_EMAIL, SCOPE_FEDERATED_ID, SCOPE_GROUPS, SCOPE_OFFLINE_ACCESS, SCOPE_PROFILE,
};

use crate::error::OAuthError;
use crate::keys::{sign_with, KeyManager, KeyPair, SigningAlgorithm};
use crate::storage::{
    new_id, new_secret, retry_read, OfflineSession, Pkce, RefreshToken, Storage, StorageError,
};

/// Compare two secrets without leaking a timing oracle. Differing lengths
/// short-circuit, which is fine: length is not secret here.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// sha256 of a refresh secret, base64url. This is what storage holds in
/// `RefreshToken.token` / `obsolete_token`.
pub fn hash_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

/// Check a PKCE `code_verifier` against the challenge captured at `/auth`.
pub fn verify_code_verifier(verifier: &str, pkce: &Pkce) -> bool {
    use crate::storage::CodeChallengeMethod;
    match pkce.code_challenge_method {
        CodeChallengeMethod::Plain => constant_time_eq(verifier, &pkce.code_challenge),
        CodeChallengeMethod::S256 => {
            let hashed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            constant_time_eq(&hashed, &pkce.code_challenge)
        }
    }
}

/// The two halves of a refresh token as handed to the client:
/// `"<id>.<base64url(secret)>"`. The id makes the storage lookup O(1); only
/// the secret half is sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenValue {
    pub id: String,
    pub secret: String,
}

impl RefreshTokenValue {
    /// Fresh id + secret, returning the secret's hash for storage.
    pub fn generate() -> (Self, String) {
        let value = Self {
            id: new_id(),
            secret: new_secret(),
        };
        let hash = hash_secret(&value.secret);
        (value, hash)
    }

    pub fn encode(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (id, secret) = raw.split_once('.')?;
        if id.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// `at_hash`: the left half of the access token's digest, base64url, using
/// the hash that matches the signing algorithm (SHA-256 for RS256, SHA-512
/// for Ed25519).
pub fn at_hash(access_token: &str, alg: SigningAlgorithm) -> String {
    match alg {
        SigningAlgorithm::Rs256 => {
            let digest = Sha256::digest(access_token.as_bytes());
            URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
        }
        SigningAlgorithm::EdDsa => {
            let digest = Sha512::digest(access_token.as_bytes());
            URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
        }
    }
}

/// `aud` is a bare string for a single audience and a JSON array otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn from_list(mut list: Vec<String>) -> Self {
        if list.len() == 1 {
            Audience::Single(list.remove(0))
        } else {
            Audience::Multiple(list)
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == client_id,
            Audience::Multiple(list) => list.iter().any(|aud| aud == client_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedClaims {
    pub connector_id: String,
    pub user_id: String,
}

/// Scope-gated identity claims, shared by ID and access tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federated_claims: Option<FederatedClaims>,
}

/// Release identity fields according to the granted scopes. `email` and
/// `email_verified` require the `email` scope; `name`/`preferred_username`
/// the `profile` scope; `groups` the `groups` scope; the federated identity
/// pair the `federated:id` scope.
pub fn identity_claims_for(claims: &Claims, scopes: &Scopes, connector_id: &str) -> IdentityClaims {
    let mut identity = IdentityClaims::default();
    if scopes.has(SCOPE_PROFILE) {
        if !claims.username.is_empty() {
            identity.name = Some(claims.username.clone());
        }
        if !claims.preferred_username.is_empty() {
            identity.preferred_username = Some(claims.preferred_username.clone());
        }
    }
    if scopes.has(SCOPE_EMAIL) && !claims.email.is_empty() {
        identity.email = Some(claims.email.clone());
        identity.email_verified = Some(claims.email_verified);
    }
    if scopes.has(SCOPE_GROUPS) && !claims.groups.is_empty() {
        identity.groups = Some(claims.groups.clone());
    }
    if scopes.has(SCOPE_FEDERATED_ID) {
        identity.federated_claims = Some(FederatedClaims {
            connector_id: connector_id.to_string(),
            user_id: claims.user_id.clone(),
        });
    }
    identity
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(flatten)]
    pub identity: IdentityClaims,
}

/// Access tokens are JWTs too. Opaque as far as relying parties are
/// concerned, but self-contained enough for `/userinfo` to answer without a
/// storage round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(flatten)]
    pub identity: IdentityClaims,
}

#[derive(Debug)]
pub struct MintedTokens {
    pub id_token: String,
    pub access_token: String,
    pub expires_in: i64,
}

/// Builds and signs the token pair for one authorization.
pub struct TokenBuilder {
    issuer: String,
    id_token_ttl: Duration,
    keys: Arc<KeyManager>,
    storage: Arc<dyn Storage>,
}

impl TokenBuilder {
    pub fn new(
        issuer: String,
        id_token_ttl: Duration,
        keys: Arc<KeyManager>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            issuer,
            id_token_ttl,
            keys,
            storage,
        }
    }

    /// Resolve the token audience: the requesting client plus every peer
    /// named by a cross-client scope. Each peer must list the requesting
    /// client among its `trusted_peers`.
    async fn resolve_audience(
        &self,
        client_id: &str,
        scopes: &Scopes,
    ) -> Result<(Audience, Option<String>), OAuthError> {
        let mut audiences = vec![client_id.to_string()];
        for peer in scopes.cross_client_audiences() {
            if peer == client_id {
                continue;
            }
            let storage = Arc::clone(&self.storage);
            let peer_for_read = peer.clone();
            let peer_client = retry_read(|| {
                let storage = Arc::clone(&storage);
                let peer = peer_for_read.clone();
                async move { storage.get_client(&peer).await }
            })
            .await
            .map_err(|err| match err {
                StorageError::NotFound => OAuthError::new(
                    ErrorCode::InvalidScope,
                    format!("audience peer {peer:?} is not a registered client"),
                ),
                other => other.into(),
            })?;
            if !peer_client.trusted_peers.iter().any(|p| p == client_id) {
                return Err(OAuthError::new(
                    ErrorCode::UnauthorizedClient,
                    format!("client is not a trusted peer of {peer:?}"),
                ));
            }
            audiences.push(peer);
        }
        audiences.dedup();

        let azp = (audiences.len() > 1).then(|| client_id.to_string());
        Ok((Audience::from_list(audiences), azp))
    }

    /// Build and sign the ID and access token for one grant. `with_at_hash`
    /// is set whenever the access token accompanies the ID token in the
    /// same response.
    pub async fn mint(
        &self,
        client_id: &str,
        claims: &Claims,
        scopes: &Scopes,
        nonce: &str,
        connector_id: &str,
        with_at_hash: bool,
    ) -> Result<MintedTokens, OAuthError> {
        let key: KeyPair = self.keys.signing_key().await?;
        let (aud, azp) = self.resolve_audience(client_id, scopes).await?;

        let now = Utc::now();
        let expiry = now + self.id_token_ttl;
        let identity = identity_claims_for(claims, scopes, connector_id);

        let access_claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: claims.user_id.clone(),
            aud: aud.clone(),
            exp: expiry.timestamp(),
            iat: now.timestamp(),
            scope: scopes.to_string(),
            azp: azp.clone(),
            identity: identity.clone(),
        };
        let access_token = sign_with(&key, &access_claims)?;

        let id_claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: claims.user_id.clone(),
            aud,
            exp: expiry.timestamp(),
            iat: now.timestamp(),
            azp,
            nonce: (!nonce.is_empty()).then(|| nonce.to_string()),
            at_hash: with_at_hash.then(|| at_hash(&access_token, key.alg)),
            identity,
        };
        let id_token = sign_with(&key, &id_claims)?;

        Ok(MintedTokens {
            id_token,
            access_token,
            expires_in: (expiry - now).num_seconds(),
        })
    }

    /// Mint a refresh token and register it in the user's offline session,
    /// if `offline_access` was granted. At most one refresh token stays
    /// live per (user, connector, client); the replaced one is deleted.
    pub async fn create_refresh(
        &self,
        client_id: &str,
        claims: &Claims,
        scopes: &Scopes,
        nonce: &str,
        connector_id: &str,
        connector_data: Option<serde_json::Value>,
    ) -> Result<Option<String>, OAuthError> {
        if !scopes.has(SCOPE_OFFLINE_ACCESS) {
            return Ok(None);
        }

        let (value, hash) = RefreshTokenValue::generate();
        let now = Utc::now();
        self.storage
            .create_refresh_token(RefreshToken {
                id: value.id.clone(),
                token: hash,
                obsolete_token: String::new(),
                client_id: client_id.to_string(),
                scopes: scopes.clone(),
                nonce: nonce.to_string(),
                claims: claims.clone(),
                connector_id: connector_id.to_string(),
                connector_data: connector_data.clone(),
                created_at: now,
                last_used: now,
            })
            .await?;

        let replaced = match self
            .storage
            .get_offline_session(&claims.user_id, connector_id)
            .await
        {
            Ok(session) => session.refresh_tokens.get(client_id).cloned(),
            Err(StorageError::NotFound) => {
                let mut refresh_tokens = std::collections::HashMap::new();
                refresh_tokens.insert(client_id.to_string(), value.id.clone());
                match self
                    .storage
                    .create_offline_session(OfflineSession {
                        user_id: claims.user_id.clone(),
                        connector_id: connector_id.to_string(),
                        refresh_tokens,
                        connector_data: connector_data.clone(),
                    })
                    .await
                {
                    Ok(()) => return Ok(Some(value.encode())),
                    // Lost a create race; fall through to the update path.
                    Err(StorageError::AlreadyExists) => None,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(old_id) = replaced {
            match self.storage.delete_refresh_token(&old_id).await {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let new_id = value.id.clone();
        let client_id = client_id.to_string();
        let connector_data_for_update = connector_data;
        self.storage
            .update_offline_session(
                &claims.user_id,
                connector_id,
                Box::new(move |mut session| {
                    session.refresh_tokens.insert(client_id, new_id);
                    session.connector_data = connector_data_for_update;
                    Ok(session)
                }),
            )
            .await?;

        Ok(Some(value.encode()))
    }
}
