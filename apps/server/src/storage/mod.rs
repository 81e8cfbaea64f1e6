//! Persistence contract for every long-lived entity of the provider.
//!
//! Backends implement [`Storage`]; the rest of the server only ever sees the
//! trait object. Mutations on versioned entities go through updater closures
//! with single-writer semantics: two concurrent updates on the same id are
//! serialized and the second closure observes the first one's result. Reads
//! may be stale with respect to in-flight updates but always return a
//! consistent snapshot.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use oxidp_shared::claims::Claims;
use oxidp_shared::oauth::ResponseTypes;
use oxidp_shared::scopes::Scopes;

use crate::keys::Keys;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("storage io: {0}")]
    Io(String),
}

impl StorageError {
    /// Transient failures may be retried; `NotFound`/`AlreadyExists` are
    /// definitive answers.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// An OAuth2 client application registered with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub secret: String,
    pub redirect_uris: Vec<String>,
    /// Clients allowed to mint tokens audienced at this client via the
    /// `audience:server:client_id:` scope.
    pub trusted_peers: Vec<String>,
    pub public: bool,
    pub name: String,
    pub logo_url: String,
}

/// PKCE parameters captured at the authorization endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pkce {
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

impl CodeChallengeMethod {
    pub fn from_param(raw: &str) -> Option<Self> {
        match raw {
            "plain" => Some(CodeChallengeMethod::Plain),
            "S256" => Some(CodeChallengeMethod::S256),
            _ => None,
        }
    }
}

/// One in-flight pass through the authorization endpoint.
///
/// Created when the relying party arrives at `/auth`, mutated exactly once to
/// attach the identity the connector produced, and consumed when the
/// authorization response is sent. Rows that never finish expire and are
/// garbage collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: String,
    pub client_id: String,
    pub response_types: ResponseTypes,
    pub scopes: Scopes,
    pub redirect_uri: String,
    pub nonce: String,
    pub state: String,
    pub force_approval_prompt: bool,
    pub expiry: DateTime<Utc>,
    pub logged_in: bool,
    pub claims: Option<Claims>,
    pub connector_id: String,
    pub connector_data: Option<serde_json::Value>,
    pub pkce: Option<Pkce>,
}

/// Single-use grant produced by a successful authorization. Redemption
/// deletes the row atomically with token issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCode {
    pub id: String,
    pub client_id: String,
    pub scopes: Scopes,
    pub nonce: String,
    pub redirect_uri: String,
    pub claims: Claims,
    pub connector_id: String,
    pub connector_data: Option<serde_json::Value>,
    pub expiry: DateTime<Utc>,
    pub pkce: Option<Pkce>,
}

/// A refresh token record. `token` and `obsolete_token` hold sha256 hashes of
/// the secret half of the wire value; the previous secret survives one
/// rotation so a client that lost the response to a network fault can retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    pub token: String,
    pub obsolete_token: String,
    pub client_id: String,
    pub scopes: Scopes,
    pub nonce: String,
    pub claims: Claims,
    pub connector_id: String,
    pub connector_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Per-(user, connector) session bookkeeping for offline access. Holds at
/// most one refresh id per client; replacement deletes the predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSession {
    pub user_id: String,
    pub connector_id: String,
    /// client id -> refresh token id
    pub refresh_tokens: HashMap<String, String>,
    pub connector_data: Option<serde_json::Value>,
}

/// The user-facing half of a device authorization, keyed by the short
/// human-typeable code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub user_code: String,
    pub device_code: String,
    pub client_id: String,
    pub scopes: Scopes,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTokenStatus {
    Pending,
    Complete,
    Denied,
}

/// The polling half of a device authorization, keyed by the long device
/// code. `token_response` is filled in when the browser side completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub device_code: String,
    pub client_id: String,
    pub status: DeviceTokenStatus,
    pub token_response: Option<serde_json::Value>,
    pub poll_interval_seconds: i64,
    pub last_poll: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub pkce: Option<Pkce>,
}

/// A local login credential, keyed by lowercased email. `hash` is an argon2
/// PHC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Password {
    pub email: String,
    pub hash: String,
    pub username: String,
    pub user_id: String,
}

/// Rows deleted by one garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    pub auth_requests: u64,
    pub auth_codes: u64,
    pub device_requests: u64,
    pub device_tokens: u64,
}

impl GcResult {
    pub fn is_empty(&self) -> bool {
        self.auth_requests == 0
            && self.auth_codes == 0
            && self.device_requests == 0
            && self.device_tokens == 0
    }
}

pub type AuthRequestUpdater = Box<dyn FnOnce(AuthRequest) -> Result<AuthRequest, StorageError> + Send>;
pub type ClientUpdater = Box<dyn FnOnce(Client) -> Result<Client, StorageError> + Send>;
pub type RefreshTokenUpdater = Box<dyn FnOnce(RefreshToken) -> Result<RefreshToken, StorageError> + Send>;
pub type OfflineSessionUpdater = Box<dyn FnOnce(OfflineSession) -> Result<OfflineSession, StorageError> + Send>;
pub type DeviceTokenUpdater = Box<dyn FnOnce(DeviceToken) -> Result<DeviceToken, StorageError> + Send>;
pub type PasswordUpdater = Box<dyn FnOnce(Password) -> Result<Password, StorageError> + Send>;
/// `None` is passed when no key set has been installed yet.
pub type KeysUpdater = Box<dyn FnOnce(Option<Keys>) -> Result<Keys, StorageError> + Send>;

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn create_client(&self, client: Client) -> Result<(), StorageError>;
    async fn get_client(&self, id: &str) -> Result<Client, StorageError>;
    async fn update_client(&self, id: &str, updater: ClientUpdater) -> Result<(), StorageError>;
    async fn delete_client(&self, id: &str) -> Result<(), StorageError>;

    async fn create_auth_request(&self, req: AuthRequest) -> Result<(), StorageError>;
    async fn get_auth_request(&self, id: &str) -> Result<AuthRequest, StorageError>;
    async fn update_auth_request(
        &self,
        id: &str,
        updater: AuthRequestUpdater,
    ) -> Result<(), StorageError>;
    async fn delete_auth_request(&self, id: &str) -> Result<(), StorageError>;

    async fn create_auth_code(&self, code: AuthCode) -> Result<(), StorageError>;
    async fn get_auth_code(&self, id: &str) -> Result<AuthCode, StorageError>;
    async fn delete_auth_code(&self, id: &str) -> Result<(), StorageError>;

    async fn create_refresh_token(&self, token: RefreshToken) -> Result<(), StorageError>;
    async fn get_refresh_token(&self, id: &str) -> Result<RefreshToken, StorageError>;
    async fn update_refresh_token(
        &self,
        id: &str,
        updater: RefreshTokenUpdater,
    ) -> Result<(), StorageError>;
    async fn delete_refresh_token(&self, id: &str) -> Result<(), StorageError>;

    async fn create_offline_session(&self, session: OfflineSession) -> Result<(), StorageError>;
    async fn get_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<OfflineSession, StorageError>;
    async fn update_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
        updater: OfflineSessionUpdater,
    ) -> Result<(), StorageError>;
    async fn delete_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<(), StorageError>;

    async fn create_device_request(&self, req: DeviceRequest) -> Result<(), StorageError>;
    async fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest, StorageError>;

    async fn create_device_token(&self, token: DeviceToken) -> Result<(), StorageError>;
    async fn get_device_token(&self, device_code: &str) -> Result<DeviceToken, StorageError>;
    async fn update_device_token(
        &self,
        device_code: &str,
        updater: DeviceTokenUpdater,
    ) -> Result<(), StorageError>;
    async fn delete_device_token(&self, device_code: &str) -> Result<(), StorageError>;

    async fn create_password(&self, password: Password) -> Result<(), StorageError>;
    async fn get_password(&self, email: &str) -> Result<Password, StorageError>;
    async fn update_password(&self, email: &str, updater: PasswordUpdater) -> Result<(), StorageError>;
    async fn delete_password(&self, email: &str) -> Result<(), StorageError>;

    async fn get_keys(&self) -> Result<Keys, StorageError>;
    async fn update_keys(&self, updater: KeysUpdater) -> Result<(), StorageError>;

    /// Remove every expirable row whose `expiry < now`.
    async fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult, StorageError>;
}

/// Opaque entity id: 16 bytes of cryptographic randomness, base64url.
pub fn new_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Long-lived secret: 32 bytes of cryptographic randomness, base64url.
pub fn new_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

const READ_RETRY_BACKOFF_MS: u64 = 100;

/// Run an idempotent read, retrying once after a short backoff if the
/// backend reports a transient failure.
pub async fn retry_read<T, F, Fut>(op: F) -> Result<T, StorageError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StorageError>>,
{
    match op().await {
        Err(err) if err.is_transient() => {
            tracing::debug!(error = %err, "transient storage read failure, retrying");
            tokio::time::sleep(std::time::Duration::from_millis(READ_RETRY_BACKOFF_MS)).await;
            op().await
        }
        other => other,
    }
}
