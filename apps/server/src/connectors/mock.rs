//! A connector that authenticates a single configurable user.
//!
//! Implements every capability, which makes it the workhorse of the
//! integration suite and of development setups that need a login without an
//! upstream.

use std::collections::HashMap;

use serde::Deserialize;

use oxidp_shared::claims::Claims;
use oxidp_shared::scopes::Scopes;

use super::{
    CallbackConnector, Connector, ConnectorError, Identity, PasswordConnector, RefreshConnector,
    TokenExchangeConnector,
};

#[derive(Debug, Clone, Deserialize)]
pub struct MockConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default = "default_email")]
    pub email: String,
    #[serde(default = "default_email_verified")]
    pub email_verified: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Password accepted by the password capability.
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_user_id() -> String {
    "mock-user-id".to_string()
}
fn default_username() -> String {
    "Kilgore Trout".to_string()
}
fn default_email() -> String {
    "kilgore@kilgore.trout".to_string()
}
fn default_email_verified() -> bool {
    true
}
fn default_password() -> String {
    "password".to_string()
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            username: default_username(),
            preferred_username: String::new(),
            email: default_email(),
            email_verified: default_email_verified(),
            groups: Vec::new(),
            password: default_password(),
        }
    }
}

pub struct MockConnector {
    config: MockConfig,
}

impl MockConnector {
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self, String> {
        let config = match config {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|err| format!("mock connector config: {err}"))?,
            None => MockConfig::default(),
        };
        Ok(Self { config })
    }

    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    fn identity(&self) -> Identity {
        Identity {
            claims: Claims {
                user_id: self.config.user_id.clone(),
                username: self.config.username.clone(),
                preferred_username: self.config.preferred_username.clone(),
                email: self.config.email.clone(),
                email_verified: self.config.email_verified,
                groups: self.config.groups.clone(),
            },
            connector_data: None,
        }
    }
}

impl Connector for MockConnector {
    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        Some(self)
    }
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
    fn as_token_exchange(&self) -> Option<&dyn TokenExchangeConnector> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl CallbackConnector for MockConnector {
    fn login_url(
        &self,
        _scopes: &Scopes,
        callback_url: &str,
        state: &str,
    ) -> Result<String, ConnectorError> {
        let mut url = url::Url::parse(callback_url)
            .map_err(|err| ConnectorError::Retryable(format!("bad callback url: {err}")))?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(url.to_string())
    }

    async fn handle_callback(
        &self,
        _scopes: &Scopes,
        _params: &HashMap<String, String>,
    ) -> Result<Identity, ConnectorError> {
        Ok(self.identity())
    }
}

#[async_trait::async_trait]
impl PasswordConnector for MockConnector {
    fn prompt(&self) -> &str {
        "Email Address"
    }

    async fn login(
        &self,
        _scopes: &Scopes,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, ConnectorError> {
        if username == self.config.email && password == self.config.password {
            Ok(Some(self.identity()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl RefreshConnector for MockConnector {
    async fn refresh(
        &self,
        _scopes: &Scopes,
        _identity: Identity,
    ) -> Result<Identity, ConnectorError> {
        Ok(self.identity())
    }
}

#[async_trait::async_trait]
impl TokenExchangeConnector for MockConnector {
    async fn token_identity(
        &self,
        _subject_token_type: &str,
        subject_token: &str,
    ) -> Result<Identity, ConnectorError> {
        if subject_token.is_empty() {
            return Err(ConnectorError::Denied("empty subject token".into()));
        }
        Ok(self.identity())
    }
}
