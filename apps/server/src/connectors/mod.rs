//! Pluggable upstream authentication.
//!
//! A connector translates some upstream protocol into an [`Identity`]. Each
//! capability is its own small trait; a connector advertises what it
//! supports through the `as_*` accessors on [`Connector`], and callers
//! dispatch by capability check rather than by concrete type. Instances are
//! built once from configuration and are read-only afterwards; anything a
//! connector needs to cache it locks internally.

use std::collections::HashMap;
use std::sync::Arc;

use oxidp_shared::claims::Claims;
use oxidp_shared::scopes::Scopes;

use crate::config::ConnectorConfig;
use crate::storage::Storage;

pub mod mock;
pub mod password;

pub use mock::MockConnector;
pub use password::PasswordDbConnector;

/// The identity an upstream asserted for the end user. `connector_data` is
/// an opaque blob the connector round-trips through storage — upstream
/// access or refresh tokens live there without the core ever looking
/// inside, and without exposing them to relying parties.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub claims: Claims,
    pub connector_data: Option<serde_json::Value>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// The upstream failed in a way worth retrying (5xx, timeout). Maps to
    /// `temporarily_unavailable` at the protocol boundary.
    #[error("upstream unavailable: {0}")]
    Retryable(String),

    /// The upstream rejected the user. Maps to `access_denied`.
    #[error("access denied: {0}")]
    Denied(String),
}

/// Redirect-based login against an upstream provider.
#[async_trait::async_trait]
pub trait CallbackConnector: Send + Sync {
    /// The URL to send the user agent to. `state` must round-trip through
    /// the upstream and come back on the callback.
    fn login_url(
        &self,
        scopes: &Scopes,
        callback_url: &str,
        state: &str,
    ) -> Result<String, ConnectorError>;

    /// Consume the upstream's redirect back to `/callback`.
    async fn handle_callback(
        &self,
        scopes: &Scopes,
        params: &HashMap<String, String>,
    ) -> Result<Identity, ConnectorError>;
}

/// Username/password login rendered by the provider itself.
#[async_trait::async_trait]
pub trait PasswordConnector: Send + Sync {
    /// Label for the username field of the login form.
    fn prompt(&self) -> &str;

    /// `Ok(None)` means the credentials were simply wrong; errors are
    /// reserved for upstream failures.
    async fn login(
        &self,
        scopes: &Scopes,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, ConnectorError>;
}

/// Re-query the upstream during token refresh so group and email changes
/// propagate into new tokens.
#[async_trait::async_trait]
pub trait RefreshConnector: Send + Sync {
    async fn refresh(&self, scopes: &Scopes, identity: Identity)
        -> Result<Identity, ConnectorError>;
}

/// RFC 8693 token exchange: turn a subject token from a trusted issuer into
/// an identity.
#[async_trait::async_trait]
pub trait TokenExchangeConnector: Send + Sync {
    async fn token_identity(
        &self,
        subject_token_type: &str,
        subject_token: &str,
    ) -> Result<Identity, ConnectorError>;
}

/// Base trait every connector implements. Capabilities default to absent;
/// implementations override the accessors for what they actually support.
/// Teardown is handled by `Drop`.
pub trait Connector: Send + Sync {
    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        None
    }
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        None
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        None
    }
    fn as_token_exchange(&self) -> Option<&dyn TokenExchangeConnector> {
        None
    }
}

/// A configured connector instance.
#[derive(Clone)]
pub struct RegisteredConnector {
    pub id: String,
    pub name: String,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for RegisteredConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredConnector")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// All connectors, in configuration order (the login chooser preserves it).
#[derive(Debug)]
pub struct ConnectorRegistry {
    connectors: Vec<RegisteredConnector>,
}

impl ConnectorRegistry {
    pub fn from_config(
        configs: &[ConnectorConfig],
        storage: Arc<dyn Storage>,
    ) -> Result<Self, String> {
        let mut connectors: Vec<RegisteredConnector> = Vec::with_capacity(configs.len());
        for config in configs {
            if config.id.is_empty() {
                return Err("connector is missing an id".into());
            }
            if connectors.iter().any(|c| c.id == config.id) {
                return Err(format!("duplicate connector id {:?}", config.id));
            }
            let connector: Arc<dyn Connector> = match config.type_.as_str() {
                "mock" => Arc::new(MockConnector::from_config(config.config.as_ref())?),
                "local" => Arc::new(PasswordDbConnector::new(Arc::clone(&storage))),
                other => {
                    return Err(format!(
                        "unknown connector type {:?} for connector {:?}",
                        other, config.id
                    ))
                }
            };
            connectors.push(RegisteredConnector {
                id: config.id.clone(),
                name: if config.name.is_empty() {
                    config.id.clone()
                } else {
                    config.name.clone()
                },
                connector,
            });
        }
        Ok(Self { connectors })
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredConnector> {
        self.connectors.iter().find(|c| c.id == id)
    }

    pub fn all(&self) -> &[RegisteredConnector] {
        &self.connectors
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn registry(configs: &[ConnectorConfig]) -> Result<ConnectorRegistry, String> {
        ConnectorRegistry::from_config(configs, Arc::new(MemoryStorage::new()))
    }

    fn mock_config(id: &str) -> ConnectorConfig {
        ConnectorConfig {
            type_: "mock".into(),
            id: id.into(),
            name: format!("Mock {id}"),
            config: None,
        }
    }

    #[test]
    fn builds_connectors_in_config_order() {
        let registry = registry(&[mock_config("a"), mock_config("b")]).unwrap();
        let ids: Vec<&str> = registry.all().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = registry(&[mock_config("a"), mock_config("a")]).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn rejects_unknown_type() {
        let config = ConnectorConfig {
            type_: "saml".into(),
            id: "upstream".into(),
            name: String::new(),
            config: None,
        };
        let err = registry(&[config]).unwrap_err();
        assert!(err.contains("unknown connector type"));
    }

    #[test]
    fn name_falls_back_to_id() {
        let config = ConnectorConfig {
            type_: "mock".into(),
            id: "mock".into(),
            name: String::new(),
            config: None,
        };
        let registry = registry(&[config]).unwrap();
        assert_eq!(registry.get("mock").unwrap().name, "mock");
    }

    #[test]
    fn capability_dispatch_defaults_to_none() {
        struct Bare;
        impl Connector for Bare {}
        let bare = Bare;
        assert!(bare.as_callback().is_none());
        assert!(bare.as_password().is_none());
        assert!(bare.as_refresh().is_none());
        assert!(bare.as_token_exchange().is_none());
    }
}
