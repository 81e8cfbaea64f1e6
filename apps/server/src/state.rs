use std::sync::Arc;

use crate::config::ServerConfig;
use crate::connectors::ConnectorRegistry;
use crate::keys::KeyManager;
use crate::storage::Storage;
use crate::tokens::TokenBuilder;

/// Shared application state passed to all handlers via Axum's State
/// extractor. Everything is behind an `Arc`, so cloning is cheap and
/// handlers stay safe under concurrent invocation: mutable state lives
/// exclusively in storage.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub keys: Arc<KeyManager>,
    pub connectors: Arc<ConnectorRegistry>,
    pub tokens: Arc<TokenBuilder>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        keys: Arc<KeyManager>,
        connectors: Arc<ConnectorRegistry>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let tokens = Arc::new(TokenBuilder::new(
            config.issuer_base(),
            config.expiry.id_tokens(),
            Arc::clone(&keys),
            Arc::clone(&storage),
        ));
        Self {
            storage,
            keys,
            connectors,
            tokens,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_implements_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
