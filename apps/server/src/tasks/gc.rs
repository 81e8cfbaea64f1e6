use std::sync::Arc;

use chrono::Utc;

use crate::storage::{GcResult, Storage, StorageError};

/// Delete every expired auth request, auth code, device request, and device
/// token. Called periodically (once at startup, then every `gc_interval`)
/// so abandoned flows do not accumulate.
pub async fn collect_garbage(storage: &Arc<dyn Storage>) -> Result<GcResult, StorageError> {
    storage.garbage_collect(Utc::now()).await
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use oxidp_shared::oauth::ResponseTypes;
    use oxidp_shared::scopes::Scopes;

    use super::*;
    use crate::storage::{new_id, AuthRequest, MemoryStorage};

    #[tokio::test]
    async fn collect_garbage_reports_deletion_counts() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .create_auth_request(AuthRequest {
                id: new_id(),
                client_id: "client-a".into(),
                response_types: ResponseTypes::CODE,
                scopes: Scopes::parse("openid").unwrap(),
                redirect_uri: "https://rp.example/cb".into(),
                nonce: String::new(),
                state: String::new(),
                force_approval_prompt: false,
                expiry: Utc::now() - Duration::minutes(5),
                logged_in: false,
                claims: None,
                connector_id: String::new(),
                connector_data: None,
                pkce: None,
            })
            .await
            .unwrap();

        let result = collect_garbage(&storage).await.unwrap();
        assert_eq!(result.auth_requests, 1);
        assert!(collect_garbage(&storage).await.unwrap().is_empty());
    }
}
