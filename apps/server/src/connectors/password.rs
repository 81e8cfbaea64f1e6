//! Local password connector backed by the storage `Password` rows.

use std::sync::Arc;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};

use oxidp_shared::claims::Claims;
use oxidp_shared::scopes::Scopes;

use super::{Connector, ConnectorError, Identity, PasswordConnector, RefreshConnector};
use crate::storage::{Password, Storage, StorageError};

pub struct PasswordDbConnector {
    storage: Arc<dyn Storage>,
}

impl PasswordDbConnector {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn identity_for(&self, row: &Password) -> Identity {
        Identity {
            claims: Claims {
                user_id: row.user_id.clone(),
                username: row.username.clone(),
                preferred_username: row.username.clone(),
                email: row.email.clone(),
                // Local accounts are provisioned by the operator; the
                // address is taken as verified.
                email_verified: true,
                groups: Vec::new(),
            },
            connector_data: None,
        }
    }
}

impl Connector for PasswordDbConnector {
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

fn verify_hash(password: &str, phc_hash: &str) -> Result<bool, ConnectorError> {
    let parsed = PasswordHash::new(phc_hash)
        .map_err(|err| ConnectorError::Retryable(format!("stored hash unparsable: {err}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[async_trait::async_trait]
impl PasswordConnector for PasswordDbConnector {
    fn prompt(&self) -> &str {
        "Email Address"
    }

    async fn login(
        &self,
        _scopes: &Scopes,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, ConnectorError> {
        let row = match self.storage.get_password(username).await {
            Ok(row) => row,
            Err(StorageError::NotFound) => return Ok(None),
            Err(err) => return Err(ConnectorError::Retryable(err.to_string())),
        };
        if verify_hash(password, &row.hash)? {
            Ok(Some(self.identity_for(&row)))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl RefreshConnector for PasswordDbConnector {
    async fn refresh(
        &self,
        _scopes: &Scopes,
        identity: Identity,
    ) -> Result<Identity, ConnectorError> {
        // Re-read the row so email or username edits show up in refreshed
        // tokens; a removed account ends the session.
        let row = match self.storage.get_password(&identity.claims.email).await {
            Ok(row) => row,
            Err(StorageError::NotFound) => {
                return Err(ConnectorError::Denied("account no longer exists".into()))
            }
            Err(err) => return Err(ConnectorError::Retryable(err.to_string())),
        };
        if row.user_id != identity.claims.user_id {
            return Err(ConnectorError::Denied("account was replaced".into()));
        }
        Ok(self.identity_for(&row))
    }
}

/// Hash a plaintext password into an argon2 PHC string. Used when loading
/// static password entries that are configured in plaintext.
pub fn hash_password(plain: &str) -> Result<String, String> {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::SaltString;
    use argon2::PasswordHasher;

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    async fn seeded_connector() -> PasswordDbConnector {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .create_password(Password {
                email: "alice@example.com".into(),
                hash: hash_password("pw").unwrap(),
                username: "alice".into(),
                user_id: "alice-user-id".into(),
            })
            .await
            .unwrap();
        PasswordDbConnector::new(storage)
    }

    #[tokio::test]
    async fn valid_credentials_return_identity() {
        let connector = seeded_connector().await;
        let identity = connector
            .login(&Scopes::default(), "alice@example.com", "pw")
            .await
            .unwrap()
            .expect("valid credentials");
        assert_eq!(identity.claims.user_id, "alice-user-id");
        assert_eq!(identity.claims.email, "alice@example.com");
        assert!(identity.claims.email_verified);
    }

    #[tokio::test]
    async fn wrong_password_returns_none() {
        let connector = seeded_connector().await;
        let result = connector
            .login(&Scopes::default(), "alice@example.com", "wrong")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unknown_user_returns_none() {
        let connector = seeded_connector().await;
        let result = connector
            .login(&Scopes::default(), "bob@example.com", "pw")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn login_is_case_insensitive_on_email() {
        let connector = seeded_connector().await;
        let result = connector
            .login(&Scopes::default(), "Alice@Example.COM", "pw")
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn refresh_picks_up_username_changes() {
        let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        storage
            .create_password(Password {
                email: "alice@example.com".into(),
                hash: hash_password("pw").unwrap(),
                username: "alice".into(),
                user_id: "alice-user-id".into(),
            })
            .await
            .unwrap();
        let connector = PasswordDbConnector::new(Arc::clone(&storage) as Arc<dyn Storage>);

        let identity = connector
            .login(&Scopes::default(), "alice@example.com", "pw")
            .await
            .unwrap()
            .unwrap();

        storage
            .update_password(
                "alice@example.com",
                Box::new(|mut p| {
                    p.username = "alice-renamed".into();
                    Ok(p)
                }),
            )
            .await
            .unwrap();

        let refreshed = connector
            .refresh(&Scopes::default(), identity)
            .await
            .unwrap();
        assert_eq!(refreshed.claims.username, "alice-renamed");
    }

    #[tokio::test]
    async fn refresh_denies_removed_accounts() {
        let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        storage
            .create_password(Password {
                email: "alice@example.com".into(),
                hash: hash_password("pw").unwrap(),
                username: "alice".into(),
                user_id: "alice-user-id".into(),
            })
            .await
            .unwrap();
        let connector = PasswordDbConnector::new(Arc::clone(&storage) as Arc<dyn Storage>);

        let identity = connector
            .login(&Scopes::default(), "alice@example.com", "pw")
            .await
            .unwrap()
            .unwrap();

        storage.delete_password("alice@example.com").await.unwrap();

        let err = connector
            .refresh(&Scopes::default(), identity)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Denied(_)));
    }
}
