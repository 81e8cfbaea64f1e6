//! In-memory storage backend.
//!
//! Backs tests, development setups, and single-node deployments that can
//! afford to lose state on restart. The dashmap entry lock is held for the
//! duration of each updater closure, which provides the single-writer
//! contract without any further coordination.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::keys::Keys;

use super::{
    AuthCode, AuthRequest, AuthRequestUpdater, Client, ClientUpdater, DeviceRequest, DeviceToken,
    DeviceTokenUpdater, GcResult, KeysUpdater, OfflineSession, OfflineSessionUpdater, Password,
    PasswordUpdater, RefreshToken, RefreshTokenUpdater, Storage, StorageError,
};

#[derive(Default)]
pub struct MemoryStorage {
    clients: DashMap<String, Client>,
    auth_requests: DashMap<String, AuthRequest>,
    auth_codes: DashMap<String, AuthCode>,
    refresh_tokens: DashMap<String, RefreshToken>,
    offline_sessions: DashMap<(String, String), OfflineSession>,
    device_requests: DashMap<String, DeviceRequest>,
    device_tokens: DashMap<String, DeviceToken>,
    passwords: DashMap<String, Password>,
    keys: tokio::sync::Mutex<Option<Keys>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create_in<V>(map: &DashMap<String, V>, key: String, value: V) -> Result<(), StorageError> {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
        Entry::Occupied(_) => Err(StorageError::AlreadyExists),
    }
}

fn get_in<V: Clone>(map: &DashMap<String, V>, key: &str) -> Result<V, StorageError> {
    map.get(key)
        .map(|entry| entry.value().clone())
        .ok_or(StorageError::NotFound)
}

fn update_in<V: Clone>(
    map: &DashMap<String, V>,
    key: &str,
    updater: impl FnOnce(V) -> Result<V, StorageError>,
) -> Result<(), StorageError> {
    match map.entry(key.to_string()) {
        Entry::Occupied(mut entry) => {
            let updated = updater(entry.get().clone())?;
            entry.insert(updated);
            Ok(())
        }
        Entry::Vacant(_) => Err(StorageError::NotFound),
    }
}

fn delete_in<V>(map: &DashMap<String, V>, key: &str) -> Result<(), StorageError> {
    map.remove(key)
        .map(|_| ())
        .ok_or(StorageError::NotFound)
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn create_client(&self, client: Client) -> Result<(), StorageError> {
        create_in(&self.clients, client.id.clone(), client)
    }

    async fn get_client(&self, id: &str) -> Result<Client, StorageError> {
        get_in(&self.clients, id)
    }

    async fn update_client(&self, id: &str, updater: ClientUpdater) -> Result<(), StorageError> {
        update_in(&self.clients, id, updater)
    }

    async fn delete_client(&self, id: &str) -> Result<(), StorageError> {
        delete_in(&self.clients, id)
    }

    async fn create_auth_request(&self, req: AuthRequest) -> Result<(), StorageError> {
        create_in(&self.auth_requests, req.id.clone(), req)
    }

    async fn get_auth_request(&self, id: &str) -> Result<AuthRequest, StorageError> {
        get_in(&self.auth_requests, id)
    }

    async fn update_auth_request(
        &self,
        id: &str,
        updater: AuthRequestUpdater,
    ) -> Result<(), StorageError> {
        update_in(&self.auth_requests, id, updater)
    }

    async fn delete_auth_request(&self, id: &str) -> Result<(), StorageError> {
        delete_in(&self.auth_requests, id)
    }

    async fn create_auth_code(&self, code: AuthCode) -> Result<(), StorageError> {
        create_in(&self.auth_codes, code.id.clone(), code)
    }

    async fn get_auth_code(&self, id: &str) -> Result<AuthCode, StorageError> {
        get_in(&self.auth_codes, id)
    }

    async fn delete_auth_code(&self, id: &str) -> Result<(), StorageError> {
        delete_in(&self.auth_codes, id)
    }

    async fn create_refresh_token(&self, token: RefreshToken) -> Result<(), StorageError> {
        create_in(&self.refresh_tokens, token.id.clone(), token)
    }

    async fn get_refresh_token(&self, id: &str) -> Result<RefreshToken, StorageError> {
        get_in(&self.refresh_tokens, id)
    }

    async fn update_refresh_token(
        &self,
        id: &str,
        updater: RefreshTokenUpdater,
    ) -> Result<(), StorageError> {
        update_in(&self.refresh_tokens, id, updater)
    }

    async fn delete_refresh_token(&self, id: &str) -> Result<(), StorageError> {
        delete_in(&self.refresh_tokens, id)
    }

    async fn create_offline_session(&self, session: OfflineSession) -> Result<(), StorageError> {
        let key = (session.user_id.clone(), session.connector_id.clone());
        match self.offline_sessions.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
            Entry::Occupied(_) => Err(StorageError::AlreadyExists),
        }
    }

    async fn get_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<OfflineSession, StorageError> {
        self.offline_sessions
            .get(&(user_id.to_string(), connector_id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn update_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
        updater: OfflineSessionUpdater,
    ) -> Result<(), StorageError> {
        match self
            .offline_sessions
            .entry((user_id.to_string(), connector_id.to_string()))
        {
            Entry::Occupied(mut entry) => {
                let updated = updater(entry.get().clone())?;
                entry.insert(updated);
                Ok(())
            }
            Entry::Vacant(_) => Err(StorageError::NotFound),
        }
    }

    async fn delete_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<(), StorageError> {
        self.offline_sessions
            .remove(&(user_id.to_string(), connector_id.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn create_device_request(&self, req: DeviceRequest) -> Result<(), StorageError> {
        create_in(&self.device_requests, req.user_code.clone(), req)
    }

    async fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest, StorageError> {
        get_in(&self.device_requests, user_code)
    }

    async fn create_device_token(&self, token: DeviceToken) -> Result<(), StorageError> {
        create_in(&self.device_tokens, token.device_code.clone(), token)
    }

    async fn get_device_token(&self, device_code: &str) -> Result<DeviceToken, StorageError> {
        get_in(&self.device_tokens, device_code)
    }

    async fn update_device_token(
        &self,
        device_code: &str,
        updater: DeviceTokenUpdater,
    ) -> Result<(), StorageError> {
        update_in(&self.device_tokens, device_code, updater)
    }

    async fn delete_device_token(&self, device_code: &str) -> Result<(), StorageError> {
        delete_in(&self.device_tokens, device_code)
    }

    async fn create_password(&self, password: Password) -> Result<(), StorageError> {
        create_in(
            &self.passwords,
            password.email.to_lowercase(),
            password,
        )
    }

    async fn get_password(&self, email: &str) -> Result<Password, StorageError> {
        get_in(&self.passwords, &email.to_lowercase())
    }

    async fn update_password(
        &self,
        email: &str,
        updater: PasswordUpdater,
    ) -> Result<(), StorageError> {
        update_in(&self.passwords, &email.to_lowercase(), updater)
    }

    async fn delete_password(&self, email: &str) -> Result<(), StorageError> {
        delete_in(&self.passwords, &email.to_lowercase())
    }

    async fn get_keys(&self) -> Result<Keys, StorageError> {
        self.keys
            .lock()
            .await
            .clone()
            .ok_or(StorageError::NotFound)
    }

    async fn update_keys(&self, updater: KeysUpdater) -> Result<(), StorageError> {
        let mut guard = self.keys.lock().await;
        let updated = updater(guard.clone())?;
        *guard = Some(updated);
        Ok(())
    }

    async fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult, StorageError> {
        let mut result = GcResult::default();

        let before = self.auth_requests.len() as u64;
        self.auth_requests.retain(|_, req| req.expiry > now);
        result.auth_requests = before - self.auth_requests.len() as u64;

        let before = self.auth_codes.len() as u64;
        self.auth_codes.retain(|_, code| code.expiry > now);
        result.auth_codes = before - self.auth_codes.len() as u64;

        let before = self.device_requests.len() as u64;
        self.device_requests.retain(|_, req| req.expiry > now);
        result.device_requests = before - self.device_requests.len() as u64;

        let before = self.device_tokens.len() as u64;
        self.device_tokens.retain(|_, token| token.expiry > now);
        result.device_tokens = before - self.device_tokens.len() as u64;

        Ok(result)
    }
}
