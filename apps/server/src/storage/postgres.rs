//! PostgreSQL storage backend on sqlx.
//!
//! Entities live as JSONB documents keyed by their id, with `expiry` lifted
//! into a column so garbage collection is a plain indexed DELETE. Updaters
//! run inside a transaction holding a `FOR UPDATE` row lock, which delivers
//! the storage contract's single-writer guarantee: the second of two
//! concurrent updates blocks until the first commits and then observes its
//! result.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::keys::Keys;

use super::{
    AuthCode, AuthRequest, AuthRequestUpdater, Client, ClientUpdater, DeviceRequest, DeviceToken,
    DeviceTokenUpdater, GcResult, KeysUpdater, OfflineSession, OfflineSessionUpdater, Password,
    PasswordUpdater, RefreshToken, RefreshTokenUpdater, Storage, StorageError,
};

const KEYS_ROW_ID: &str = "openid-connect";

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn io_err(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        other => StorageError::Io(other.to_string()),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Io(format!("encode: {e}")))
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Io(format!("decode: {e}")))
}

impl PostgresStorage {
    async fn insert(
        &self,
        table: &str,
        id: &str,
        body: serde_json::Value,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let query = match expiry {
            Some(_) => format!("INSERT INTO {table} (id, body, expiry) VALUES ($1, $2, $3)"),
            None => format!("INSERT INTO {table} (id, body) VALUES ($1, $2)"),
        };
        // Table names come from string literals below, never from input.
        let mut q = sqlx::query(&query).bind(id).bind(body);
        if let Some(expiry) = expiry {
            q = q.bind(expiry);
        }
        q.execute(&self.pool).await.map(|_| ()).map_err(|e| {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return StorageError::AlreadyExists;
                }
            }
            io_err(e)
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<T, StorageError> {
        let query = format!("SELECT body FROM {table} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;
        decode(row.get::<serde_json::Value, _>("body"))
    }

    async fn remove(&self, table: &str, id: &str) -> Result<(), StorageError> {
        let query = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(io_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn apply_update<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
        expiry_of: Option<fn(&T) -> DateTime<Utc>>,
        updater: impl FnOnce(T) -> Result<T, StorageError>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(io_err)?;

        let select = format!("SELECT body FROM {table} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;

        let current: T = decode(row.get::<serde_json::Value, _>("body"))?;
        let updated = updater(current)?;
        let body = encode(&updated)?;

        match expiry_of {
            Some(expiry_of) => {
                let update = format!("UPDATE {table} SET body = $2, expiry = $3 WHERE id = $1");
                sqlx::query(&update)
                    .bind(id)
                    .bind(body)
                    .bind(expiry_of(&updated))
                    .execute(&mut *tx)
                    .await
                    .map_err(io_err)?;
            }
            None => {
                let update = format!("UPDATE {table} SET body = $2 WHERE id = $1");
                sqlx::query(&update)
                    .bind(id)
                    .bind(body)
                    .execute(&mut *tx)
                    .await
                    .map_err(io_err)?;
            }
        }

        tx.commit().await.map_err(io_err)
    }
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    async fn create_client(&self, client: Client) -> Result<(), StorageError> {
        let body = encode(&client)?;
        self.insert("clients", &client.id, body, None).await
    }

    async fn get_client(&self, id: &str) -> Result<Client, StorageError> {
        self.fetch("clients", id).await
    }

    async fn update_client(&self, id: &str, updater: ClientUpdater) -> Result<(), StorageError> {
        self.apply_update("clients", id, None, updater).await
    }

    async fn delete_client(&self, id: &str) -> Result<(), StorageError> {
        self.remove("clients", id).await
    }

    async fn create_auth_request(&self, req: AuthRequest) -> Result<(), StorageError> {
        let body = encode(&req)?;
        self.insert("auth_requests", &req.id, body, Some(req.expiry))
            .await
    }

    async fn get_auth_request(&self, id: &str) -> Result<AuthRequest, StorageError> {
        self.fetch("auth_requests", id).await
    }

    async fn update_auth_request(
        &self,
        id: &str,
        updater: AuthRequestUpdater,
    ) -> Result<(), StorageError> {
        self.apply_update("auth_requests", id, Some(|r: &AuthRequest| r.expiry), updater)
            .await
    }

    async fn delete_auth_request(&self, id: &str) -> Result<(), StorageError> {
        self.remove("auth_requests", id).await
    }

    async fn create_auth_code(&self, code: AuthCode) -> Result<(), StorageError> {
        let body = encode(&code)?;
        self.insert("auth_codes", &code.id, body, Some(code.expiry))
            .await
    }

    async fn get_auth_code(&self, id: &str) -> Result<AuthCode, StorageError> {
        self.fetch("auth_codes", id).await
    }

    async fn delete_auth_code(&self, id: &str) -> Result<(), StorageError> {
        self.remove("auth_codes", id).await
    }

    async fn create_refresh_token(&self, token: RefreshToken) -> Result<(), StorageError> {
        let body = encode(&token)?;
        self.insert("refresh_tokens", &token.id, body, None).await
    }

    async fn get_refresh_token(&self, id: &str) -> Result<RefreshToken, StorageError> {
        self.fetch("refresh_tokens", id).await
    }

    async fn update_refresh_token(
        &self,
        id: &str,
        updater: RefreshTokenUpdater,
    ) -> Result<(), StorageError> {
        self.apply_update("refresh_tokens", id, None, updater).await
    }

    async fn delete_refresh_token(&self, id: &str) -> Result<(), StorageError> {
        self.remove("refresh_tokens", id).await
    }

    async fn create_offline_session(&self, session: OfflineSession) -> Result<(), StorageError> {
        let body = encode(&session)?;
        sqlx::query(
            "INSERT INTO offline_sessions (user_id, connector_id, body) VALUES ($1, $2, $3)",
        )
        .bind(&session.user_id)
        .bind(&session.connector_id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return StorageError::AlreadyExists;
                }
            }
            io_err(e)
        })
    }

    async fn get_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<OfflineSession, StorageError> {
        let row = sqlx::query(
            "SELECT body FROM offline_sessions WHERE user_id = $1 AND connector_id = $2",
        )
        .bind(user_id)
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(io_err)?
        .ok_or(StorageError::NotFound)?;
        decode(row.get::<serde_json::Value, _>("body"))
    }

    async fn update_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
        updater: OfflineSessionUpdater,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(io_err)?;

        let row = sqlx::query(
            "SELECT body FROM offline_sessions WHERE user_id = $1 AND connector_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(connector_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(io_err)?
        .ok_or(StorageError::NotFound)?;

        let current: OfflineSession = decode(row.get::<serde_json::Value, _>("body"))?;
        let updated = updater(current)?;
        let body = encode(&updated)?;

        sqlx::query(
            "UPDATE offline_sessions SET body = $3 WHERE user_id = $1 AND connector_id = $2",
        )
        .bind(user_id)
        .bind(connector_id)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(io_err)?;

        tx.commit().await.map_err(io_err)
    }

    async fn delete_offline_session(
        &self,
        user_id: &str,
        connector_id: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "DELETE FROM offline_sessions WHERE user_id = $1 AND connector_id = $2",
        )
        .bind(user_id)
        .bind(connector_id)
        .execute(&self.pool)
        .await
        .map_err(io_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn create_device_request(&self, req: DeviceRequest) -> Result<(), StorageError> {
        let body = encode(&req)?;
        sqlx::query("INSERT INTO device_requests (user_code, body, expiry) VALUES ($1, $2, $3)")
            .bind(&req.user_code)
            .bind(body)
            .bind(req.expiry)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| {
                if let Some(db_err) = e.as_database_error() {
                    if db_err.is_unique_violation() {
                        return StorageError::AlreadyExists;
                    }
                }
                io_err(e)
            })
    }

    async fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest, StorageError> {
        let row = sqlx::query("SELECT body FROM device_requests WHERE user_code = $1")
            .bind(user_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;
        decode(row.get::<serde_json::Value, _>("body"))
    }

    async fn create_device_token(&self, token: DeviceToken) -> Result<(), StorageError> {
        let body = encode(&token)?;
        sqlx::query("INSERT INTO device_tokens (device_code, body, expiry) VALUES ($1, $2, $3)")
            .bind(&token.device_code)
            .bind(body)
            .bind(token.expiry)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| {
                if let Some(db_err) = e.as_database_error() {
                    if db_err.is_unique_violation() {
                        return StorageError::AlreadyExists;
                    }
                }
                io_err(e)
            })
    }

    async fn get_device_token(&self, device_code: &str) -> Result<DeviceToken, StorageError> {
        let row = sqlx::query("SELECT body FROM device_tokens WHERE device_code = $1")
            .bind(device_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;
        decode(row.get::<serde_json::Value, _>("body"))
    }

    async fn update_device_token(
        &self,
        device_code: &str,
        updater: DeviceTokenUpdater,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(io_err)?;

        let row = sqlx::query("SELECT body FROM device_tokens WHERE device_code = $1 FOR UPDATE")
            .bind(device_code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;

        let current: DeviceToken = decode(row.get::<serde_json::Value, _>("body"))?;
        let updated = updater(current)?;
        let body = encode(&updated)?;

        sqlx::query("UPDATE device_tokens SET body = $2, expiry = $3 WHERE device_code = $1")
            .bind(device_code)
            .bind(body)
            .bind(updated.expiry)
            .execute(&mut *tx)
            .await
            .map_err(io_err)?;

        tx.commit().await.map_err(io_err)
    }

    async fn delete_device_token(&self, device_code: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE device_code = $1")
            .bind(device_code)
            .execute(&self.pool)
            .await
            .map_err(io_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn create_password(&self, password: Password) -> Result<(), StorageError> {
        let email = password.email.to_lowercase();
        let body = encode(&password)?;
        sqlx::query("INSERT INTO passwords (email, body) VALUES ($1, $2)")
            .bind(&email)
            .bind(body)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| {
                if let Some(db_err) = e.as_database_error() {
                    if db_err.is_unique_violation() {
                        return StorageError::AlreadyExists;
                    }
                }
                io_err(e)
            })
    }

    async fn get_password(&self, email: &str) -> Result<Password, StorageError> {
        let row = sqlx::query("SELECT body FROM passwords WHERE email = $1")
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;
        decode(row.get::<serde_json::Value, _>("body"))
    }

    async fn update_password(
        &self,
        email: &str,
        updater: PasswordUpdater,
    ) -> Result<(), StorageError> {
        let email = email.to_lowercase();
        let mut tx = self.pool.begin().await.map_err(io_err)?;

        let row = sqlx::query("SELECT body FROM passwords WHERE email = $1 FOR UPDATE")
            .bind(&email)
            .fetch_optional(&mut *tx)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;

        let current: Password = decode(row.get::<serde_json::Value, _>("body"))?;
        let updated = updater(current)?;
        let body = encode(&updated)?;

        sqlx::query("UPDATE passwords SET body = $2 WHERE email = $1")
            .bind(&email)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(io_err)?;

        tx.commit().await.map_err(io_err)
    }

    async fn delete_password(&self, email: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM passwords WHERE email = $1")
            .bind(email.to_lowercase())
            .execute(&self.pool)
            .await
            .map_err(io_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn get_keys(&self) -> Result<Keys, StorageError> {
        let row = sqlx::query("SELECT body FROM signing_keys WHERE id = $1")
            .bind(KEYS_ROW_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(io_err)?
            .ok_or(StorageError::NotFound)?;
        let body: Option<serde_json::Value> = row.get("body");
        decode(body.ok_or(StorageError::NotFound)?)
    }

    async fn update_keys(&self, updater: KeysUpdater) -> Result<(), StorageError> {
        // Make sure the lockable row exists, then serialize on it.
        sqlx::query("INSERT INTO signing_keys (id, body) VALUES ($1, NULL) ON CONFLICT DO NOTHING")
            .bind(KEYS_ROW_ID)
            .execute(&self.pool)
            .await
            .map_err(io_err)?;

        let mut tx = self.pool.begin().await.map_err(io_err)?;

        let row = sqlx::query("SELECT body FROM signing_keys WHERE id = $1 FOR UPDATE")
            .bind(KEYS_ROW_ID)
            .fetch_one(&mut *tx)
            .await
            .map_err(io_err)?;

        let current: Option<Keys> = match row.get::<Option<serde_json::Value>, _>("body") {
            Some(body) => Some(decode(body)?),
            None => None,
        };
        let updated = updater(current)?;
        let body = encode(&updated)?;

        sqlx::query("UPDATE signing_keys SET body = $2 WHERE id = $1")
            .bind(KEYS_ROW_ID)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(io_err)?;

        tx.commit().await.map_err(io_err)
    }

    async fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult, StorageError> {
        let expired = |table: &str| {
            let query = format!("DELETE FROM {table} WHERE expiry < $1");
            async move {
                sqlx::query(&query)
                    .bind(now)
                    .execute(&self.pool)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(io_err)
            }
        };

        Ok(GcResult {
            auth_requests: expired("auth_requests").await?,
            auth_codes: expired("auth_codes").await?,
            device_requests: expired("device_requests").await?,
            device_tokens: expired("device_tokens").await?,
        })
    }
}
