use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use oxidp_server::config::ServerConfig;
use oxidp_server::connectors::{password::hash_password, ConnectorRegistry};
use oxidp_server::keys::KeyManager;
use oxidp_server::router::build_router;
use oxidp_server::shutdown::shutdown_signal;
use oxidp_server::state::AppState;
use oxidp_server::storage::{
    Client, MemoryStorage, Password, PostgresStorage, Storage, StorageError,
};

/// How often each instance checks whether the signing key is due for
/// rotation. The rotation itself is arbitrated through storage.
const ROTATION_CHECK_INTERVAL_SECONDS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let storage: Arc<dyn Storage> = match config.storage.backend.as_str() {
        "memory" => {
            tracing::warn!("using in-memory storage, state is lost on restart");
            Arc::new(MemoryStorage::new())
        }
        "postgres" => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.storage.max_connections)
                .connect(&config.storage.database_url)
                .await?;
            sqlx::migrate!().run(&pool).await?;
            tracing::info!("postgres storage connected");
            Arc::new(PostgresStorage::new(pool))
        }
        other => return Err(format!("unknown storage backend {other:?}").into()),
    };

    load_static_entries(&config, &storage).await?;

    let keys = Arc::new(KeyManager::new(
        Arc::clone(&storage),
        config.signing_algorithm()?,
        config.expiry.signing_keys(),
        config.expiry.verification_window(),
    ));
    if keys.rotate_if_needed(chrono::Utc::now()).await? {
        tracing::info!("installed a fresh signing key");
    }

    let connectors = Arc::new(
        ConnectorRegistry::from_config(&config.connectors, Arc::clone(&storage))
            .map_err(|err| format!("connector configuration: {err}"))?,
    );
    if connectors.is_empty() {
        tracing::warn!("no connectors configured, logins will fail");
    }

    // Shutdown coordination: background tasks stop when the server does.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let gc_storage = Arc::clone(&storage);
    let gc_interval = config.expiry.gc_interval_seconds;
    let mut gc_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            match oxidp_server::tasks::gc::collect_garbage(&gc_storage).await {
                Ok(result) if !result.is_empty() => {
                    tracing::info!(
                        auth_requests = result.auth_requests,
                        auth_codes = result.auth_codes,
                        device_requests = result.device_requests,
                        device_tokens = result.device_tokens,
                        "garbage collection removed expired rows"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "garbage collection failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(gc_interval)) => {}
                _ = gc_shutdown.changed() => {
                    tracing::info!("garbage collection task shutting down");
                    break;
                }
            }
        }
    });

    let rotation_keys = Arc::clone(&keys);
    let mut rotation_shutdown = shutdown_rx;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(ROTATION_CHECK_INTERVAL_SECONDS)) => {}
                _ = rotation_shutdown.changed() => {
                    tracing::info!("key rotation task shutting down");
                    break;
                }
            }
            match oxidp_server::tasks::rotation::rotate_keys(&rotation_keys).await {
                Ok(true) => tracing::info!("rotated signing key"),
                Ok(false) => {}
                Err(err) => tracing::error!(error = %err, "key rotation failed"),
            }
        }
    });

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(storage, keys, connectors, Arc::new(config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("oxidp listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);

    Ok(())
}

/// Upsert the statically configured clients and passwords so the rows match
/// the config file on every boot.
async fn load_static_entries(
    config: &ServerConfig,
    storage: &Arc<dyn Storage>,
) -> Result<(), Box<dyn std::error::Error>> {
    for static_client in &config.clients {
        let client = Client {
            id: static_client.id.clone(),
            secret: static_client.secret.clone(),
            redirect_uris: static_client.redirect_uris.clone(),
            trusted_peers: static_client.trusted_peers.clone(),
            public: static_client.public,
            name: static_client.name.clone(),
            logo_url: static_client.logo_url.clone(),
        };
        match storage.create_client(client.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists) => {
                storage
                    .update_client(&static_client.id, Box::new(move |_| Ok(client)))
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(client_id = %static_client.id, "loaded static client");
    }

    for static_password in &config.passwords {
        let hash = if static_password.hash.is_empty() {
            hash_password(&static_password.plaintext)
                .map_err(|err| format!("hashing password for {:?}: {err}", static_password.email))?
        } else {
            static_password.hash.clone()
        };
        let password = Password {
            email: static_password.email.clone(),
            hash,
            username: static_password.username.clone(),
            user_id: static_password.user_id.clone(),
        };
        match storage.create_password(password.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists) => {
                storage
                    .update_password(&static_password.email, Box::new(move |_| Ok(password)))
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(email = %static_password.email, "loaded static password");
    }

    Ok(())
}
