use serde::Deserialize;

use crate::keys::SigningAlgorithm;

// ---------------------------------------------------------------------------
// Sub-struct: Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "postgres".
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Required for the postgres backend. MUST come from DATABASE_URL env
    /// var in production setups.
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_max_db_connections")]
    pub max_connections: u32,
}

fn default_storage_backend() -> String {
    "memory".to_string()
}
fn default_max_db_connections() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: String::new(),
            max_connections: default_max_db_connections(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-struct: OAuth2 behavior
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuth2Config {
    /// Skip the consent page for clients that did not ask for it.
    #[serde(default)]
    pub skip_approval_screen: bool,
    /// Render the connector chooser even when only one connector exists.
    #[serde(default)]
    pub always_show_login_screen: bool,
    /// Default connector for token-exchange requests that do not name one.
    #[serde(default)]
    pub password_connector: String,
}

// ---------------------------------------------------------------------------
// Sub-struct: Expiry knobs (all in seconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_auth_requests_ttl")]
    pub auth_requests_seconds: u64,
    #[serde(default = "default_auth_codes_ttl")]
    pub auth_codes_seconds: u64,
    #[serde(default = "default_device_requests_ttl")]
    pub device_requests_seconds: u64,
    #[serde(default = "default_id_tokens_ttl")]
    pub id_tokens_seconds: u64,
    /// Signing key rotation period.
    #[serde(default = "default_signing_keys_ttl")]
    pub signing_keys_seconds: u64,
    /// How long a rotated-out key keeps verifying old tokens.
    #[serde(default = "default_verification_window")]
    pub verification_window_seconds: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_seconds: u64,
    /// Minimum seconds a device must wait between token polls.
    #[serde(default = "default_device_poll_interval")]
    pub device_poll_interval_seconds: i64,
}

fn default_auth_requests_ttl() -> u64 {
    86_400
}
fn default_auth_codes_ttl() -> u64 {
    600
}
fn default_device_requests_ttl() -> u64 {
    900
}
fn default_id_tokens_ttl() -> u64 {
    86_400
}
fn default_signing_keys_ttl() -> u64 {
    21_600
}
fn default_verification_window() -> u64 {
    86_400
}
fn default_gc_interval() -> u64 {
    600
}
fn default_device_poll_interval() -> i64 {
    5
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            auth_requests_seconds: default_auth_requests_ttl(),
            auth_codes_seconds: default_auth_codes_ttl(),
            device_requests_seconds: default_device_requests_ttl(),
            id_tokens_seconds: default_id_tokens_ttl(),
            signing_keys_seconds: default_signing_keys_ttl(),
            verification_window_seconds: default_verification_window(),
            gc_interval_seconds: default_gc_interval(),
            device_poll_interval_seconds: default_device_poll_interval(),
        }
    }
}

impl ExpiryConfig {
    pub fn auth_requests(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth_requests_seconds as i64)
    }
    pub fn auth_codes(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth_codes_seconds as i64)
    }
    pub fn device_requests(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.device_requests_seconds as i64)
    }
    pub fn id_tokens(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.id_tokens_seconds as i64)
    }
    pub fn signing_keys(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signing_keys_seconds as i64)
    }
    pub fn verification_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.verification_window_seconds as i64)
    }
}

// ---------------------------------------------------------------------------
// Static tables: connectors, clients, passwords
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Connector-specific settings, validated by the connector itself.
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticClient {
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logo_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticPassword {
    pub email: String,
    /// argon2 PHC string. Exactly one of `hash` / `plaintext` must be set;
    /// `plaintext` is hashed at startup and exists for dev setups only.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub plaintext: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Main ServerConfig
// ---------------------------------------------------------------------------

/// Server configuration loaded from config.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public issuer URL; becomes the `iss` claim and the base of every
    /// advertised endpoint.
    pub issuer: String,
    /// Host to bind to. Default: "127.0.0.1"
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on. Default: 5556
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Signing algorithm: "RS256" (default) or "EdDSA".
    #[serde(default = "default_signing_algorithm")]
    pub signing_algorithm: String,

    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oauth2: OAuth2Config,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
    #[serde(default)]
    pub clients: Vec<StaticClient>,
    #[serde(default)]
    pub passwords: Vec<StaticPassword>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5556
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_signing_algorithm() -> String {
    "RS256".to_string()
}

impl ServerConfig {
    /// Load configuration from a TOML file with environment variable
    /// overrides. Reads `config.toml` from CWD (or the path in the
    /// `CONFIG_PATH` env var).
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse a TOML string, apply env var overrides, validate.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config: ServerConfig = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(val) = std::env::var("OXIDP_ISSUER") {
            self.issuer = val;
        }
        if let Ok(val) = std::env::var("HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("PORT") {
            self.port = val
                .parse()
                .map_err(|_| format!("invalid PORT value: {val}"))?;
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.storage.database_url = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let issuer = url::Url::parse(&self.issuer).map_err(|e| format!("invalid issuer: {e}"))?;
        if issuer.scheme() != "http" && issuer.scheme() != "https" {
            return Err(format!("issuer must be http(s), got {:?}", self.issuer).into());
        }
        self.signing_algorithm()?;
        match self.storage.backend.as_str() {
            "memory" => {}
            "postgres" => {
                if self.storage.database_url.is_empty() {
                    return Err("postgres storage requires storage.database_url".into());
                }
            }
            other => return Err(format!("unknown storage backend {other:?}").into()),
        }
        for password in &self.passwords {
            if password.hash.is_empty() == password.plaintext.is_empty() {
                return Err(format!(
                    "password entry {:?} must set exactly one of hash / plaintext",
                    password.email
                )
                .into());
            }
        }
        Ok(())
    }

    pub fn signing_algorithm(&self) -> Result<SigningAlgorithm, Box<dyn std::error::Error>> {
        self.signing_algorithm
            .parse::<SigningAlgorithm>()
            .map_err(Into::into)
    }

    /// Issuer without a trailing slash, ready for path concatenation.
    pub fn issuer_base(&self) -> String {
        self.issuer.trim_end_matches('/').to_string()
    }
}
