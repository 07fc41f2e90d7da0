//! Configuration management
//!
//! This module handles loading and parsing configuration for the identity service.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults. Signing secrets
//! have no default and must be supplied; `Config::validate` rejects a
//! configuration without them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix of every environment variable override
const ENV_PREFIX: &str = "CHAT_IDENTITY";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// User directory database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Session store configuration
    #[serde(default)]
    pub session_store: SessionStoreConfig,
    /// Token signing configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline applied to every request's store calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    /// Request deadline as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    10
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/chat-identity.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Session store driver (memory or redis)
    #[serde(default)]
    pub driver: SessionStoreDriver,
    /// Redis connection URL (required for the redis driver)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Connect attempts made before a reconnect gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between connect attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Maximum live sessions held by the memory driver
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            driver: SessionStoreDriver::default(),
            redis_url: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_capacity: default_max_capacity(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_capacity() -> u64 {
    100_000
}

/// Session store driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreDriver {
    /// In-memory store (default)
    #[default]
    Memory,
    /// Redis store
    Redis,
}

/// Token signing configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for access tokens
    #[serde(default)]
    pub access_secret: String,
    /// HMAC secret for refresh tokens
    #[serde(default)]
    pub refresh_secret: String,
    /// Access token lifetime in seconds
    #[serde(default = "default_access_ttl")]
    pub access_ttl_seconds: u64,
    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            access_ttl_seconds: default_access_ttl(),
            refresh_ttl_seconds: default_refresh_ttl(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_secret", &"***")
            .field("refresh_secret", &"***")
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .finish()
    }
}

impl AuthConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_seconds)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_seconds)
    }
}

/// 15 minutes
fn default_access_ttl() -> u64 {
    15 * 60
}

/// 7 days
fn default_refresh_ttl() -> u64 {
    7 * 24 * 60 * 60
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        // Handle empty file - return defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: format_yaml_error(&e),
        })?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern `CHAT_IDENTITY_<SECTION>_<KEY>`:
    /// - CHAT_IDENTITY_SERVER_HOST
    /// - CHAT_IDENTITY_SERVER_PORT
    /// - CHAT_IDENTITY_SERVER_REQUEST_TIMEOUT_SECONDS
    /// - CHAT_IDENTITY_DATABASE_DRIVER
    /// - CHAT_IDENTITY_DATABASE_URL
    /// - CHAT_IDENTITY_SESSION_STORE_DRIVER
    /// - CHAT_IDENTITY_SESSION_STORE_REDIS_URL
    /// - CHAT_IDENTITY_SESSION_STORE_MAX_RETRIES
    /// - CHAT_IDENTITY_SESSION_STORE_RETRY_BACKOFF_MS
    /// - CHAT_IDENTITY_SESSION_STORE_MAX_CAPACITY
    /// - CHAT_IDENTITY_AUTH_ACCESS_SECRET
    /// - CHAT_IDENTITY_AUTH_REFRESH_SECRET
    /// - CHAT_IDENTITY_AUTH_ACCESS_TTL_SECONDS
    /// - CHAT_IDENTITY_AUTH_REFRESH_TTL_SECONDS
    ///
    /// Values that fail to parse are ignored.
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        // Server configuration
        if let Some(host) = env_var("SERVER_HOST") {
            self.server.host = host;
        }
        override_parsed("SERVER_PORT", &mut self.server.port);
        override_parsed(
            "SERVER_REQUEST_TIMEOUT_SECONDS",
            &mut self.server.request_timeout_seconds,
        );

        // Database configuration
        if let Some(driver) = env_var("DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Some(url) = env_var("DATABASE_URL") {
            self.database.url = url;
        }

        // Session store configuration
        if let Some(driver) = env_var("SESSION_STORE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "memory" => self.session_store.driver = SessionStoreDriver::Memory,
                "redis" => self.session_store.driver = SessionStoreDriver::Redis,
                _ => {} // Ignore invalid values
            }
        }
        if let Some(redis_url) = env_var("SESSION_STORE_REDIS_URL") {
            self.session_store.redis_url = Some(redis_url);
        }
        override_parsed("SESSION_STORE_MAX_RETRIES", &mut self.session_store.max_retries);
        override_parsed(
            "SESSION_STORE_RETRY_BACKOFF_MS",
            &mut self.session_store.retry_backoff_ms,
        );
        override_parsed("SESSION_STORE_MAX_CAPACITY", &mut self.session_store.max_capacity);

        // Auth configuration
        if let Some(secret) = env_var("AUTH_ACCESS_SECRET") {
            self.auth.access_secret = secret;
        }
        if let Some(secret) = env_var("AUTH_REFRESH_SECRET") {
            self.auth.refresh_secret = secret;
        }
        override_parsed("AUTH_ACCESS_TTL_SECONDS", &mut self.auth.access_ttl_seconds);
        override_parsed("AUTH_REFRESH_TTL_SECONDS", &mut self.auth.refresh_ttl_seconds);
    }

    /// Check the settings the core relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.auth.access_secret.is_empty() {
            return invalid("auth.access_secret must be set");
        }
        if self.auth.refresh_secret.is_empty() {
            return invalid("auth.refresh_secret must be set");
        }
        if self.auth.access_secret == self.auth.refresh_secret {
            return invalid("auth.access_secret and auth.refresh_secret must differ");
        }
        if self.auth.access_ttl_seconds == 0 {
            return invalid("auth.access_ttl_seconds must be greater than zero");
        }
        if self.auth.refresh_ttl_seconds <= self.auth.access_ttl_seconds {
            return invalid("auth.refresh_ttl_seconds must be greater than auth.access_ttl_seconds");
        }
        if self.session_store.max_retries == 0 {
            return invalid("session_store.max_retries must be at least 1");
        }
        if self.session_store.driver == SessionStoreDriver::Redis
            && self.session_store.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return invalid("session_store.redis_url is required for the redis driver");
        }
        if self.server.request_timeout_seconds == 0 {
            return invalid("server.request_timeout_seconds must be greater than zero");
        }

        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, key)).ok()
}

fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Some(value) = env_var(key).and_then(|v| v.parse::<T>().ok()) {
        *target = value;
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
// Both `tests` and `property_tests` modules use this to prevent race conditions.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "SERVER_HOST",
    "SERVER_PORT",
    "SERVER_REQUEST_TIMEOUT_SECONDS",
    "DATABASE_DRIVER",
    "DATABASE_URL",
    "SESSION_STORE_DRIVER",
    "SESSION_STORE_REDIS_URL",
    "SESSION_STORE_MAX_RETRIES",
    "SESSION_STORE_RETRY_BACKOFF_MS",
    "SESSION_STORE_MAX_CAPACITY",
    "AUTH_ACCESS_SECRET",
    "AUTH_REFRESH_SECRET",
    "AUTH_ACCESS_TTL_SECONDS",
    "AUTH_REFRESH_TTL_SECONDS",
];

#[cfg(test)]
fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(format!("{}_{}", ENV_PREFIX, key));
    }
}
