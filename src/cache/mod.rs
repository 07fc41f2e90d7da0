//! Session store
//!
//! This module keeps the authoritative copy of every live session token. It
//! supports:
//! - In-memory backend (moka) - default, for single-instance deployment
//! - Redis backend - optional, for distributed deployment
//!
//! The backend is selected based on configuration. Whatever the backend, the
//! `SessionStore` owns a single shared connection slot, opens it lazily and
//! runs a bounded reconnect when a command fails at the connection level.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chat_identity::cache::create_session_store;
//! use chat_identity::config::SessionStoreConfig;
//! use chat_identity::context::RequestContext;
//!
//! let store = create_session_store(&SessionStoreConfig::default())?;
//! let ctx = RequestContext::with_timeout(Duration::from_secs(5));
//! store.set(&ctx, "session-id", "signed-token", Duration::from_secs(900)).await?;
//! ```

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{SessionStoreConfig, SessionStoreDriver};
use crate::context::{ContextError, RequestContext};

pub use memory::MemorySessionBackend;
#[cfg(feature = "redis-store")]
pub use redis::RedisSessionBackend;

/// Namespace for session entries in the backing store
const KEY_PREFIX: &str = "session:";

/// Shortest TTL written to the backing store
const MIN_TTL: Duration = Duration::from_secs(1);

// ============================================================================
// Errors
// ============================================================================

/// Error reported by a backend connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The connection is unusable and must be re-established
    #[error("connection error: {0}")]
    Connection(String),

    /// The command itself failed; the connection is still usable
    #[error("command error: {0}")]
    Command(String),
}

/// Session store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionStoreError {
    /// No entry exists for the session id
    #[error("Session not found")]
    NotFound,

    /// Every reconnect attempt failed
    #[error("Session store unavailable after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The backend rejected the command
    #[error("Session store error: {0}")]
    Backend(String),

    /// The request deadline passed
    #[error("Session store operation timed out")]
    Timeout,

    /// The request was cancelled
    #[error("Session store operation cancelled")]
    Cancelled,
}

impl From<ContextError> for SessionStoreError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::DeadlineExceeded => SessionStoreError::Timeout,
            ContextError::Cancelled => SessionStoreError::Cancelled,
        }
    }
}

// ============================================================================
// Backend contract
// ============================================================================

/// Opens connections to a key/value store with per-entry TTL
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Arc<dyn SessionConnection>, BackendError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// A live connection to the backing store
#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Fetch the value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Round-trip to the store
    async fn ping(&self) -> Result<(), BackendError>;
}

// ============================================================================
// Session store
// ============================================================================

/// A single command against the backing store, replayable after a reconnect
enum Command<'a> {
    Set {
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    },
    Get {
        key: &'a str,
    },
    Remove {
        key: &'a str,
    },
    Ping,
}

enum Reply {
    Done,
    Value(Option<String>),
}

impl Command<'_> {
    fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "SET",
            Command::Get { .. } => "GET",
            Command::Remove { .. } => "DEL",
            Command::Ping => "PING",
        }
    }

    async fn apply(&self, conn: &dyn SessionConnection) -> Result<Reply, BackendError> {
        match self {
            Command::Set { key, value, ttl } => conn.set(key, value, *ttl).await.map(|_| Reply::Done),
            Command::Get { key } => conn.get(key).await.map(Reply::Value),
            Command::Remove { key } => conn.remove(key).await.map(|_| Reply::Done),
            Command::Ping => conn.ping().await.map(|_| Reply::Done),
        }
    }
}

/// The shared connection, the number of times it has been replaced, and the
/// outcome of the last failed replacement
struct ConnectionSlot {
    conn: Option<Arc<dyn SessionConnection>>,
    generation: u64,
    failure: Option<SessionStoreError>,
}

/// TTL key/value store of live session tokens.
///
/// One connection is shared by all callers. When a command fails at the
/// connection level, the store retries connect+ping up to `max_retries`
/// times, sleeping `retry_backoff` between attempts, then re-issues the
/// command once. Callers that hit the same broken generation share a single
/// reconnect and its outcome, whether that is a fresh connection or
/// `ExhaustedRetries`.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    slot: Mutex<ConnectionSlot>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("backend", &self.backend.name())
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Create a session store over `backend`.
    ///
    /// A `max_retries` of zero is raised to one.
    pub fn new(backend: Arc<dyn SessionBackend>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            backend,
            slot: Mutex::new(ConnectionSlot {
                conn: None,
                generation: 0,
                failure: None,
            }),
            max_retries: max_retries.max(1),
            retry_backoff,
        }
    }

    /// Retry ceiling for reconnects
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Store the signed token for a session
    pub async fn set(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), SessionStoreError> {
        let key = session_key(session_id);
        let command = Command::Set {
            key: &key,
            value: token,
            ttl: ttl.max(MIN_TTL),
        };
        ctx.run(self.execute(command)).await?;
        Ok(())
    }

    /// Fetch the signed token for a session
    pub async fn get(&self, ctx: &RequestContext, session_id: &str) -> Result<String, SessionStoreError> {
        let key = session_key(session_id);
        match ctx.run(self.execute(Command::Get { key: &key })).await? {
            Reply::Value(Some(token)) => Ok(token),
            _ => Err(SessionStoreError::NotFound),
        }
    }

    /// Delete a session. Removing a missing session is not an error.
    pub async fn remove(&self, ctx: &RequestContext, session_id: &str) -> Result<(), SessionStoreError> {
        let key = session_key(session_id);
        ctx.run(self.execute(Command::Remove { key: &key })).await?;
        Ok(())
    }

    /// Check that the backing store is reachable
    pub async fn ping(&self, ctx: &RequestContext) -> Result<(), SessionStoreError> {
        ctx.run(self.execute(Command::Ping)).await?;
        Ok(())
    }

    async fn execute(&self, command: Command<'_>) -> Result<Reply, SessionStoreError> {
        let (conn, generation) = self.acquire().await?;

        match command.apply(conn.as_ref()).await {
            Ok(reply) => return Ok(reply),
            Err(BackendError::Command(e)) => return Err(SessionStoreError::Backend(e)),
            Err(BackendError::Connection(e)) => {
                tracing::warn!(
                    command = command.name(),
                    backend = self.backend.name(),
                    error = %e,
                    "Session store connection failed, reconnecting"
                );
            }
        }

        let (conn, generation) = self.settle(generation).await?;
        match command.apply(conn.as_ref()).await {
            Ok(reply) => Ok(reply),
            Err(BackendError::Command(e)) => Err(SessionStoreError::Backend(e)),
            Err(BackendError::Connection(e)) => {
                tracing::warn!(
                    command = command.name(),
                    backend = self.backend.name(),
                    error = %e,
                    "Session store connection failed again after reconnect"
                );
                Err(self.invalidate(generation).await)
            }
        }
    }

    /// Return the shared connection, opening it on first use
    async fn acquire(&self) -> Result<(Arc<dyn SessionConnection>, u64), SessionStoreError> {
        let observed = {
            let slot = self.slot.lock().await;
            if let Some(conn) = &slot.conn {
                return Ok((conn.clone(), slot.generation));
            }
            slot.generation
        };
        self.settle(observed).await
    }

    /// Replace the connection of generation `observed`, or adopt the outcome
    /// of a replacement another caller already made.
    async fn settle(
        &self,
        observed: u64,
    ) -> Result<(Arc<dyn SessionConnection>, u64), SessionStoreError> {
        // Let other callers on the same generation queue up behind this one
        tokio::task::yield_now().await;

        let mut slot = self.slot.lock().await;
        if slot.generation != observed {
            if let Some(conn) = &slot.conn {
                return Ok((conn.clone(), slot.generation));
            }
            if let Some(e) = &slot.failure {
                return Err(e.clone());
            }
        }

        slot.conn = None;
        slot.failure = None;
        let outcome = self.connect_with_retries().await;
        slot.generation += 1;
        match outcome {
            Ok(conn) => {
                slot.conn = Some(conn.clone());
                Ok((conn, slot.generation))
            }
            Err(e) => {
                slot.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Drop a freshly opened connection that failed straight away
    async fn invalidate(&self, generation: u64) -> SessionStoreError {
        let error = SessionStoreError::ExhaustedRetries {
            attempts: self.max_retries,
        };
        let mut slot = self.slot.lock().await;
        if slot.generation == generation {
            slot.conn = None;
            slot.failure = Some(error.clone());
            slot.generation += 1;
        }
        error
    }

    async fn connect_with_retries(&self) -> Result<Arc<dyn SessionConnection>, SessionStoreError> {
        for attempt in 1..=self.max_retries {
            match self.try_connect().await {
                Ok(conn) => {
                    tracing::info!(
                        attempt,
                        backend = self.backend.name(),
                        "Session store connected"
                    );
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        backend = self.backend.name(),
                        error = %e,
                        "Session store connect attempt failed"
                    );
                }
            }

            if attempt < self.max_retries && !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        tracing::error!(
            attempts = self.max_retries,
            backend = self.backend.name(),
            "Session store reconnect exhausted"
        );
        Err(SessionStoreError::ExhaustedRetries {
            attempts: self.max_retries,
        })
    }

    async fn try_connect(&self) -> Result<Arc<dyn SessionConnection>, BackendError> {
        let conn = self.backend.connect().await?;
        conn.ping().await?;
        Ok(conn)
    }
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

/// Create a session store based on configuration
///
/// - `SessionStoreDriver::Memory` - in-process moka cache
/// - `SessionStoreDriver::Redis` - Redis (requires `redis-store` feature)
///
/// No connection is opened here; the store connects on first use.
///
/// # Errors
/// - Redis is configured but the `redis-store` feature is not enabled
/// - Redis is configured without a URL, or the URL is invalid
pub fn create_session_store(config: &SessionStoreConfig) -> Result<Arc<SessionStore>> {
    let backend: Arc<dyn SessionBackend> = match config.driver {
        SessionStoreDriver::Memory => Arc::new(MemorySessionBackend::with_capacity(config.max_capacity)),
        SessionStoreDriver::Redis => {
            #[cfg(feature = "redis-store")]
            {
                let redis_url = config.redis_url.as_deref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Redis URL is required when using the Redis session store. \
                         Set 'redis_url' in session_store configuration or use CHAT_IDENTITY_SESSION_STORE_REDIS_URL environment variable."
                    )
                })?;
                Arc::new(RedisSessionBackend::new(redis_url)?)
            }

            #[cfg(not(feature = "redis-store"))]
            {
                anyhow::bail!(
                    "Redis session store is configured but the 'redis-store' feature is not enabled. \
                     Either enable the feature with `--features redis-store` or use the 'memory' driver."
                )
            }
        }
    };

    Ok(Arc::new(SessionStore::new(
        backend,
        config.max_retries,
        Duration::from_millis(config.retry_backoff_ms),
    )))
}
