//! Redis session backend
//!
//! Provides a shared session store for multi-instance deployments.
//!
//! # Features
//! - TTL-based expiration via `SET EX`
//! - Multiplexed async connection, cloned per command
//! - I/O, refused, dropped and timed-out connections are reported as
//!   connection-level errors so the store reconnects

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use std::sync::Arc;
use std::time::Duration;

use super::{BackendError, SessionBackend, SessionConnection};

/// Redis session backend
pub struct RedisSessionBackend {
    client: Client,
}

impl std::fmt::Debug for RedisSessionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionBackend").finish_non_exhaustive()
    }
}

impl RedisSessionBackend {
    /// Create a backend for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is opened until the store first needs one.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionBackend for RedisSessionBackend {
    async fn connect(&self) -> Result<Arc<dyn SessionConnection>, BackendError> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        Ok(Arc::new(RedisSessionConnection { connection }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisSessionConnection {
    connection: MultiplexedConnection,
}

#[async_trait]
impl SessionConnection for RedisSessionConnection {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        // Minimum 1 second
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(classify)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(classify)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Split Redis errors into connection-level and command-level failures
fn classify(e: RedisError) -> BackendError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        BackendError::Connection(e.to_string())
    } else {
        BackendError::Command(e.to_string())
    }
}
