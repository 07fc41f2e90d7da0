//! In-memory session backend using moka
//!
//! Provides a thread-safe in-process store with per-entry TTL. Connections
//! are handles onto the same cache, so reconnecting never loses entries.

use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{BackendError, SessionBackend, SessionConnection};

/// Default maximum number of live sessions
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

#[derive(Clone)]
struct SessionEntry {
    token: Arc<str>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with
struct SessionExpiry;

impl Expiry<String, SessionEntry> for SessionExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &SessionEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &SessionEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process session backend
#[derive(Clone)]
pub struct MemorySessionBackend {
    cache: Cache<String, SessionEntry>,
}

impl std::fmt::Debug for MemorySessionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionBackend")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemorySessionBackend {
    /// Create a backend with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY)
    }

    /// Create a backend holding at most `max_capacity` sessions
    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(SessionExpiry)
            .build();

        Self { cache }
    }
}

impl Default for MemorySessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn connect(&self) -> Result<Arc<dyn SessionConnection>, BackendError> {
        Ok(Arc::new(self.clone()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl SessionConnection for MemorySessionBackend {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let entry = SessionEntry {
            token: Arc::from(value),
            ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.cache.get(key).await.map(|entry| entry.token.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
