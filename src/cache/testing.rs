//! In-process session backend with injectable failures, for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BackendError, SessionBackend, SessionConnection};

#[derive(Default)]
struct ScriptState {
    entries: HashMap<String, String>,
    current: Option<Arc<AtomicBool>>,
    pending_connect_failures: u32,
    connect_attempts: u32,
    connects: u32,
    sets: u32,
    fail_set_at: Option<u32>,
    removes: u32,
    fail_remove_at: Option<u32>,
    reads_broken: bool,
}

/// A backend whose connections can be severed and whose connects can be made
/// to fail a given number of times.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Break the current connection and fail the next `failures` connects
    pub(crate) fn sever(&self, failures: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(alive) = state.current.take() {
            alive.store(false, Ordering::SeqCst);
        }
        state.pending_connect_failures = failures;
    }

    /// Make the `n`th SET (1-based, counted from now) fail with a command error
    pub(crate) fn fail_nth_set(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.fail_set_at = Some(state.sets + n);
    }

    /// Make the `n`th DEL (1-based, counted from now) fail with a command error
    pub(crate) fn fail_nth_remove(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.fail_remove_at = Some(state.removes + n);
    }

    /// Reset every GET at the connection level while connects and pings
    /// keep succeeding
    pub(crate) fn break_reads(&self, broken: bool) {
        self.state.lock().unwrap().reads_broken = broken;
    }

    /// Successful connects so far
    pub(crate) fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Connect attempts so far, failed ones included
    pub(crate) fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn connect(&self) -> Result<Arc<dyn SessionConnection>, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.pending_connect_failures > 0 {
            state.pending_connect_failures -= 1;
            return Err(BackendError::Connection("connection refused".to_string()));
        }

        state.connects += 1;
        let alive = Arc::new(AtomicBool::new(true));
        state.current = Some(alive.clone());
        Ok(Arc::new(ScriptedConnection {
            alive,
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedConnection {
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnection {
    fn check(&self) -> Result<(), BackendError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Connection("connection reset by peer".to_string()))
        }
    }
}

#[async_trait]
impl SessionConnection for ScriptedConnection {
    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), BackendError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.sets += 1;
        if state.fail_set_at == Some(state.sets) {
            return Err(BackendError::Command("OOM command not allowed".to_string()));
        }
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        if state.reads_broken {
            return Err(BackendError::Connection("connection reset by peer".to_string()));
        }
        Ok(state.entries.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.removes += 1;
        if state.fail_remove_at == Some(state.removes) {
            return Err(BackendError::Command("READONLY replica".to_string()));
        }
        state.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check()
    }
}
