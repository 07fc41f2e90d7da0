//! Request context
//!
//! Every call into the user directory or the session store carries a
//! `RequestContext`. It bounds the call with an optional deadline and lets the
//! caller cancel it; when either fires, the in-flight future is dropped and the
//! call returns a `ContextError` instead of hanging.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reason a context-bound operation was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The deadline passed before the operation completed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,
}

/// Deadline and cancellation scope for a single request
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled by itself
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a caller-owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check the context without running anything
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `operation` bounded by this context.
    ///
    /// Cancellation takes priority over the deadline, and both take priority
    /// over an operation that becomes ready in the same poll.
    pub async fn run<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ContextError>,
    {
        self.check()?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ContextError::Cancelled.into()),
            _ = expired => Err(ContextError::DeadlineExceeded.into()),
            result = operation => result,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
