//! Request context: trace id, optional deadline, shared cancellation.
//!
//! Every blocking operation in the workspace (lock acquisition, publishing,
//! job handlers, fan-out) takes a `&Context`. Contexts are cheap to clone.
//! Derived contexts (`with_timeout`, `with_deadline`) keep the parent's
//! cancellation token and can only tighten the deadline, never extend it.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ContextError;
use crate::id::TraceId;

/// Cooperative cancellation flag that sleeping threads can wait on.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and wake every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for up to `timeout`, returning early if the token is cancelled.
    ///
    /// Returns `true` when the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .inner
            .cond
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Per-request/per-message execution context.
#[derive(Debug, Clone)]
pub struct Context {
    trace_id: TraceId,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A fresh context with no deadline and its own cancellation token.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// A fresh context bound to an existing cancellation token (e.g. process shutdown).
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            trace_id: TraceId::new(),
            deadline: None,
            cancel,
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Derive a context that expires `timeout` from now (or earlier, if the
    /// parent deadline is sooner).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of `deadline` and the current deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            trace_id: self.trace_id,
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every context sharing its token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Time left until the deadline (`None` when there is no deadline).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Some` once the context is done. Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Sleep for `duration` unless the context finishes first.
    ///
    /// When the deadline falls inside the sleep, this returns
    /// `DeadlineExceeded` at the deadline instead of sleeping the full duration.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let (wait, hits_deadline) = match self.remaining() {
            Some(remaining) if remaining <= duration => (remaining, true),
            _ => (duration, false),
        };

        if self.cancel.wait_timeout(wait) {
            return Err(ContextError::Cancelled);
        }
        if hits_deadline {
            return Err(ContextError::DeadlineExceeded);
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
