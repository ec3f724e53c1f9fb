//! Handles for requests whose caller does not block.

use crate::connection::Connection;
use crate::error::{Result, TetherError};
use crate::locks::lock;
use crate::object::Object;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce(&AsyncResult) + Send>;

struct State {
    outcome: Option<Result<Object>>,
    callbacks: Vec<Callback>,
    expiry: Option<(Instant, Duration)>,
}

struct Inner {
    conn: Connection,
    seq: u32,
    state: Mutex<State>,
}

/// The eventual outcome of an asynchronous request.
///
/// Becomes ready exactly once, when the reply (or an exception, or the loss
/// of the connection) arrives. Waiting serves the owning connection, so a
/// result can be awaited from any thread in either threading mode.
#[derive(Clone)]
pub struct AsyncResult {
    inner: Arc<Inner>,
}

impl AsyncResult {
    pub(crate) fn new(conn: Connection, seq: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn,
                seq,
                state: Mutex::new(State {
                    outcome: None,
                    callbacks: Vec::new(),
                    expiry: None,
                }),
            }),
        }
    }

    pub fn seq(&self) -> u32 {
        self.inner.seq
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    fn is_set(&self) -> bool {
        lock(&self.inner.state).outcome.is_some()
    }

    /// Whether the outcome has arrived. Drains frames already waiting on the
    /// connection first, without blocking.
    pub fn ready(&self) -> bool {
        if self.is_set() {
            return true;
        }
        if !self.expired() && !self.inner.conn.closed() {
            let _ = self.inner.conn.poll_all(Some(Duration::ZERO));
        }
        self.is_set()
    }

    /// True once ready with an error.
    pub fn error(&self) -> bool {
        self.ready() && matches!(lock(&self.inner.state).outcome, Some(Err(_)))
    }

    /// True when the deadline passed before the outcome arrived.
    pub fn expired(&self) -> bool {
        let state = lock(&self.inner.state);
        state.outcome.is_none()
            && state
                .expiry
                .is_some_and(|(deadline, _)| Instant::now() >= deadline)
    }

    /// Limit how long [`AsyncResult::wait`] may block, counted from now.
    /// `None` waits forever.
    pub fn set_expiry(&self, timeout: Option<Duration>) {
        lock(&self.inner.state).expiry = timeout.map(|t| (Instant::now() + t, t));
    }

    /// Block until ready. On expiry the request is abandoned (a late reply
    /// will be discarded) and [`TetherError::Timeout`] is returned; remote
    /// errors are only reported by [`AsyncResult::value`].
    pub fn wait(&self) -> Result<()> {
        let conn = &self.inner.conn;
        loop {
            if self.is_set() {
                return Ok(());
            }
            let expiry = lock(&self.inner.state).expiry;
            if let Some((deadline, timeout)) = expiry {
                if Instant::now() >= deadline {
                    conn.abandon(self.inner.seq);
                    if self.is_set() {
                        return Ok(());
                    }
                    return Err(TetherError::Timeout(timeout));
                }
            }
            let deadline = expiry.map(|(deadline, _)| deadline);
            if let Err(e) = conn.serve_until(deadline, &|| self.is_set()) {
                if !self.is_set() {
                    return Err(e);
                }
            }
        }
    }

    /// Wait, then return the value or the error the request produced.
    pub fn value(&self) -> Result<Object> {
        self.wait()?;
        lock(&self.inner.state)
            .outcome
            .clone()
            .unwrap_or_else(|| Err(TetherError::Closed(self.inner.conn.connid().to_string())))
    }

    /// Run `callback` once the outcome arrives, or immediately if it already
    /// has. Callbacks run on whichever thread delivers the reply.
    pub fn add_callback(&self, callback: impl FnOnce(&AsyncResult) + Send + 'static) {
        let mut state = lock(&self.inner.state);
        if state.outcome.is_some() {
            drop(state);
            callback(self);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    /// Deliver the outcome. Only the first call has any effect.
    pub(crate) fn set(&self, outcome: Result<Object>) {
        let callbacks = {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.callbacks)
        };
        self.inner.conn.notify_progress();
        for callback in callbacks {
            callback(self);
        }
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "error",
        };
        f.debug_struct("AsyncResult")
            .field("seq", &self.inner.seq)
            .field("status", &status)
            .finish()
    }
}
