//! Conveniences layered over connections and netrefs.

use crate::async_result::AsyncResult;
use crate::brine;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::netref::{Netref, RemoteIter};
use crate::object::{Args, Object};
use crate::protocol::Handler;
use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Pickle protocol requested by [`obtain`].
pub const PICKLE_PROTOCOL: i64 = 4;

/// Serves a connection from a background thread until stopped or the
/// connection closes.
pub struct BgServingThread {
    conn: Connection,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BgServingThread {
    pub fn start(conn: Connection) -> Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let serving = conn.clone();
        let running = active.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tether-bg-{}", conn.connid()))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if let Err(e) = serving.serve(Some(ConnectionConfig::BG_SERVING_SLICE)) {
                        if !e.is_eof() {
                            warn!(connid = %serving.connid(), error = %e, "Background serving failed");
                        }
                        break;
                    }
                }
                running.store(false, Ordering::Release);
            })?;
        debug!(connid = %conn.connid(), "Background serving started");
        Ok(Self {
            conn,
            active,
            handle: Some(handle),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Ask the thread to stop and wait for it.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(connid = %self.conn.connid(), "Background serving thread panicked");
            }
        }
    }
}

impl Drop for BgServingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A remote callable whose invocations return immediately.
#[derive(Clone, Debug)]
pub struct AsyncCallable {
    target: Netref,
}

/// Wrap a remote callable so that calling it yields an [`AsyncResult`].
pub fn async_wrap(target: &Netref) -> AsyncCallable {
    AsyncCallable {
        target: target.clone(),
    }
}

impl AsyncCallable {
    pub fn netref(&self) -> &Netref {
        &self.target
    }

    pub fn call(&self, args: impl Into<Args>) -> Result<AsyncResult> {
        let (positional, keywords) = Netref::split_args(args.into());
        self.target.connection().async_request(
            Handler::Call,
            vec![Object::Netref(self.target.clone()), positional, keywords],
        )
    }

    /// Call a method of the wrapped object without waiting.
    pub fn call_method(&self, name: &str, args: impl Into<Args>) -> Result<AsyncResult> {
        let (positional, keywords) = Netref::split_args(args.into());
        self.target.connection().async_request(
            Handler::CallAttr,
            vec![
                Object::Netref(self.target.clone()),
                Object::from(name),
                positional,
                keywords,
            ],
        )
    }
}

/// A remote callable whose calls fail after `timeout`.
#[derive(Clone, Debug)]
pub struct TimedCallable {
    inner: AsyncCallable,
    timeout: Duration,
}

pub fn timed(target: &Netref, timeout: Duration) -> TimedCallable {
    TimedCallable {
        inner: async_wrap(target),
        timeout,
    }
}

impl TimedCallable {
    pub fn call(&self, args: impl Into<Args>) -> Result<Object> {
        let result = self.inner.call(args)?;
        result.set_expiry(Some(self.timeout));
        result.value()
    }
}

/// Iterate a remote iterable fetching `chunk` items per round trip.
pub fn buffiter(target: &Netref, chunk: usize) -> Result<RemoteIter> {
    target.iter_chunked(chunk)
}

/// Methods the peer reported for the object's type, with their docs.
pub fn inspect_methods(target: &Netref) -> Vec<(String, Option<String>)> {
    target
        .class()
        .methods()
        .iter()
        .map(|(name, doc)| (name.clone(), doc.clone()))
        .collect()
}

/// Copy a remote object's state by value. The owner must allow pickling
/// and its servant must serialize to brine.
pub fn obtain(target: &Netref) -> Result<Value> {
    let bytes = target.pickle(PICKLE_PROTOCOL)?;
    Ok(brine::load(&bytes)?)
}
