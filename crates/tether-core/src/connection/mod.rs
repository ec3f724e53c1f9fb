//! The symmetric RPC endpoint.
//!
//! A [`Connection`] sits on a [`Channel`] and plays both roles at once: it
//! sends requests on behalf of local code (through netrefs) and serves
//! requests the peer makes against local objects.
//!
//! # Threading
//!
//! In shared-serve mode (the default) there is no background thread. Any
//! thread waiting for a reply serves the connection itself: exactly one
//! thread at a time holds the receive lock and reads a frame, then releases
//! the lock before dispatching it, so other threads can keep reading while a
//! handler runs. Waiters that cannot take the receive lock sleep on a
//! progress counter bumped whenever a frame is taken or a result delivered.
//!
//! With `bind_threads` a dedicated receiver thread reads every frame, runs
//! each inbound request on a worker thread of its own, and delivers replies;
//! waiting threads only sleep on the progress counter. Both modes are
//! identical on the wire.

mod access;
mod boxing;
mod handlers;
mod objects;

use crate::async_result::AsyncResult;
use crate::channel::Channel;
use crate::config::{Config, ConnectionConfig, Endpoints};
use crate::error::{Result, TetherError};
use crate::locks::{lock, wait_timeout};
use crate::netref::{Netref, NetrefClass, NetrefInner};
use crate::object::{IdPack, Object, Servant};
use crate::protocol::{Handler, Message, MessageKind};
use crate::service::Service;
use crate::value::Value;
use crate::vinegar::{self, Exception};
use objects::LocalObjects;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

static NEXT_CONNID: AtomicU64 = AtomicU64::new(1);

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        struct Counters {
            $($field: AtomicU64,)*
        }

        /// Message counters of one connection.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct ConnectionStats {
            $(pub $field: u64,)*
        }

        impl Counters {
            fn snapshot(&self) -> ConnectionStats {
                ConnectionStats {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    frames_sent,
    frames_received,
    requests_sent,
    requests_received,
    replies_sent,
    replies_received,
    exceptions_sent,
    exceptions_received,
    dels_received,
    proxies_sent,
    proxies_received,
);

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Netref classes are cached per remote class, separately for references to
/// the class itself and to its instances.
type ClassKey = (String, u64, bool);

pub(crate) struct ConnectionInner {
    connid: String,
    config: Config,
    service: Arc<dyn Service>,
    channel: Channel,
    local_root: Mutex<Option<Arc<dyn Servant>>>,
    remote_root: Mutex<Weak<NetrefInner>>,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    progress: Mutex<u64>,
    progress_cond: Condvar,
    dispatching: AtomicUsize,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, AsyncResult>>,
    local_objects: LocalObjects,
    proxies: Mutex<HashMap<IdPack, Weak<NetrefInner>>>,
    classes: Mutex<HashMap<ClassKey, Arc<NetrefClass>>>,
    closing: AtomicBool,
    closed: AtomicBool,
    stats: Counters,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            debug!(connid = %self.connid, "Dropping unclosed connection");
            self.channel.close();
        }
    }
}

/// One end of an RPC connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// A connection handle that does not keep the connection alive.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Build a connection over `channel`, exposing `service` to the peer.
    pub fn new(service: Arc<dyn Service>, channel: Channel, mut config: Config) -> Result<Self> {
        config.validate()?;
        let connid = config
            .connid
            .clone()
            .unwrap_or_else(|| format!("conn{}", NEXT_CONNID.fetch_add(1, Ordering::Relaxed)));
        if config.endpoints.is_none() {
            config.endpoints = channel
                .stream()
                .endpoints()
                .map(|(local, remote)| Endpoints { local, remote });
        }
        let bind_threads = config.bind_threads;

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                connid,
                config,
                service,
                channel,
                local_root: Mutex::new(None),
                remote_root: Mutex::new(Weak::new()),
                send_lock: Mutex::new(()),
                recv_lock: Mutex::new(()),
                progress: Mutex::new(0),
                progress_cond: Condvar::new(),
                dispatching: AtomicUsize::new(0),
                next_seq: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                local_objects: LocalObjects::default(),
                proxies: Mutex::new(HashMap::new()),
                classes: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stats: Counters::default(),
            }),
        };

        let root = conn.inner.service.root(&conn);
        *lock(&conn.inner.local_root) = Some(root);
        if bind_threads {
            if let Err(e) = conn.spawn_receiver() {
                conn.cleanup("receiver thread failed to start");
                return Err(e);
            }
        }
        info!(
            connid = %conn.connid(),
            logger = conn.inner.config.logger.as_deref().unwrap_or("tether"),
            bind_threads,
            "Connection established"
        );
        if let Err(e) = conn.inner.service.on_connect(&conn) {
            warn!(connid = %conn.connid(), error = %e, "Service rejected connection");
            conn.cleanup("on_connect failed");
            return Err(e);
        }
        Ok(conn)
    }

    pub fn connid(&self) -> &str {
        &self.inner.connid
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.inner.service
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// OS descriptor of the underlying stream, when it has one.
    pub fn fileno(&self) -> Option<i32> {
        self.inner.channel.fileno()
    }

    pub fn endpoints(&self) -> Option<&Endpoints> {
        self.inner.config.endpoints.as_ref()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Number of local objects the peer currently holds references to.
    pub fn local_object_count(&self) -> usize {
        self.inner.local_objects.len()
    }

    /// How many unreleased references the peer holds to `obj`.
    pub fn local_refcount(&self, obj: &Object) -> Option<u64> {
        obj.id_pack()
            .and_then(|id_pack| self.inner.local_objects.refcount(&id_pack))
    }

    /// Number of live netrefs to peer objects.
    pub fn proxy_count(&self) -> usize {
        lock(&self.inner.proxies)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The object this endpoint exposes to the peer.
    pub fn local_root(&self) -> Option<Arc<dyn Servant>> {
        lock(&self.inner.local_root).clone()
    }

    /// The peer's root object. Fetched on first use and reused while any
    /// handle to it is alive.
    pub fn root(&self) -> Result<Netref> {
        let cached = lock(&self.inner.remote_root).upgrade();
        if let Some(inner) = cached {
            return Ok(Netref::from_inner(inner));
        }
        let root = self
            .sync_request(Handler::GetRoot, Vec::new())?
            .into_netref()?;
        *lock(&self.inner.remote_root) = root.downgrade();
        Ok(root)
    }

    /// Names the peer's service answers to.
    pub fn remote_service_aliases(&self) -> Result<Vec<String>> {
        self.sync_request(Handler::GetServiceAliases, Vec::new())?
            .into_items()?
            .into_iter()
            .map(|alias| {
                alias
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TetherError::Protocol("non-string service alias".into()))
            })
            .collect()
    }

    /// Round-trip a payload through the peer.
    pub fn ping(&self) -> Result<()> {
        let data = Value::from("abcdefghijklmnopqrstuvwxyz".repeat(20));
        self.ping_with(data, Some(ConnectionConfig::DEFAULT_PING_TIMEOUT))
    }

    pub fn ping_with(&self, data: Value, timeout: Option<Duration>) -> Result<()> {
        let result = self.async_request(Handler::Ping, vec![Object::from(data.clone())])?;
        result.set_expiry(timeout);
        let echo = result.value()?;
        if echo.as_value() != Some(&data) {
            return Err(TetherError::Protocol("ping echo mismatch".to_string()));
        }
        Ok(())
    }

    /// Send a request and block until its reply arrives or the configured
    /// `sync_request_timeout` passes.
    pub fn sync_request(&self, handler: Handler, args: Vec<Object>) -> Result<Object> {
        let result = self.async_request(handler, args)?;
        result.set_expiry(self.inner.config.sync_timeout());
        result.value()
    }

    /// Send a request without waiting for its reply.
    pub fn async_request(&self, handler: Handler, args: Vec<Object>) -> Result<AsyncResult> {
        self.ensure_open()?;
        let payload = self.box_object(&Object::tuple(args))?;
        let (seq, result) = {
            let mut pending = lock(&self.inner.pending);
            let seq = self.allocate_seq(&pending);
            let result = AsyncResult::new(self.clone(), seq);
            pending.insert(seq, result.clone());
            (seq, result)
        };
        trace!(connid = %self.connid(), seq, handler = %handler, "Sending request");
        if let Err(e) = self.send_message(&Message::request(seq, handler, payload.clone())) {
            let abandoned = lock(&self.inner.pending).remove(&seq);
            drop(abandoned);
            self.release_boxed(&payload);
            return Err(e);
        }
        bump(&self.inner.stats.requests_sent);
        Ok(result)
    }

    /// Send a request whose reply will be discarded.
    pub(crate) fn send_oneway(&self, handler: Handler, args: Vec<Object>) -> Result<()> {
        self.ensure_open()?;
        let payload = self.box_object(&Object::tuple(args))?;
        let seq = {
            let pending = lock(&self.inner.pending);
            self.allocate_seq(&pending)
        };
        if let Err(e) = self.send_message(&Message::request(seq, handler, payload.clone())) {
            self.release_boxed(&payload);
            return Err(e);
        }
        bump(&self.inner.stats.requests_sent);
        Ok(())
    }

    /// Next sequence number not held by an outstanding request.
    fn allocate_seq(&self, pending: &HashMap<u32, AsyncResult>) -> u32 {
        loop {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&seq) {
                return seq;
            }
        }
    }

    /// Forget an outstanding request; a late reply will be discarded.
    /// Returns false if the reply was already taken for delivery.
    pub(crate) fn abandon(&self, seq: u32) -> bool {
        let removed = lock(&self.inner.pending).remove(&seq);
        if removed.is_some() {
            debug!(connid = %self.connid(), seq, "Abandoned request");
        }
        removed.is_some()
    }

    /// Serve one incoming message. Returns false if none arrived within
    /// `timeout` (`None` waits indefinitely).
    pub fn serve(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.serve_step(deadline, &|| false)
    }

    /// Serve every message that arrives within `timeout` of the previous
    /// one. End-of-stream ends the loop quietly.
    pub fn poll_all(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut served = false;
        loop {
            match self.serve(timeout) {
                Ok(true) => served = true,
                Ok(false) => return Ok(served),
                Err(e) if e.is_eof() => return Ok(served),
                Err(e) => return Err(e),
            }
        }
    }

    /// Serve until the connection closes, then close it.
    pub fn serve_all(&self) -> Result<()> {
        let served = loop {
            if self.closed() {
                break Ok(());
            }
            match self.serve(Some(ConnectionConfig::DEFAULT_SERVE_TIMEOUT)) {
                Ok(_) => {}
                Err(e) if e.is_eof() => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let closed = self.close();
        served.and(closed)
    }

    /// Serve until `done` holds or `deadline` passes; returns whether `done`
    /// held.
    pub(crate) fn serve_until(
        &self,
        deadline: Option<Instant>,
        done: &dyn Fn() -> bool,
    ) -> Result<bool> {
        loop {
            if done() {
                return Ok(true);
            }
            if !self.serve_step(deadline, done)? {
                return Ok(done());
            }
        }
    }

    fn deadline_passed(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Make progress: serve one message, observe progress made by another
    /// thread, or see `done` become true. False on timeout.
    fn serve_step(&self, deadline: Option<Instant>, done: &dyn Fn() -> bool) -> Result<bool> {
        loop {
            self.ensure_open()?;
            if done() {
                return Ok(true);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let generation = *lock(&self.inner.progress);

            let guard = if self.inner.config.bind_threads {
                None
            } else {
                match self.inner.recv_lock.try_lock() {
                    Ok(guard) => Some(guard),
                    Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                    Err(TryLockError::WouldBlock) => None,
                }
            };
            let Some(guard) = guard else {
                if self.wait_progress(generation, remaining) {
                    return Ok(true);
                }
                if Self::deadline_passed(deadline) {
                    return Ok(false);
                }
                continue;
            };

            if done() {
                drop(guard);
                self.notify_progress();
                return Ok(true);
            }
            // A result may be delivered by the thread currently dispatching,
            // so only block briefly while one is
            let slice = if self.inner.dispatching.load(Ordering::Acquire) > 0 {
                Some(remaining.map_or(ConnectionConfig::DISPATCH_POLL_SLICE, |r| {
                    r.min(ConnectionConfig::DISPATCH_POLL_SLICE)
                }))
            } else {
                remaining
            };
            let received = match self.inner.channel.poll(slice) {
                Ok(true) => self.inner.channel.recv().map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            };
            if matches!(received, Ok(Some(_))) {
                self.inner.dispatching.fetch_add(1, Ordering::AcqRel);
            }
            drop(guard);
            self.notify_progress();

            let data = match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    if Self::deadline_passed(deadline) {
                        return Ok(false);
                    }
                    continue;
                }
                Err(e) => return Err(self.fatal(e)),
            };
            let dispatched = self.dispatch(&data);
            self.inner.dispatching.fetch_sub(1, Ordering::AcqRel);
            self.notify_progress();
            return dispatched.map(|()| true);
        }
    }

    /// Sleep until the progress counter moves past `generation`.
    fn wait_progress(&self, generation: u64, timeout: Option<Duration>) -> bool {
        let current = lock(&self.inner.progress);
        if *current != generation {
            return true;
        }
        let current = wait_timeout(&self.inner.progress_cond, current, timeout);
        *current != generation
    }

    pub(crate) fn notify_progress(&self) {
        let mut generation = lock(&self.inner.progress);
        *generation = generation.wrapping_add(1);
        self.inner.progress_cond.notify_all();
    }

    fn spawn_receiver(&self) -> Result<()> {
        let weak = self.downgrade();
        std::thread::Builder::new()
            .name(format!("tether-recv-{}", self.connid()))
            .spawn(move || {
                while let Some(conn) = weak.upgrade() {
                    if conn.closed() {
                        break;
                    }
                    if let Err(e) = conn.receive_bound(ConnectionConfig::BG_SERVING_SLICE) {
                        if !e.is_eof() {
                            debug!(connid = %conn.connid(), error = %e, "Receiver stopped");
                        }
                        break;
                    }
                }
            })?;
        Ok(())
    }

    /// One slice of the bound-threads receiver loop.
    fn receive_bound(&self, slice: Duration) -> Result<()> {
        let received = {
            let _guard = lock(&self.inner.recv_lock);
            match self.inner.channel.poll(Some(slice)) {
                Ok(true) => self.inner.channel.recv().map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            }
        };
        let data = match received {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.fatal(e)),
        };
        let msg = self.decode(&data)?;
        match msg.kind {
            MessageKind::Request => {
                let conn = self.clone();
                let worker = std::thread::Builder::new()
                    .name(format!("tether-worker-{}", self.connid()))
                    .spawn(move || {
                        if let Err(e) = conn.dispatch_request(&msg) {
                            conn.dispatch_failed(e);
                        }
                    });
                if let Err(e) = worker {
                    return Err(self.fatal(e.into()));
                }
            }
            _ => self.dispatch_reply(msg, true)?,
        }
        self.notify_progress();
        Ok(())
    }

    fn dispatch_failed(&self, err: TetherError) {
        if err.is_fatal() {
            self.cleanup(&err.to_string());
        } else {
            warn!(connid = %self.connid(), error = %err, "Request raised locally");
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Message> {
        bump(&self.inner.stats.frames_received);
        Message::decode(data).map_err(|e| self.fatal(e))
    }

    fn dispatch(&self, data: &[u8]) -> Result<()> {
        let msg = self.decode(data)?;
        match msg.kind {
            MessageKind::Request => self.dispatch_request(&msg),
            MessageKind::Reply | MessageKind::Exception => self.dispatch_reply(msg, false),
        }
    }

    fn dispatch_request(&self, msg: &Message) -> Result<()> {
        let (handler, args) = msg.request_parts().map_err(|e| self.fatal(e))?;
        bump(&self.inner.stats.requests_received);
        trace!(connid = %self.connid(), seq = msg.seq, handler = %handler, "Dispatching request");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle_request(handler, args)))
            .unwrap_or_else(|payload| Err(panic_error(payload)));
        if handler == Handler::Close {
            return Ok(());
        }
        let reply = outcome.and_then(|obj| {
            let boxed = self.box_object(&obj)?;
            Message::new(MessageKind::Reply, msg.seq, boxed).encode()
        });
        match reply {
            Ok(data) => {
                self.send_frame(&data)?;
                bump(&self.inner.stats.replies_sent);
                Ok(())
            }
            Err(e) => self.send_exception(msg.seq, handler, e),
        }
    }

    fn send_exception(&self, seq: u32, handler: Handler, err: TetherError) -> Result<()> {
        let exc = err
            .into_exception()
            .with_frame(format!("handler {} (seq {})", handler, seq));
        let config = &self.inner.config;
        if (exc.is_system_exit() && config.propagate_system_exit_locally)
            || (exc.is_keyboard_interrupt() && config.propagate_keyboard_interrupt_locally)
        {
            return Err(exc.into());
        }
        if !exc.is_stop_iteration() {
            debug!(
                connid = %self.connid(),
                seq,
                handler = %handler,
                exception = %exc.qualified_name(),
                message = %exc.message(),
                "Request failed"
            );
        }
        let payload = vinegar::dump(&exc, config);
        self.send_message(&Message::new(MessageKind::Exception, seq, payload))?;
        bump(&self.inner.stats.exceptions_sent);
        Ok(())
    }

    /// Deliver a reply to its waiter. With `deferred`, anything that may
    /// need a round trip to unbox is moved off the calling thread.
    fn dispatch_reply(&self, msg: Message, deferred: bool) -> Result<()> {
        match msg.kind {
            MessageKind::Exception => bump(&self.inner.stats.exceptions_received),
            _ => bump(&self.inner.stats.replies_received),
        }
        let waiter = lock(&self.inner.pending).remove(&msg.seq);
        let offline = msg.kind != MessageKind::Reply || boxing::is_value_box(&msg.payload);

        if deferred && !offline {
            let conn = self.clone();
            let worker = std::thread::Builder::new()
                .name(format!("tether-unbox-{}", self.connid()))
                .spawn(move || {
                    if let Err(e) = conn.deliver(&msg, waiter) {
                        conn.dispatch_failed(e);
                    }
                });
            return match worker {
                Ok(_) => Ok(()),
                Err(e) => Err(self.fatal(e.into())),
            };
        }
        self.deliver(&msg, waiter)
    }

    fn deliver(&self, msg: &Message, waiter: Option<AsyncResult>) -> Result<()> {
        let Some(result) = waiter else {
            trace!(connid = %self.connid(), seq = msg.seq, "Discarding reply to abandoned request");
            if msg.kind == MessageKind::Reply {
                // Unbox so that references it carries are released again
                drop(self.unbox(&msg.payload));
            }
            return Ok(());
        };
        let outcome = match msg.kind {
            MessageKind::Reply => self.unbox(&msg.payload),
            _ => vinegar::load(&msg.payload, &self.inner.config).and_then(|exc| Err(exc.into())),
        };
        let fatal = outcome.as_ref().err().filter(|e| e.is_fatal()).cloned();
        result.set(outcome);
        match fatal {
            Some(e) => Err(self.fatal(e)),
            None => Ok(()),
        }
    }

    fn send_message(&self, msg: &Message) -> Result<()> {
        let data = msg.encode()?;
        self.send_frame(&data)
    }

    fn send_frame(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let sent = {
            let _guard = lock(&self.inner.send_lock);
            self.inner.channel.send(data)
        };
        sent.map_err(|e| self.fatal(e))?;
        bump(&self.inner.stats.frames_sent);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            return Err(TetherError::Closed(self.inner.connid.clone()));
        }
        Ok(())
    }

    /// Tear the connection down if `err` leaves the stream unusable.
    fn fatal(&self, err: TetherError) -> TetherError {
        if err.is_fatal() {
            self.cleanup(&err.to_string());
        }
        err
    }

    pub(crate) fn forget_proxy(&self, id_pack: &IdPack) {
        let mut proxies = lock(&self.inner.proxies);
        if proxies
            .get(id_pack)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            proxies.remove(id_pack);
        }
    }

    /// Orderly shutdown: run `before_closed`, tell the peer, release
    /// everything. Later calls do nothing.
    pub fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) || self.closed() {
            return Ok(());
        }
        let mut failure = None;
        if let Some(hook) = &self.inner.config.before_closed {
            if let Err(e) = hook.call(self) {
                failure = Some(e);
            }
        }
        if let Err(e) = self.send_oneway(Handler::Close, Vec::new()) {
            if !e.is_eof() && failure.is_none() {
                failure = Some(e);
            }
        }
        self.cleanup("closed locally");
        match failure {
            Some(e) if !self.inner.config.close_catchall => Err(e),
            Some(e) => {
                debug!(connid = %self.connid(), error = %e, "Ignored error while closing");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Mark closed, fail outstanding requests and release every table.
    fn cleanup(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closing.store(true, Ordering::Release);
        debug!(connid = %self.connid(), reason, "Cleaning up connection");
        self.inner.channel.close();

        let pending: Vec<AsyncResult> = lock(&self.inner.pending)
            .drain()
            .map(|(_, result)| result)
            .collect();
        for result in &pending {
            result.set(Err(TetherError::Eof(format!(
                "connection {} closed: {}",
                self.inner.connid, reason
            ))));
        }
        self.inner.service.on_disconnect(self);

        // Dropped outside the table locks
        let objects = self.inner.local_objects.clear();
        let proxies = std::mem::take(&mut *lock(&self.inner.proxies));
        let classes = std::mem::take(&mut *lock(&self.inner.classes));
        let root = lock(&self.inner.local_root).take();
        drop((pending, objects, proxies, classes, root));

        self.notify_progress();
        info!(connid = %self.connid(), "Connection closed");
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> TetherError {
    let payload = match payload.downcast::<Exception>() {
        Ok(exc) => return (*exc).into(),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<TetherError>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Exception::runtime_error(format!("handler panicked: {}", message)).into()
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connid", &self.inner.connid)
            .field("closed", &self.closed())
            .finish()
    }
}
