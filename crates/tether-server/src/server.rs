//! TCP acceptor for a tether service.
//!
//! Listens on the configured address, accepts peers, and hands each socket
//! to a blocking task that authenticates it, builds a
//! [`Connection`](tether::Connection) and serves it until it closes.
//!
//! # Thread Safety
//!
//! The accept loop runs on the tokio runtime. Connections never touch the
//! runtime's async workers: each one occupies a blocking-pool thread for its
//! whole life. Live connections are tracked in a shared registry so that
//! shutdown can close them from any thread.

use crate::authenticator::Authenticator;
use crate::config::ServerOptions;
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tether::{connect_channel, Channel, Connection, Endpoints, Service};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Connections being served, and whether shutdown has begun. Both live under
/// one lock so a connection finishing its handshake either registers before
/// shutdown drains the table or sees the flag and closes itself.
#[derive(Default)]
struct LiveConnections {
    closing: bool,
    served: HashMap<String, Connection>,
}

type Registry = Arc<Mutex<LiveConnections>>;

fn registry_lock(registry: &Registry) -> MutexGuard<'_, LiveConnections> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// One occupied `max_connections` slot. Released on drop, including when a
/// service hook panics.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
    connections: Registry,
    connid: Option<String>,
}

impl ConnectionSlot {
    fn claim(active: Arc<AtomicUsize>, connections: Registry) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            active,
            connections,
            connid: None,
        }
    }

    /// Register `conn` for shutdown. Returns false if shutdown has already
    /// begun.
    fn register(&mut self, conn: &Connection) -> bool {
        let mut live = registry_lock(&self.connections);
        if live.closing {
            return false;
        }
        live.served.insert(conn.connid().to_string(), conn.clone());
        self.connid = Some(conn.connid().to_string());
        true
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(connid) = self.connid.take() {
            let removed = registry_lock(&self.connections).served.remove(&connid);
            drop(removed);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a running server. Dropping shuts the server down.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connections: Registry,
    active: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted and not yet finished, including ones still
    /// authenticating.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of the connections currently being served.
    pub fn connections(&self) -> Vec<Connection> {
        registry_lock(&self.connections)
            .served
            .values()
            .cloned()
            .collect()
    }

    /// Stop accepting and close every live connection. Peers still
    /// handshaking are closed as soon as their connection is built.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let live: Vec<Connection> = {
            let mut live = registry_lock(&self.connections);
            live.closing = true;
            live.served.drain().map(|(_, conn)| conn).collect()
        };
        for conn in live {
            if let Err(e) = conn.close() {
                debug!(connid = %conn.connid(), error = %e, "Close during shutdown failed");
            }
        }
    }

    /// Wait for the accept loop to exit after [`ServerHandle::shutdown`].
    pub async fn stopped(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Server that exposes one service to every peer that connects.
pub struct TetherServer;

impl TetherServer {
    /// Bind and start accepting in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(service: Arc<dyn Service>, options: ServerOptions) -> Result<ServerHandle> {
        options.config.validate()?;
        let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
        let addr = listener.local_addr()?;
        info!("Tether server for {} listening on {}", service.name(), addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let connections: Registry = Arc::new(Mutex::new(LiveConnections::default()));
        let active = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            service,
            options,
            shutdown_rx,
            connections.clone(),
            active.clone(),
        ));

        Ok(ServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            connections,
            active,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        service: Arc<dyn Service>,
        options: ServerOptions,
        mut shutdown_rx: oneshot::Receiver<()>,
        connections: Registry,
        active: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Tether server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active.load(Ordering::Acquire);
                            if current >= options.max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    options.max_connections
                                );
                                continue;
                            }

                            let slot = ConnectionSlot::claim(active.clone(), connections.clone());
                            let service = service.clone();
                            let options = options.clone();

                            tokio::task::spawn_blocking(move || {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, service, &options, slot)
                                {
                                    debug!("Connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Authenticate, connect and serve one peer. Runs on a blocking thread.
    fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        service: Arc<dyn Service>,
        options: &ServerOptions,
        mut slot: ConnectionSlot,
    ) -> Result<()> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let local_addr = stream.local_addr()?;

        let (transport, credentials) = match Authenticator::authenticate(&*options.authenticator, stream) {
            Ok(authenticated) => authenticated,
            Err(e) => {
                warn!("Authentication of {} failed: {}", peer_addr, e);
                return Err(e);
            }
        };

        let mut config = options.config.clone();
        config.credentials = credentials;
        config.endpoints = Some(Endpoints {
            local: local_addr.to_string(),
            remote: peer_addr.to_string(),
        });
        let channel = Channel::with_config(transport, &config);
        let conn = connect_channel(channel, service, config)?;
        if !slot.register(&conn) {
            info!(connid = %conn.connid(), peer = %peer_addr, "Server shutting down, closing new connection");
            return conn.close().map_err(Into::into);
        }
        info!(connid = %conn.connid(), peer = %peer_addr, "Accepted connection");

        let served = conn.serve_all();
        drop(slot);
        debug!(connid = %conn.connid(), "Connection finished");
        served.map_err(Into::into)
    }
}
