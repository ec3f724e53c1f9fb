//! Connection factories over the supported transports.

use crate::channel::Channel;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::Result;
use crate::service::Service;
use crate::stream::{SocketStream, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(unix)]
use crate::stream::PipeStream;
#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::path::Path;

pub fn connect_channel(
    channel: Channel,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    Connection::new(service, channel, config)
}

/// Frame `stream` with the configured compression and frame limits.
pub fn connect_stream(
    stream: impl Stream + 'static,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    let channel = Channel::with_config(Box::new(stream), &config);
    connect_channel(channel, service, config)
}

pub fn connect_tcp(
    host: &str,
    port: u16,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    connect_tcp_timeout(host, port, None, service, config)
}

/// [`connect_tcp`] with a bound on establishing the socket.
pub fn connect_tcp_timeout(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    debug!(host, port, "Connecting over TCP");
    let stream = SocketStream::connect(host, port, timeout)?;
    connect_stream(stream, service, config)
}

#[cfg(unix)]
pub fn connect_unix(
    path: impl AsRef<Path>,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    debug!(path = %path.as_ref().display(), "Connecting over unix socket");
    let stream = SocketStream::connect_unix(path)?;
    connect_stream(stream, service, config)
}

/// A connection over a pair of pipe ends.
#[cfg(unix)]
pub fn connect_pipes(
    reader: impl Into<OwnedFd>,
    writer: impl Into<OwnedFd>,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    connect_stream(PipeStream::new(reader, writer), service, config)
}

/// A connection to a child process over its stdin and stdout.
#[cfg(unix)]
pub fn connect_child(
    child: &mut std::process::Child,
    service: Arc<dyn Service>,
    config: Config,
) -> Result<Connection> {
    debug!(pid = child.id(), "Connecting to child process");
    connect_stream(PipeStream::from_child(child)?, service, config)
}

/// Two connected endpoints in this process, over a unix socket pair.
#[cfg(unix)]
pub fn connect_pair(
    service_a: Arc<dyn Service>,
    config_a: Config,
    service_b: Arc<dyn Service>,
    config_b: Config,
) -> Result<(Connection, Connection)> {
    let (a, b) = SocketStream::pair()?;
    let first = connect_stream(a, service_a, config_a)?;
    let second = match connect_stream(b, service_b, config_b) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = first.close();
            return Err(e);
        }
    };
    Ok((first, second))
}
