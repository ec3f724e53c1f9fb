//! Hook run on every accepted socket before a connection is built on it.

use crate::error::Result;
use std::net::TcpStream;
use tether::{SocketStream, Stream};

/// The stream to run the protocol over, plus whatever the authenticator
/// learned about the peer. The credentials end up in the connection's
/// `credentials` config key.
pub type Authenticated = (Box<dyn Stream>, Option<serde_json::Value>);

/// Vets a freshly accepted socket.
///
/// Runs on a blocking task, so it may perform its own handshake on the
/// socket. It may also wrap the socket (e.g. in TLS) by returning a
/// different [`Stream`].
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, stream: TcpStream) -> Result<Authenticated>;
}

/// Accepts every peer as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, stream: TcpStream) -> Result<Authenticated> {
        Ok((Box::new(SocketStream::from_tcp(stream)), None))
    }
}

impl<F> Authenticator for F
where
    F: Fn(TcpStream) -> Result<Authenticated> + Send + Sync + 'static,
{
    fn authenticate(&self, stream: TcpStream) -> Result<Authenticated> {
        self(stream)
    }
}
