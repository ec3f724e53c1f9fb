//! Acceptor settings.

use crate::authenticator::{Authenticator, NoAuthenticator};
use std::fmt;
use std::sync::Arc;
use tether::Config;

/// Fixed acceptor limits.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
}

/// How a [`crate::TetherServer`] listens and what each connection gets.
#[derive(Clone)]
pub struct ServerOptions {
    pub host: String,
    /// 0 lets the OS pick a port.
    pub port: u16,
    /// Sockets accepted beyond this many live connections are dropped.
    pub max_connections: usize,
    /// Template for every connection's config. `credentials` and
    /// `endpoints` are filled in per connection.
    pub config: Config,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: ServerConfig::DEFAULT_HOST.to_string(),
            port: 0,
            max_connections: ServerConfig::DEFAULT_MAX_CONNECTIONS,
            config: Config::default(),
            authenticator: Arc::new(NoAuthenticator),
        }
    }
}

impl ServerOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
