//! Accept loop for tether services.
//!
//! [`TetherServer`] listens on a TCP port from a tokio runtime and turns each
//! accepted socket into a [`tether::Connection`]. The protocol core is
//! blocking, so every connection is authenticated and served on its own
//! blocking task until the peer goes away or the server shuts down.

pub mod authenticator;
pub mod config;
pub mod error;
pub mod server;

pub use authenticator::{Authenticated, Authenticator, NoAuthenticator};
pub use config::{ServerConfig, ServerOptions};
pub use error::{Result, ServerError};
pub use server::{ServerHandle, TetherServer};
