//! Errors raised while accepting connections.

use tether::TetherError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The authenticator refused the peer. The socket is dropped.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Tether(#[from] TetherError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::Authentication("bad token".into());
        assert_eq!(err.to_string(), "Authentication failed: bad token");

        let err = ServerError::from(TetherError::Protocol("bad frame".into()));
        assert_eq!(err.to_string(), "Protocol violation: bad frame");
    }
}
