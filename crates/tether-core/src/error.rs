//! Error types for tether connections.
//!
//! A single error enum covers transport, protocol, codec and remote failures.
//! Remote exceptions travel as [`Exception`] values and surface here as
//! [`TetherError::Remote`].

use crate::brine::BrineError;
use crate::object::IdPack;
use crate::vinegar::Exception;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for tether.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    // Transport errors
    #[error("Connection closed: {0}")]
    Eof(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    // Protocol errors
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // Serialization errors
    #[error("Codec error: {0}")]
    Codec(#[from] BrineError),

    // Errors raised by a handler, locally or on the peer
    #[error("{0}")]
    Remote(Box<Exception>),

    #[error("Result expired after {0:?}")]
    Timeout(Duration),

    #[error("Stale reference to {0}")]
    StaleReference(IdPack),

    #[error("Connection {0} is closed")]
    Closed(String),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<Exception> for TetherError {
    fn from(exc: Exception) -> Self {
        TetherError::Remote(Box::new(exc))
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Config {
            message: err.to_string(),
        }
    }
}

impl TetherError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Transport, protocol and codec faults leave the stream in an unknown
    /// state; everything else is isolated to a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::Eof(_)
                | TetherError::Io { .. }
                | TetherError::Protocol(_)
                | TetherError::Codec(_)
                | TetherError::Closed(_)
        )
    }

    /// Whether this is an end-of-stream condition.
    pub fn is_eof(&self) -> bool {
        matches!(self, TetherError::Eof(_) | TetherError::Closed(_))
    }

    /// The exception carried by this error, if it is one.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            TetherError::Remote(exc) => Some(exc),
            _ => None,
        }
    }

    /// Check whether the error is an exhausted-iterator signal.
    pub fn is_stop_iteration(&self) -> bool {
        self.exception().is_some_and(Exception::is_stop_iteration)
    }

    /// Convert any error into an exception that can be shipped to the peer.
    pub fn into_exception(self) -> Exception {
        match self {
            TetherError::Remote(exc) => *exc,
            TetherError::Eof(msg) => Exception::eof_error(msg),
            TetherError::Closed(connid) => {
                Exception::eof_error(format!("connection {} is closed", connid))
            }
            TetherError::Io { message, .. } => Exception::os_error(message),
            TetherError::Protocol(msg) => Exception::runtime_error(msg),
            TetherError::Codec(err) => Exception::type_error(err.to_string()),
            TetherError::Timeout(after) => {
                Exception::timeout_error(format!("result expired after {:?}", after))
            }
            TetherError::StaleReference(id_pack) => {
                Exception::reference_error(format!("{} no longer exists", id_pack))
            }
            TetherError::Config { message } => Exception::value_error(message),
        }
    }

    /// Shorthand for an attribute error raised by an access check.
    pub fn attribute(message: impl Into<String>) -> Self {
        Exception::attribute_error(message).into()
    }

    /// Shorthand for a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Exception::type_error(message).into()
    }

    /// Shorthand for a value error.
    pub fn value_error(message: impl Into<String>) -> Self {
        Exception::value_error(message).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::Protocol("invalid frame terminator".into());
        assert_eq!(
            err.to_string(),
            "Protocol violation: invalid frame terminator"
        );
        assert_eq!(
            TetherError::Timeout(Duration::from_secs(1)).to_string(),
            "Result expired after 1s"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TetherError::Eof("reset".into()).is_fatal());
        assert!(TetherError::Protocol("bad".into()).is_fatal());
        assert!(!TetherError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!TetherError::value_error("boom").is_fatal());
    }

    #[test]
    fn test_into_exception_maps_kinds() {
        let exc = TetherError::StaleReference(IdPack::new("builtins.list", 7, 9)).into_exception();
        assert!(exc.is_instance_of("builtins.ReferenceError"));

        let exc = TetherError::Timeout(Duration::from_millis(5)).into_exception();
        assert!(exc.is_instance_of("builtins.OSError"));

        let exc = TetherError::Eof("peer went away".into()).into_exception();
        assert_eq!(exc.name(), "EOFError");
    }

    #[test]
    fn test_stop_iteration_detection() {
        assert!(TetherError::from(Exception::stop_iteration()).is_stop_iteration());
        assert!(!TetherError::value_error("x").is_stop_iteration());
    }
}
