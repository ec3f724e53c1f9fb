//! Connection configuration.
//!
//! Fixed tuning constants live on unit structs. Per-connection policy is the
//! [`Config`] dictionary, deserializable from a partial JSON object so that
//! only the keys that differ from the defaults need to be given.

use crate::connection::Connection;
use crate::error::{Result, TetherError};
use crate::vinegar::ExceptionRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stream-level tuning.
pub struct TransportConfig;

impl TransportConfig {
    // Per-syscall fragment sizes, kept under kernel buffer limits
    pub const IO_CHUNK_SIZE_SOCKET: usize = 8000;
    pub const IO_CHUNK_SIZE_PIPE: usize = 32000;
}

/// Frame layout.
pub struct ChannelConfig;

impl ChannelConfig {
    pub const HEADER_LEN: usize = 5;
    pub const TERMINATOR: u8 = b'\n';
    pub const FLAG_PLAIN: u8 = 0;
    pub const FLAG_COMPRESSED: u8 = 1;
    pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;
    pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 3000;
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
}

/// Codec limits.
pub struct CodecConfig;

impl CodecConfig {
    pub const MAX_NESTING_DEPTH: usize = 256;
}

/// Connection-loop timing.
pub struct ConnectionConfig;

impl ConnectionConfig {
    pub const DEFAULT_SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_SERVE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
    pub const BG_SERVING_SLICE: Duration = Duration::from_millis(100);
    // Poll granularity while another thread is dispatching a message
    pub const DISPATCH_POLL_SLICE: Duration = Duration::from_millis(10);
    pub const BUFFITER_CHUNK: usize = 10;
    pub const BIND_THREADS_ENV: &'static str = "TETHER_BIND_THREADS";
    pub const TRACEBACK_DENIED: &'static str = "<traceback denied>";
}

/// Hook run by [`Connection::close`] before the CLOSE notification is sent.
#[derive(Clone)]
pub struct BeforeClosedHook(Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>);

impl BeforeClosedHook {
    pub fn new(hook: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub(crate) fn call(&self, conn: &Connection) -> Result<()> {
        (self.0)(conn)
    }
}

impl fmt::Debug for BeforeClosedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BeforeClosedHook(..)")
    }
}

/// The local and remote addresses of a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub local: String,
    pub remote: String,
}

/// Per-connection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub allow_safe_attrs: bool,
    pub allow_exposed_attrs: bool,
    pub allow_public_attrs: bool,
    pub allow_all_attrs: bool,
    pub safe_attrs: BTreeSet<String>,
    pub exposed_prefix: String,
    pub allow_getattr: bool,
    pub allow_setattr: bool,
    pub allow_delattr: bool,
    pub allow_pickle: bool,
    pub include_local_traceback: bool,
    pub include_local_version: bool,
    pub instantiate_custom_exceptions: bool,
    pub import_custom_exceptions: bool,
    #[serde(rename = "propagate_SystemExit_locally")]
    pub propagate_system_exit_locally: bool,
    #[serde(rename = "propagate_KeyboardInterrupt_locally")]
    pub propagate_keyboard_interrupt_locally: bool,
    /// Seconds; `None` waits forever.
    pub sync_request_timeout: Option<f64>,
    pub connid: Option<String>,
    pub credentials: Option<serde_json::Value>,
    pub endpoints: Option<Endpoints>,
    pub logger: Option<String>,
    pub close_catchall: bool,
    pub bind_threads: bool,
    pub compression_level: u32,
    pub compression_threshold: usize,
    pub max_frame_size: usize,
    /// Attribute names a netref refuses locally without asking the peer.
    pub deleted_netref_attrs: BTreeSet<String>,
    #[serde(skip)]
    pub before_closed: Option<BeforeClosedHook>,
    #[serde(skip)]
    pub exceptions: ExceptionRegistry,
}

const SAFE_ATTRS: &[&str] = &[
    "__abs__", "__add__", "__and__", "__bool__", "__contains__", "__delitem__",
    "__divmod__", "__doc__", "__enter__", "__eq__", "__exit__", "__float__",
    "__floordiv__", "__format__", "__ge__", "__getitem__", "__gt__", "__hash__",
    "__iadd__", "__iand__", "__ifloordiv__", "__ilshift__", "__imod__", "__imul__",
    "__index__", "__int__", "__invert__", "__ior__", "__ipow__", "__irshift__",
    "__isub__", "__iter__", "__itruediv__", "__ixor__", "__le__", "__len__",
    "__length_hint__", "__lshift__", "__lt__", "__mod__", "__mul__", "__ne__",
    "__neg__", "__next__", "__or__", "__pos__", "__pow__", "__radd__", "__rand__",
    "__rdivmod__", "__repr__", "__rfloordiv__", "__rlshift__", "__rmod__",
    "__rmul__", "__ror__", "__rpow__", "__rrshift__", "__rshift__", "__rsub__",
    "__rtruediv__", "__rxor__", "__setitem__", "__str__", "__sub__", "__truediv__",
    "__xor__", "next",
];

const DELETED_NETREF_ATTRS: &[&str] = &["__array_struct__", "__array_interface__"];

fn bind_threads_from_env() -> bool {
    std::env::var(ConnectionConfig::BIND_THREADS_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_safe_attrs: true,
            allow_exposed_attrs: true,
            allow_public_attrs: false,
            allow_all_attrs: false,
            safe_attrs: SAFE_ATTRS.iter().map(|s| s.to_string()).collect(),
            exposed_prefix: "exposed_".to_string(),
            allow_getattr: true,
            allow_setattr: false,
            allow_delattr: false,
            allow_pickle: false,
            include_local_traceback: true,
            include_local_version: true,
            instantiate_custom_exceptions: false,
            import_custom_exceptions: false,
            propagate_system_exit_locally: false,
            propagate_keyboard_interrupt_locally: true,
            sync_request_timeout: Some(
                ConnectionConfig::DEFAULT_SYNC_REQUEST_TIMEOUT.as_secs_f64(),
            ),
            connid: None,
            credentials: None,
            endpoints: None,
            logger: None,
            close_catchall: false,
            bind_threads: bind_threads_from_env(),
            compression_level: ChannelConfig::DEFAULT_COMPRESSION_LEVEL,
            compression_threshold: ChannelConfig::DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_size: ChannelConfig::DEFAULT_MAX_FRAME_SIZE,
            deleted_netref_attrs: DELETED_NETREF_ATTRS.iter().map(|s| s.to_string()).collect(),
            before_closed: None,
            exceptions: ExceptionRegistry::default(),
        }
    }
}

impl Config {
    /// Build a config from a partial JSON dictionary.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from an already-parsed dictionary.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Config = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(TetherError::Config {
                message: format!(
                    "compression_level must be 0..=9, got {}",
                    self.compression_level
                ),
            });
        }
        if self.max_frame_size == 0 {
            return Err(TetherError::Config {
                message: "max_frame_size must be positive".to_string(),
            });
        }
        if let Some(secs) = self.sync_request_timeout {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(TetherError::Config {
                    message: format!(
                        "sync_request_timeout must be a non-negative number of seconds that fits a duration, got {}",
                        secs
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn with_before_closed(
        mut self,
        hook: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.before_closed = Some(BeforeClosedHook::new(hook));
        self
    }

    pub fn with_connid(mut self, connid: impl Into<String>) -> Self {
        self.connid = Some(connid.into());
        self
    }

    pub fn with_bind_threads(mut self, bind_threads: bool) -> Self {
        self.bind_threads = bind_threads;
        self
    }

    pub fn with_sync_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_request_timeout = timeout.map(|t| t.as_secs_f64());
        self
    }

    /// Default deadline for synchronous requests.
    ///
    /// Values that do not fit a `Duration` mean no deadline.
    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_request_timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Whether `name` is one of the safe dunder names.
    pub fn is_safe_attr(&self, name: &str) -> bool {
        self.safe_attrs.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.allow_safe_attrs);
        assert!(!config.allow_pickle);
        assert!(!config.allow_setattr);
        assert_eq!(config.exposed_prefix, "exposed_");
        assert_eq!(config.sync_timeout(), Some(Duration::from_secs(30)));
        assert!(config.is_safe_attr("__len__"));
        assert!(!config.is_safe_attr("__dict__"));
        assert!(config.deleted_netref_attrs.contains("__array_interface__"));
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let err = Config::from_json(r#"{"sync_request_timeout": 1e30}"#).unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
        assert!(Config::from_json(r#"{"sync_request_timeout": -1.0}"#).is_err());

        // A struct literal skips validation but must not panic
        let config = Config {
            sync_request_timeout: Some(1e30),
            ..Config::default()
        };
        assert_eq!(config.sync_timeout(), None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_dictionary_overrides() {
        let config = Config::from_json(
            r#"{
                "allow_public_attrs": true,
                "sync_request_timeout": null,
                "propagate_SystemExit_locally": true,
                "connid": "worker-1"
            }"#,
        )
        .unwrap();
        assert!(config.allow_public_attrs);
        assert!(config.propagate_system_exit_locally);
        assert_eq!(config.sync_timeout(), None);
        assert_eq!(config.connid.as_deref(), Some("worker-1"));
        // Untouched keys keep their defaults
        assert!(config.allow_exposed_attrs);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_json(r#"{"allow_everything": true}"#).unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn test_validation() {
        assert!(Config::from_json(r#"{"compression_level": 12}"#).is_err());
        assert!(Config::from_json(r#"{"sync_request_timeout": -1.0}"#).is_err());
    }

    #[test]
    fn test_blacklist_widening() {
        let config = Config::from_value(serde_json::json!({
            "deleted_netref_attrs": ["__array_struct__", "__array_interface__", "__dlpack__"]
        }))
        .unwrap();
        assert_eq!(config.deleted_netref_attrs.len(), 3);
    }
}
