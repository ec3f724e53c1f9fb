//! Tether - transparent, symmetric remote objects over framed byte streams.
//!
//! Two endpoints joined by a [`Connection`] expose objects to each other.
//! Values cross by copy; everything else crosses by reference and shows up
//! on the other side as a [`Netref`], a proxy whose every operation is a
//! round trip to the owner. Either side may call the other at any time,
//! including from inside a call it is currently serving.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether::{connect_pair, Args, BgServingThread, Config, Exposed, ExposedService, Object, VoidService};
//!
//! let service = ExposedService::new("EchoService", |_conn| {
//!     Exposed::builder("demo", "Echo")
//!         .exposed("echo", |args| Ok(args.get(0)?.clone()))
//!         .build_arc()
//! });
//! let (client, server) = connect_pair(
//!     Arc::new(VoidService),
//!     Config::default(),
//!     Arc::new(service),
//!     Config::default(),
//! )?;
//! let _bg = BgServingThread::start(server)?;
//!
//! let root = client.root()?;
//! let reply = root.call_method("echo", Args::new(vec![Object::from("hello")]))?;
//! assert_eq!(reply.as_str(), Some("hello"));
//! ```

pub mod async_result;
pub mod brine;
pub mod builtins;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod exposed;
pub mod factory;
pub mod helpers;
pub mod netref;
pub mod object;
pub mod protocol;
pub mod service;
pub mod stream;
pub mod value;
pub mod vinegar;

mod locks;

// Re-export commonly used types
pub use async_result::AsyncResult;
pub use builtins::{ClassObject, FunctionObject, IteratorObject, ListObject};
pub use channel::Channel;
pub use config::{BeforeClosedHook, Config, ConnectionConfig, Endpoints};
pub use connection::{Connection, ConnectionStats, WeakConnection};
pub use error::{Result, TetherError};
pub use exposed::{Exposed, ExposedBuilder};
pub use factory::{connect_channel, connect_stream, connect_tcp, connect_tcp_timeout};
#[cfg(unix)]
pub use factory::{connect_child, connect_pair, connect_pipes, connect_unix};
pub use helpers::{async_wrap, buffiter, inspect_methods, obtain, timed, BgServingThread};
pub use netref::{Netref, RemoteIter};
pub use object::{Args, CmpOp, IdPack, Object, ObjectType, Servant};
pub use protocol::Handler;
pub use service::{ExposedService, Service, VoidService};
#[cfg(unix)]
pub use stream::PipeStream;
pub use stream::{SocketStream, Stream};
pub use value::Value;
pub use vinegar::{Exception, ExceptionClass, ExceptionRegistry};
