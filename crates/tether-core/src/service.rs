//! Services: what an endpoint exposes to its peer.

use crate::connection::Connection;
use crate::error::Result;
use crate::object::{ObjectType, Servant};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// The local side of a connection.
///
/// A service hands each new connection a root object and is told when
/// connections come and go. One service value may back many connections.
pub trait Service: Send + Sync + 'static {
    /// Type-like name, e.g. `"EchoService"`.
    fn name(&self) -> String;

    /// Names the service answers to. Empty means the canonical name.
    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    /// The object the peer sees as `root`.
    fn root(&self, conn: &Connection) -> Arc<dyn Servant>;

    /// Called once the connection is ready. An error rejects the connection.
    fn on_connect(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Called once, after the connection is closed.
    fn on_disconnect(&self, _conn: &Connection) {}
}

/// Upper-cased name without a trailing `Service`.
pub fn canonical_name(name: &str) -> String {
    let upper = name.to_uppercase();
    match upper.strip_suffix("SERVICE") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => upper,
    }
}

/// The aliases a service advertises to peers.
pub fn service_aliases(service: &dyn Service) -> Vec<String> {
    let aliases = service.aliases();
    if aliases.is_empty() {
        vec![canonical_name(&service.name())]
    } else {
        aliases.iter().map(|alias| alias.to_uppercase()).collect()
    }
}

fn void_type() -> Arc<ObjectType> {
    static TYPE: OnceLock<Arc<ObjectType>> = OnceLock::new();
    TYPE.get_or_init(|| Arc::new(ObjectType::new("tether.service", "VoidService")))
        .clone()
}

struct VoidRoot;

impl Servant for VoidRoot {
    fn object_type(&self) -> Arc<ObjectType> {
        void_type()
    }
}

/// A service exposing nothing. Useful for the client end of a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoidService;

impl Service for VoidService {
    fn name(&self) -> String {
        "VoidService".to_string()
    }

    fn root(&self, _conn: &Connection) -> Arc<dyn Servant> {
        Arc::new(VoidRoot)
    }
}

type RootFactory = Arc<dyn Fn(&Connection) -> Arc<dyn Servant> + Send + Sync>;
type ConnectHook = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// A service assembled from closures, typically around an
/// [`Exposed`](crate::exposed::Exposed) root.
#[derive(Clone)]
pub struct ExposedService {
    name: String,
    aliases: Vec<String>,
    root: RootFactory,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
}

impl ExposedService {
    /// `root` builds the root object for each new connection.
    pub fn new(
        name: impl Into<String>,
        root: impl Fn(&Connection) -> Arc<dyn Servant> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            root: Arc::new(root),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// A service whose every connection shares the same root object.
    pub fn shared(name: impl Into<String>, root: Arc<dyn Servant>) -> Self {
        Self::new(name, move |_| root.clone())
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_on_connect(
        mut self,
        hook: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn with_on_disconnect(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }
}

impl Service for ExposedService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn aliases(&self) -> Vec<String> {
        self.aliases.clone()
    }

    fn root(&self, conn: &Connection) -> Arc<dyn Servant> {
        (self.root)(conn)
    }

    fn on_connect(&self, conn: &Connection) -> Result<()> {
        match &self.on_connect {
            Some(hook) => hook(conn),
            None => Ok(()),
        }
    }

    fn on_disconnect(&self, conn: &Connection) {
        if let Some(hook) = &self.on_disconnect {
            hook(conn);
        }
    }
}

impl fmt::Debug for ExposedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposedService")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .finish()
    }
}
