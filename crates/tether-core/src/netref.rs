//! Transparent references to objects owned by a peer.
//!
//! A [`Netref`] carries the owning connection, the remote object's id-pack, a
//! local reference count and the method table of its remote class. Every
//! operation except the few local attributes is forwarded as a request.
//! Dropping the last clone sends a single `DEL` with the accumulated count.

use crate::builtins::builtin_types;
use crate::connection::Connection;
use crate::error::{Result, TetherError};
use crate::object::{Args, CmpOp, IdPack, Object, ObjectType, Servant};
use crate::protocol::Handler;
use crate::value::Value;
use crate::vinegar::{self, Exception};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::trace;

/// Attributes a netref answers without asking the peer.
pub const LOCAL_ATTRS: &[&str] = &["____id_pack__", "____refcount__", "____conn__"];

/// Method table of a remote class.
#[derive(Debug)]
pub struct NetrefClass {
    type_name: String,
    object_type: Arc<ObjectType>,
}

impl NetrefClass {
    pub(crate) fn new(type_name: &str, methods: &BTreeMap<String, Option<String>>) -> Self {
        let (module, name) = type_name.rsplit_once('.').unwrap_or(("builtins", type_name));
        let object_type = methods
            .iter()
            .fold(ObjectType::new(module, name), |ty, (method, doc)| {
                ty.with_method(method.as_str(), doc.as_deref())
            });
        Self {
            type_name: type_name.to_string(),
            object_type: Arc::new(object_type),
        }
    }

    /// Class for a type every endpoint knows, shared across connections.
    pub(crate) fn builtin(type_name: &str) -> Option<Arc<NetrefClass>> {
        static CLASSES: OnceLock<HashMap<String, Arc<NetrefClass>>> = OnceLock::new();
        CLASSES
            .get_or_init(|| {
                builtin_types()
                    .into_iter()
                    .map(|ty| {
                        let qualified = ty.qualified_name();
                        let class = NetrefClass::new(&qualified, ty.methods());
                        (qualified, Arc::new(class))
                    })
                    .collect()
            })
            .get(type_name)
            .cloned()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.object_type
    }

    pub fn methods(&self) -> &BTreeMap<String, Option<String>> {
        self.object_type.methods()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.object_type.has_method(name)
    }
}

pub(crate) struct NetrefInner {
    conn: Connection,
    id_pack: IdPack,
    refcount: AtomicU64,
    class: Arc<NetrefClass>,
}

impl Drop for NetrefInner {
    fn drop(&mut self) {
        self.conn.forget_proxy(&self.id_pack);
        if self.conn.closed() {
            return;
        }
        let count = *self.refcount.get_mut();
        let args = vec![Object::from(self.id_pack.to_value()), Object::from(count)];
        if let Err(e) = self.conn.send_oneway(Handler::Del, args) {
            trace!(
                connid = %self.conn.connid(),
                id_pack = %self.id_pack,
                error = %e,
                "Failed to release remote reference"
            );
        }
    }
}

/// A reference to an object owned by the peer.
///
/// Clones share one reference count; two netrefs received for the same remote
/// object over the same connection are the same netref.
#[derive(Clone)]
pub struct Netref {
    inner: Arc<NetrefInner>,
}

impl Netref {
    pub(crate) fn new(conn: Connection, id_pack: IdPack, class: Arc<NetrefClass>) -> Self {
        Self {
            inner: Arc::new(NetrefInner {
                conn,
                id_pack,
                refcount: AtomicU64::new(1),
                class,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<NetrefInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<NetrefInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn inc_refcount(&self) {
        self.inner.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn id_pack(&self) -> &IdPack {
        &self.inner.id_pack
    }

    /// How many times the peer has sent this object to us.
    pub fn refcount(&self) -> u64 {
        self.inner.refcount.load(Ordering::Acquire)
    }

    pub fn type_name(&self) -> &str {
        &self.inner.id_pack.type_name
    }

    pub fn class(&self) -> &Arc<NetrefClass> {
        &self.inner.class
    }

    /// True when the remote object is a class rather than an instance.
    pub fn is_class(&self) -> bool {
        self.inner.id_pack.is_class()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.class.has_method(name)
    }

    pub fn belongs_to(&self, conn: &Connection) -> bool {
        self.inner.conn.ptr_eq(conn)
    }

    /// Same remote object over the same connection.
    pub fn same_object(&self, other: &Netref) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.conn.ptr_eq(&other.inner.conn)
                && self.inner.id_pack == other.inner.id_pack)
    }

    /// Identity under which this netref is registered when forwarded to a
    /// third party over another connection.
    pub(crate) fn reexport_id_pack(&self) -> IdPack {
        IdPack::new(
            self.inner.id_pack.type_name.clone(),
            self.inner.id_pack.class_id,
            if self.is_class() {
                0
            } else {
                Arc::as_ptr(&self.inner) as usize as u64
            },
        )
    }

    fn request(&self, handler: Handler, mut args: Vec<Object>) -> Result<Object> {
        args.insert(0, Object::Netref(self.clone()));
        self.inner.conn.sync_request(handler, args)
    }

    fn local_attr(&self, name: &str) -> Option<Object> {
        match name {
            "____id_pack__" => Some(Object::from(self.inner.id_pack.to_value())),
            "____refcount__" => Some(Object::from(self.refcount())),
            "____conn__" => Some(Object::from(self.inner.conn.connid())),
            _ => None,
        }
    }

    fn deleted(&self, name: &str) -> bool {
        self.inner.conn.config().deleted_netref_attrs.contains(name)
    }

    pub fn getattr(&self, name: &str) -> Result<Object> {
        if let Some(local) = self.local_attr(name) {
            return Ok(local);
        }
        if self.deleted(name) {
            return Err(TetherError::attribute(format!(
                "'{}' netref has no attribute '{}'",
                self.type_name(),
                name
            )));
        }
        self.request(Handler::GetAttr, vec![Object::from(name)])
    }

    pub fn setattr(&self, name: &str, value: impl Into<Object>) -> Result<()> {
        if LOCAL_ATTRS.contains(&name) {
            return Err(TetherError::attribute(format!(
                "cannot set local attribute '{}'",
                name
            )));
        }
        self.request(Handler::SetAttr, vec![Object::from(name), value.into()])
            .map(drop)
    }

    pub fn delattr(&self, name: &str) -> Result<()> {
        if LOCAL_ATTRS.contains(&name) {
            return Err(TetherError::attribute(format!(
                "cannot delete local attribute '{}'",
                name
            )));
        }
        self.request(Handler::DelAttr, vec![Object::from(name)])
            .map(drop)
    }

    pub(crate) fn split_args(args: Args) -> (Object, Object) {
        let keywords = args
            .keywords
            .into_iter()
            .map(|(k, v)| Object::tuple(vec![Object::from(k), v]))
            .collect();
        (Object::tuple(args.positional), Object::tuple(keywords))
    }

    /// Call the remote object itself.
    pub fn call(&self, args: impl Into<Args>) -> Result<Object> {
        let (positional, keywords) = Self::split_args(args.into());
        self.request(Handler::Call, vec![positional, keywords])
    }

    /// Look up and call a remote method in one round trip.
    pub fn call_method(&self, name: &str, args: impl Into<Args>) -> Result<Object> {
        let (positional, keywords) = Self::split_args(args.into());
        self.request(
            Handler::CallAttr,
            vec![Object::from(name), positional, keywords],
        )
    }

    /// [`Netref::call_method`] with positional arguments only.
    pub fn invoke<I>(&self, name: &str, args: I) -> Result<Object>
    where
        I: IntoIterator,
        I::Item: Into<Object>,
    {
        let positional: Vec<Object> = args.into_iter().map(Into::into).collect();
        self.call_method(name, Args::new(positional))
    }

    pub fn repr(&self) -> Result<String> {
        self.string_request(Handler::Repr)
    }

    pub fn str(&self) -> Result<String> {
        self.string_request(Handler::Str)
    }

    fn string_request(&self, handler: Handler) -> Result<String> {
        let out = self.request(handler, Vec::new())?;
        out.as_str().map(str::to_string).ok_or_else(|| {
            TetherError::type_error(format!(
                "{} returned non-string ({})",
                handler,
                out.type_name()
            ))
        })
    }

    pub fn hash(&self) -> Result<i64> {
        let out = self.request(Handler::Hash, Vec::new())?;
        out.as_i64()
            .ok_or_else(|| TetherError::type_error("__hash__ should return an integer"))
    }

    /// Rich comparison evaluated by the owner.
    pub fn compare(&self, op: CmpOp, other: impl Into<Object>) -> Result<Object> {
        self.request(
            Handler::Cmp,
            vec![other.into(), Object::from(op.dunder())],
        )
    }

    fn ordering(&self, op: CmpOp, other: Object) -> Result<bool> {
        let out = self.compare(op, other)?;
        if matches!(out, Object::Value(Value::NotImplemented)) {
            return Err(TetherError::type_error(format!(
                "'{}' not supported for instances of '{}'",
                op.dunder(),
                self.type_name()
            )));
        }
        Ok(out.truthy())
    }

    /// Equality as the owner defines it, falling back to identity.
    pub fn eq(&self, other: impl Into<Object>) -> Result<bool> {
        let other = other.into();
        match self.compare(CmpOp::Eq, other.clone())? {
            Object::Value(Value::NotImplemented) => Ok(match &other {
                Object::Netref(n) => self.same_object(n),
                _ => false,
            }),
            out => Ok(out.truthy()),
        }
    }

    pub fn lt(&self, other: impl Into<Object>) -> Result<bool> {
        self.ordering(CmpOp::Lt, other.into())
    }

    pub fn le(&self, other: impl Into<Object>) -> Result<bool> {
        self.ordering(CmpOp::Le, other.into())
    }

    pub fn gt(&self, other: impl Into<Object>) -> Result<bool> {
        self.ordering(CmpOp::Gt, other.into())
    }

    pub fn ge(&self, other: impl Into<Object>) -> Result<bool> {
        self.ordering(CmpOp::Ge, other.into())
    }

    pub fn dir(&self) -> Result<Vec<String>> {
        self.request(Handler::Dir, Vec::new())?
            .into_items()?
            .into_iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TetherError::type_error("DIR returned a non-string name"))
            })
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        let out = self.call_method("__len__", ())?;
        out.as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| TetherError::type_error("__len__ should return a non-negative integer"))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get_item(&self, key: impl Into<Object>) -> Result<Object> {
        self.call_method("__getitem__", Args::new(vec![key.into()]))
    }

    pub fn set_item(&self, key: impl Into<Object>, value: impl Into<Object>) -> Result<()> {
        self.call_method("__setitem__", Args::new(vec![key.into(), value.into()]))
            .map(drop)
    }

    pub fn del_item(&self, key: impl Into<Object>) -> Result<()> {
        self.call_method("__delitem__", Args::new(vec![key.into()]))
            .map(drop)
    }

    pub fn contains(&self, item: impl Into<Object>) -> Result<bool> {
        Ok(self
            .call_method("__contains__", Args::new(vec![item.into()]))?
            .truthy())
    }

    fn slicing(
        &self,
        attempt: &str,
        fallback: &str,
        start: Option<i64>,
        stop: Option<i64>,
        extra: Vec<Object>,
    ) -> Result<Object> {
        self.request(
            Handler::OldSlicing,
            vec![
                Object::from(attempt),
                Object::from(fallback),
                Object::from(start.map_or(Value::None, Value::from)),
                Object::from(stop.map_or(Value::None, Value::from)),
                Object::tuple(extra),
            ],
        )
    }

    /// `obj[start:stop]`.
    pub fn get_slice(&self, start: Option<i64>, stop: Option<i64>) -> Result<Object> {
        self.slicing("__getitem__", "__getslice__", start, stop, Vec::new())
    }

    pub fn set_slice(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        value: impl Into<Object>,
    ) -> Result<()> {
        self.slicing(
            "__setitem__",
            "__setslice__",
            start,
            stop,
            vec![value.into()],
        )
        .map(drop)
    }

    pub fn del_slice(&self, start: Option<i64>, stop: Option<i64>) -> Result<()> {
        self.slicing("__delitem__", "__delslice__", start, stop, Vec::new())
            .map(drop)
    }

    /// Iterate the remote object, pulling items in batches.
    pub fn iter(&self) -> Result<RemoteIter> {
        self.iter_chunked(crate::config::ConnectionConfig::BUFFITER_CHUNK)
    }

    pub fn iter_chunked(&self, chunk: usize) -> Result<RemoteIter> {
        let iterator = self.call_method("__iter__", ())?.into_netref()?;
        Ok(RemoteIter::new(iterator, chunk))
    }

    /// Advance a remote iterator; `None` once exhausted.
    pub fn next(&self) -> Result<Option<Object>> {
        match self.call_method("__next__", ()) {
            Ok(item) => Ok(Some(item)),
            Err(e) if e.is_stop_iteration() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Leave a remote context manager. Returns whether the exception was
    /// suppressed.
    pub fn ctx_exit(&self, exc: Option<&Exception>) -> Result<bool> {
        let exc = match exc {
            Some(exc) => Object::from(vinegar::dump(exc, self.inner.conn.config())),
            None => Object::none(),
        };
        Ok(self.request(Handler::CtxExit, vec![exc])?.truthy())
    }

    /// Ask the owner to serialize the object.
    pub fn pickle(&self, protocol: i64) -> Result<Vec<u8>> {
        let out = self.request(Handler::Pickle, vec![Object::from(protocol)])?;
        out.as_value()
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TetherError::type_error("PICKLE returned non-bytes"))
    }

    /// Ask the owner whether the object is an instance of `type_name`.
    pub fn instance_check(&self, type_name: &str) -> Result<bool> {
        Ok(self
            .request(Handler::InstanceCheck, vec![Object::from(type_name)])?
            .truthy())
    }

    /// `isinstance(self, class)` where `class` is a remote class.
    pub fn is_instance_of(&self, class: &Netref) -> Result<bool> {
        if self.inner.id_pack.class_id == class.inner.id_pack.class_id
            && self.inner.conn.ptr_eq(&class.inner.conn)
        {
            return Ok(true);
        }
        self.instance_check(class.type_name())
    }

    fn binary(&self, dunder: &str, symbol: &str, rhs: Object) -> Result<Object> {
        if !self.has_method(dunder) {
            return Err(TetherError::type_error(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                symbol,
                self.type_name(),
                rhs.type_name()
            )));
        }
        self.call_method(dunder, Args::new(vec![rhs]))
    }
}

macro_rules! netref_binary_op {
    ($($trait:ident :: $method:ident => $dunder:literal, $symbol:literal;)*) => {
        $(
            impl<T: Into<Object>> std::ops::$trait<T> for &Netref {
                type Output = Result<Object>;

                fn $method(self, rhs: T) -> Result<Object> {
                    self.binary($dunder, $symbol, rhs.into())
                }
            }
        )*
    };
}

netref_binary_op! {
    Add::add => "__add__", "+";
    Sub::sub => "__sub__", "-";
    Mul::mul => "__mul__", "*";
    Div::div => "__truediv__", "/";
    Rem::rem => "__mod__", "%";
}

impl std::ops::Neg for &Netref {
    type Output = Result<Object>;

    fn neg(self) -> Result<Object> {
        if !self.has_method("__neg__") {
            return Err(TetherError::type_error(format!(
                "bad operand type for unary -: '{}'",
                self.type_name()
            )));
        }
        self.call_method("__neg__", ())
    }
}

impl fmt::Debug for Netref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netref")
            .field("id_pack", &self.inner.id_pack)
            .field("refcount", &self.refcount())
            .field("connid", &self.inner.conn.connid())
            .finish()
    }
}

/// A netref forwarded to a third party is served like a local object.
impl Servant for Netref {
    fn object_type(&self) -> Arc<ObjectType> {
        self.inner.class.object_type.clone()
    }

    fn get_attr(&self, name: &str) -> Result<Object> {
        self.getattr(name)
    }

    fn set_attr(&self, name: &str, value: Object) -> Result<()> {
        self.setattr(name, value)
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        self.delattr(name)
    }

    fn has_method(&self, name: &str) -> bool {
        Netref::has_method(self, name)
    }

    fn has_attr(&self, name: &str) -> bool {
        Netref::has_method(self, name) || self.getattr(name).is_ok()
    }

    fn dir(&self) -> Vec<String> {
        Netref::dir(self).unwrap_or_default()
    }

    fn call(&self, args: Args) -> Result<Object> {
        Netref::call(self, args)
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        Netref::call_method(self, name, args)
    }

    fn repr(&self) -> Result<String> {
        Netref::repr(self)
    }

    fn str(&self) -> Result<String> {
        Netref::str(self)
    }

    fn hash(&self) -> Result<i64> {
        Netref::hash(self)
    }

    fn compare(&self, op: CmpOp, other: &Object) -> Result<Object> {
        Netref::compare(self, op, other.clone())
    }

    fn pickle(&self, protocol: i64) -> Result<Vec<u8>> {
        Netref::pickle(self, protocol)
    }

    fn ctx_exit(&self, exc: Option<&Exception>) -> Result<Object> {
        Netref::ctx_exit(self, exc).map(Object::from)
    }

    fn is_instance(&self, qualified_type: &str) -> bool {
        self.instance_check(qualified_type).unwrap_or(false)
    }

    fn is_class(&self) -> bool {
        Netref::is_class(self)
    }
}

/// Iterator over a remote iterable, fetching `chunk` items per round trip.
pub struct RemoteIter {
    iterator: Netref,
    chunk: usize,
    buffer: VecDeque<Object>,
    exhausted: bool,
}

impl RemoteIter {
    pub(crate) fn new(iterator: Netref, chunk: usize) -> Self {
        Self {
            iterator,
            chunk: chunk.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The remote iterator object.
    pub fn netref(&self) -> &Netref {
        &self.iterator
    }

    fn fill(&mut self) -> Result<()> {
        let batch = self
            .iterator
            .request(Handler::BuffIter, vec![Object::from(self.chunk)])?
            .into_items()?;
        if batch.len() < self.chunk {
            self.exhausted = true;
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for RemoteIter {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Result<Object>> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl fmt::Debug for RemoteIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteIter")
            .field("iterator", &self.iterator)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
