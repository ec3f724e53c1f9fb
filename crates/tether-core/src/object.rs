//! The object model shared by both endpoints.
//!
//! An [`Object`] is anything that can cross a connection: a brine [`Value`]
//! (copied), a tuple mixing values and references, a locally owned
//! [`Servant`] (shipped as a proxy) or a [`Netref`] to an object owned by a
//! peer.

use crate::error::{Result, TetherError};
use crate::netref::Netref;
use crate::value::Value;
use crate::vinegar::Exception;
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of an object owned by one endpoint.
///
/// `instance_id == 0` means the reference is to a class itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdPack {
    pub type_name: String,
    pub class_id: u64,
    pub instance_id: u64,
}

impl IdPack {
    pub fn new(type_name: impl Into<String>, class_id: u64, instance_id: u64) -> Self {
        Self {
            type_name: type_name.into(),
            class_id,
            instance_id,
        }
    }

    pub fn is_class(&self) -> bool {
        self.instance_id == 0
    }

    pub fn to_value(&self) -> Value {
        Value::tuple([
            Value::from(self.type_name.as_str()),
            Value::from(self.class_id),
            Value::from(self.instance_id),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let invalid = || TetherError::Protocol(format!("invalid id-pack: {}", value.repr()));
        let items = value.as_tuple().ok_or_else(invalid)?;
        let [name, class_id, instance_id] = items else {
            return Err(invalid());
        };
        let as_u64 = |v: &Value| v.as_int().and_then(num_traits::ToPrimitive::to_u64);
        Ok(Self {
            type_name: name.as_str().ok_or_else(invalid)?.to_string(),
            class_id: as_u64(class_id).ok_or_else(invalid)?,
            instance_id: as_u64(instance_id).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for IdPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:#x}:{:#x}",
            self.type_name, self.class_id, self.instance_id
        )
    }
}

/// Rich comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn dunder(self) -> &'static str {
        match self {
            CmpOp::Eq => "__eq__",
            CmpOp::Ne => "__ne__",
            CmpOp::Lt => "__lt__",
            CmpOp::Le => "__le__",
            CmpOp::Gt => "__gt__",
            CmpOp::Ge => "__ge__",
        }
    }

    pub fn from_dunder(name: &str) -> Option<Self> {
        Some(match name {
            "__eq__" => CmpOp::Eq,
            "__ne__" => CmpOp::Ne,
            "__lt__" => CmpOp::Lt,
            "__le__" => CmpOp::Le,
            "__gt__" => CmpOp::Gt,
            "__ge__" => CmpOp::Ge,
            _ => return None,
        })
    }
}

/// Type descriptor for servants.
///
/// The address of the shared `Arc<ObjectType>` is the class id reported to
/// peers, so a type must be created once and shared by all its instances.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    module: String,
    name: String,
    doc: Option<String>,
    bases: Vec<String>,
    methods: BTreeMap<String, Option<String>>,
}

impl ObjectType {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            doc: None,
            bases: Vec::new(),
            methods: BTreeMap::new(),
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Add a base type by qualified name, used by instance checks.
    pub fn with_base(mut self, qualified_name: impl Into<String>) -> Self {
        self.bases.push(qualified_name.into());
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, doc: Option<&str>) -> Self {
        self.methods.insert(name.into(), doc.map(str::to_string));
        self
    }

    pub fn with_methods<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        for name in names {
            self.methods.insert(name.to_string(), None);
        }
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn methods(&self) -> &BTreeMap<String, Option<String>> {
        &self.methods
    }

    /// True if `qualified` names this type or one of its bases.
    pub fn is_subtype_of(&self, qualified: &str) -> bool {
        qualified == "builtins.object"
            || self.qualified_name() == qualified
            || self.bases.iter().any(|b| b == qualified)
    }

    pub(crate) fn class_id(this: &Arc<ObjectType>) -> u64 {
        Arc::as_ptr(this) as usize as u64
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Object>,
    pub keywords: Vec<(String, Object)>,
}

impl Args {
    pub fn new(positional: Vec<Object>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Object>) -> Self {
        self.keywords.push((name.into(), value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    /// Positional argument `index`, or a TypeError naming the gap.
    pub fn get(&self, index: usize) -> Result<&Object> {
        self.positional.get(index).ok_or_else(|| {
            TetherError::type_error(format!(
                "missing required positional argument {} (got {})",
                index,
                self.positional.len()
            ))
        })
    }

    pub fn value(&self, index: usize) -> Result<&Value> {
        let obj = self.get(index)?;
        obj.as_value().ok_or_else(|| {
            TetherError::type_error(format!(
                "argument {} must be a plain value, not {}",
                index,
                obj.type_name()
            ))
        })
    }

    pub fn str(&self, index: usize) -> Result<&str> {
        let value = self.value(index)?;
        value.as_str().ok_or_else(|| {
            TetherError::type_error(format!(
                "argument {} must be str, not {}",
                index,
                value.type_name()
            ))
        })
    }

    pub fn i64(&self, index: usize) -> Result<i64> {
        let value = self.value(index)?;
        value.as_i64().ok_or_else(|| {
            TetherError::type_error(format!(
                "argument {} must be an int, not {}",
                index,
                value.type_name()
            ))
        })
    }

    pub fn f64(&self, index: usize) -> Result<f64> {
        let value = self.value(index)?;
        value.as_f64().ok_or_else(|| {
            TetherError::type_error(format!(
                "argument {} must be a number, not {}",
                index,
                value.type_name()
            ))
        })
    }

    pub fn keyword(&self, name: &str) -> Option<&Object> {
        self.keywords
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Prepend an argument, as when binding a method receiver.
    pub fn prepend(mut self, first: Object) -> Self {
        self.positional.insert(0, first);
        self
    }
}

impl From<Vec<Object>> for Args {
    fn from(positional: Vec<Object>) -> Self {
        Self::new(positional)
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

/// The local object protocol a peer may drive.
///
/// Every method has a default matching a plain object with no attributes, so
/// implementors only override what their object supports.
pub trait Servant: Send + Sync + 'static {
    fn object_type(&self) -> Arc<ObjectType>;

    fn get_attr(&self, name: &str) -> Result<Object> {
        Err(no_attribute(&*self.object_type(), name))
    }

    fn set_attr(&self, name: &str, _value: Object) -> Result<()> {
        Err(TetherError::attribute(format!(
            "'{}' object attribute '{}' is read-only",
            self.object_type().name(),
            name
        )))
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        Err(no_attribute(&*self.object_type(), name))
    }

    /// Whether `name` is a method invocable through [`Servant::call_method`].
    fn has_method(&self, name: &str) -> bool {
        self.object_type().has_method(name)
    }

    /// Names of data attributes, for `dir` and existence checks.
    fn attr_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn has_attr(&self, name: &str) -> bool {
        self.has_method(name) || self.attr_names().iter().any(|a| a == name)
    }

    fn dir(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .object_type()
            .method_names()
            .map(str::to_string)
            .chain(self.attr_names())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn call(&self, _args: Args) -> Result<Object> {
        Err(TetherError::type_error(format!(
            "'{}' object is not callable",
            self.object_type().name()
        )))
    }

    fn call_method(&self, name: &str, _args: Args) -> Result<Object> {
        Err(no_attribute(&*self.object_type(), name))
    }

    fn repr(&self) -> Result<String> {
        Ok(format!(
            "<{} object at {:#x}>",
            self.object_type().qualified_name(),
            (self as *const Self).cast::<()>() as usize
        ))
    }

    fn str(&self) -> Result<String> {
        self.repr()
    }

    fn hash(&self) -> Result<i64> {
        Ok((self as *const Self).cast::<()>() as usize as i64)
    }

    /// Rich comparison. The default only knows identity.
    fn compare(&self, op: CmpOp, other: &Object) -> Result<Object> {
        let same = match other {
            Object::Servant(o) => {
                Arc::as_ptr(o).cast::<()>() == (self as *const Self).cast::<()>()
            }
            _ => false,
        };
        Ok(match op {
            CmpOp::Eq => Object::from(same),
            CmpOp::Ne => Object::from(!same),
            _ => Object::Value(Value::NotImplemented),
        })
    }

    fn pickle(&self, _protocol: i64) -> Result<Vec<u8>> {
        Err(TetherError::type_error(format!(
            "cannot pickle '{}' object",
            self.object_type().name()
        )))
    }

    /// Context-manager exit. A truthy result suppresses the exception.
    fn ctx_exit(&self, exc: Option<&Exception>) -> Result<Object> {
        let triple = match exc {
            Some(exc) => vec![
                Object::from(exc.qualified_name()),
                Object::from(exc.message()),
                Object::none(),
            ],
            None => vec![Object::none(), Object::none(), Object::none()],
        };
        self.call_method("__exit__", Args::new(triple))
    }

    fn is_instance(&self, qualified_type: &str) -> bool {
        self.object_type().is_subtype_of(qualified_type)
    }

    /// True when this servant stands for a class rather than an instance.
    fn is_class(&self) -> bool {
        false
    }

    /// Custom attribute policy; `None` defers to the connection's access rules.
    fn rpc_getattr(&self, _name: &str) -> Option<Result<Object>> {
        None
    }

    fn rpc_setattr(&self, _name: &str, _value: &Object) -> Option<Result<()>> {
        None
    }

    fn rpc_delattr(&self, _name: &str) -> Option<Result<()>> {
        None
    }
}

fn no_attribute(ty: &ObjectType, name: &str) -> TetherError {
    TetherError::attribute(format!(
        "'{}' object has no attribute '{}'",
        ty.name(),
        name
    ))
}

/// Id-pack of a locally owned servant.
pub(crate) fn servant_id_pack(servant: &Arc<dyn Servant>) -> IdPack {
    let ty = servant.object_type();
    let instance_id = if servant.is_class() {
        0
    } else {
        Arc::as_ptr(servant).cast::<()>() as usize as u64
    };
    IdPack::new(ty.qualified_name(), ObjectType::class_id(&ty), instance_id)
}

/// Any value that can cross a connection.
#[derive(Clone)]
pub enum Object {
    Value(Value),
    /// A tuple holding at least one reference.
    Tuple(Vec<Object>),
    Servant(Arc<dyn Servant>),
    Netref(Netref),
}

impl Object {
    pub fn none() -> Self {
        Object::Value(Value::None)
    }

    pub fn servant(servant: impl Servant) -> Self {
        Object::Servant(Arc::new(servant))
    }

    /// Build a tuple, collapsing to a plain value when every item is one.
    pub fn tuple(items: Vec<Object>) -> Self {
        if items.iter().all(|item| matches!(item, Object::Value(_))) {
            Object::Value(Value::Tuple(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Object::Value(v) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ))
        } else {
            Object::Tuple(items)
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Object::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Object::Value(v) => Ok(v),
            other => Err(TetherError::type_error(format!(
                "expected a plain value, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_netref(&self) -> Option<&Netref> {
        match self {
            Object::Netref(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_netref(self) -> Result<Netref> {
        match self {
            Object::Netref(n) => Ok(n),
            other => Err(TetherError::type_error(format!(
                "expected a remote reference, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Object::Value(Value::None))
    }

    /// True when the whole object can be shipped by value.
    pub fn dumpable(&self) -> bool {
        match self {
            Object::Value(_) => true,
            Object::Tuple(items) => items.iter().all(Object::dumpable),
            Object::Servant(_) | Object::Netref(_) => false,
        }
    }

    /// Unified view of a reference as a servant, for dispatch.
    pub fn as_servant(&self) -> Option<Arc<dyn Servant>> {
        match self {
            Object::Servant(s) => Some(s.clone()),
            Object::Netref(n) => Some(Arc::new(n.clone())),
            _ => None,
        }
    }

    /// Identity under which this object is registered when shipped by
    /// reference. Values and tuples are never shipped by reference.
    pub(crate) fn id_pack(&self) -> Option<IdPack> {
        match self {
            Object::Servant(s) => Some(servant_id_pack(s)),
            Object::Netref(n) => Some(n.reexport_id_pack()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Object::Value(v) => v.type_name().to_string(),
            Object::Tuple(_) => "builtins.tuple".to_string(),
            Object::Servant(s) => s.object_type().qualified_name(),
            Object::Netref(n) => n.type_name().to_string(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Object::Value(v) => v.truthy(),
            Object::Tuple(items) => !items.is_empty(),
            Object::Servant(_) | Object::Netref(_) => true,
        }
    }

    /// Split a tuple into its items.
    pub fn into_items(self) -> Result<Vec<Object>> {
        match self {
            Object::Value(Value::Tuple(items)) => {
                Ok(items.into_iter().map(Object::Value).collect())
            }
            Object::Tuple(items) => Ok(items),
            other => Err(TetherError::type_error(format!(
                "expected a tuple, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn repr(&self) -> Result<String> {
        match self {
            Object::Value(v) => Ok(v.repr()),
            Object::Tuple(items) => {
                let parts = items
                    .iter()
                    .map(Object::repr)
                    .collect::<Result<Vec<_>>>()?;
                if parts.len() == 1 {
                    Ok(format!("({},)", parts[0]))
                } else {
                    Ok(format!("({})", parts.join(", ")))
                }
            }
            Object::Servant(s) => s.repr(),
            Object::Netref(n) => n.repr(),
        }
    }

    pub fn str(&self) -> Result<String> {
        match self {
            Object::Value(v) => Ok(v.to_string()),
            Object::Servant(s) => s.str(),
            Object::Netref(n) => n.str(),
            Object::Tuple(_) => self.repr(),
        }
    }

    pub fn call(&self, args: Args) -> Result<Object> {
        match self {
            Object::Servant(s) => s.call(args),
            Object::Netref(n) => n.call(args),
            other => Err(TetherError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    pub fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match self {
            Object::Servant(s) => s.call_method(name, args),
            Object::Netref(n) => n.call_method(name, args),
            other => Err(TetherError::attribute(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    /// Attribute lookup, binding methods to their receiver.
    pub fn getattr(&self, name: &str) -> Result<Object> {
        match self {
            Object::Servant(s) => lookup_attr(s, name),
            Object::Netref(n) => n.getattr(name),
            other => Err(TetherError::attribute(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    /// Drain an iterable into a vector.
    pub fn iterate(&self) -> Result<Vec<Object>> {
        match self {
            Object::Value(Value::Tuple(items)) => {
                Ok(items.iter().cloned().map(Object::Value).collect())
            }
            Object::Value(Value::FrozenSet(set)) => {
                Ok(set.items().iter().cloned().map(Object::Value).collect())
            }
            Object::Value(Value::Bytes(bytes)) => {
                Ok(bytes.iter().map(|b| Object::from(i64::from(*b))).collect())
            }
            Object::Value(Value::Str(s)) => {
                Ok(s.chars().map(|c| Object::from(c.to_string())).collect())
            }
            Object::Tuple(items) => Ok(items.clone()),
            Object::Netref(n) => n.iter()?.collect(),
            Object::Servant(_) => {
                let iterator = self.call_method("__iter__", Args::empty())?;
                let mut items = Vec::new();
                loop {
                    match iterator.call_method("__next__", Args::empty()) {
                        Ok(item) => items.push(item),
                        Err(e) if e.is_stop_iteration() => return Ok(items),
                        Err(e) => return Err(e),
                    }
                }
            }
            Object::Value(v) => Err(TetherError::type_error(format!(
                "'{}' object is not iterable",
                v.type_name()
            ))),
        }
    }
}

/// Attribute lookup on a servant: methods come back bound to the receiver.
pub fn lookup_attr(target: &Arc<dyn Servant>, name: &str) -> Result<Object> {
    if target.has_method(name) {
        return Ok(Object::servant(crate::builtins::BoundMethod::new(
            target.clone(),
            name,
        )));
    }
    target.get_attr(name)
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Value(v) => write!(f, "{:?}", v),
            Object::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Object::Servant(s) => write!(
                f,
                "Servant(<{} at {:#x}>)",
                s.object_type().qualified_name(),
                Arc::as_ptr(s).cast::<()>() as usize
            ),
            Object::Netref(n) => write!(f, "{:?}", n),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Value(a), Object::Value(b)) => a == b,
            (Object::Tuple(a), Object::Tuple(b)) => a == b,
            (Object::Servant(a), Object::Servant(b)) => {
                Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
            }
            (Object::Netref(a), Object::Netref(b)) => a.same_object(b),
            _ => false,
        }
    }
}

impl From<Value> for Object {
    fn from(v: Value) -> Self {
        Object::Value(v)
    }
}

impl From<Netref> for Object {
    fn from(n: Netref) -> Self {
        Object::Netref(n)
    }
}

impl From<Arc<dyn Servant>> for Object {
    fn from(s: Arc<dyn Servant>) -> Self {
        Object::Servant(s)
    }
}

impl<T: Servant> From<Arc<T>> for Object {
    fn from(s: Arc<T>) -> Self {
        Object::Servant(s)
    }
}

impl From<Vec<Object>> for Object {
    fn from(items: Vec<Object>) -> Self {
        Object::tuple(items)
    }
}

macro_rules! object_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Object {
                fn from(v: $ty) -> Self {
                    Object::Value(Value::from(v))
                }
            }
        )*
    };
}

object_from_value!(bool, i32, i64, u32, u64, usize, f64, BigInt, &str, String, Vec<u8>, &[u8], ());

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    fn plain_type() -> Arc<ObjectType> {
        static TYPE: std::sync::OnceLock<Arc<ObjectType>> = std::sync::OnceLock::new();
        TYPE.get_or_init(|| {
            Arc::new(
                ObjectType::new("tests", "Plain")
                    .with_base("tests.Base")
                    .with_method("ping", Some("Answer pong")),
            )
        })
        .clone()
    }

    impl Servant for Plain {
        fn object_type(&self) -> Arc<ObjectType> {
            plain_type()
        }

        fn call_method(&self, name: &str, _args: Args) -> Result<Object> {
            match name {
                "ping" => Ok(Object::from("pong")),
                _ => Err(TetherError::attribute(name.to_string())),
            }
        }
    }

    #[test]
    fn test_id_pack_value_roundtrip() {
        let pack = IdPack::new("builtins.list", u64::MAX, 42);
        assert_eq!(IdPack::from_value(&pack.to_value()).unwrap(), pack);
        assert!(IdPack::from_value(&Value::from("nope")).is_err());
        assert!(IdPack::new("x.Y", 1, 0).is_class());
    }

    #[test]
    fn test_servant_identity_in_id_pack() {
        let a: Arc<dyn Servant> = Arc::new(Plain);
        let b: Arc<dyn Servant> = Arc::new(Plain);
        let pa = servant_id_pack(&a);
        let pb = servant_id_pack(&b);
        assert_eq!(pa.type_name, "tests.Plain");
        assert_eq!(pa.class_id, pb.class_id);
        assert_ne!(pa.instance_id, pb.instance_id);
        assert_eq!(pa, servant_id_pack(&a.clone()));
    }

    #[test]
    fn test_tuple_collapses_to_value() {
        let t = Object::tuple(vec![Object::from(1), Object::from("a")]);
        assert!(matches!(t, Object::Value(Value::Tuple(_))));
        let mixed = Object::tuple(vec![Object::from(1), Object::servant(Plain)]);
        assert!(matches!(mixed, Object::Tuple(_)));
        assert!(!mixed.dumpable());
        assert_eq!(mixed.into_items().unwrap().len(), 2);
    }

    #[test]
    fn test_getattr_binds_methods() {
        let obj = Object::servant(Plain);
        let bound = obj.getattr("ping").unwrap();
        assert_eq!(bound.call(Args::empty()).unwrap(), Object::from("pong"));
        let err = obj.getattr("missing").unwrap_err();
        assert!(err.exception().unwrap().is_instance_of("AttributeError"));
    }

    #[test]
    fn test_default_protocol() {
        let s: Arc<dyn Servant> = Arc::new(Plain);
        assert!(s.is_instance("tests.Base"));
        assert!(s.is_instance("tests.Plain"));
        assert!(!s.is_instance("tests.Other"));
        assert_eq!(s.dir(), vec!["ping".to_string()]);
        assert!(s.repr().unwrap().starts_with("<tests.Plain object at"));
        let same = s.compare(CmpOp::Eq, &Object::Servant(s.clone())).unwrap();
        assert_eq!(same, Object::from(true));
        let lt = s.compare(CmpOp::Lt, &Object::from(1)).unwrap();
        assert_eq!(lt, Object::Value(Value::NotImplemented));
        assert!(s.call(Args::empty()).is_err());
    }

    #[test]
    fn test_args_accessors() {
        let args = Args::new(vec![Object::from("x"), Object::from(3)]).with_keyword("k", true);
        assert_eq!(args.str(0).unwrap(), "x");
        assert_eq!(args.i64(1).unwrap(), 3);
        assert!(args.str(1).is_err());
        assert!(args.get(2).is_err());
        assert_eq!(args.keyword("k"), Some(&Object::from(true)));
    }

    #[test]
    fn test_iterate_values() {
        let t = Object::from(Value::tuple([Value::from(1), Value::from(2)]));
        assert_eq!(t.iterate().unwrap().len(), 2);
        assert!(Object::from(1).iterate().is_err());
    }
}
