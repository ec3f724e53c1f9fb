//! The closed domain of immutable values that cross the wire by value.
//!
//! Everything outside this domain is shipped by reference (see
//! [`crate::object::Object`]).

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use std::fmt;

/// An immutable, brine-encodable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    FrozenSet(FrozenSet),
    Slice(Box<Slice>),
    NotImplemented,
    Ellipsis,
}

/// A `start:stop:step` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// An unordered set of values.
///
/// Items are kept deduplicated and sorted by their brine encoding so that two
/// equal sets always encode to the same bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrozenSet {
    items: Vec<Value>,
}

impl FrozenSet {
    /// Items that fail to encode keep their insertion order after the
    /// encodable ones and are deduplicated by equality.
    pub fn new(items: impl IntoIterator<Item = Value>) -> Self {
        let mut keyed: Vec<(Vec<u8>, Value)> = Vec::new();
        let mut unkeyed: Vec<Value> = Vec::new();
        for item in items {
            match crate::brine::dump(&item) {
                Ok(key) => keyed.push((key, item)),
                Err(_) => {
                    if !unkeyed.contains(&item) {
                        unkeyed.push(item);
                    }
                }
            }
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        let mut items: Vec<Value> = keyed.into_iter().map(|(_, item)| item).collect();
        items.extend(unkeyed);
        Self { items }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.items.iter().any(|item| item == value)
    }
}

impl Value {
    pub fn int(value: impl Into<BigInt>) -> Self {
        Value::Int(value.into())
    }

    pub fn str(value: impl Into<String>) -> Self {
        Value::Str(value.into())
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(value.into())
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn slice(start: Value, stop: Value, step: Value) -> Self {
        Value::Slice(Box::new(Slice { start, stop, step }))
    }

    /// Qualified name of the value's type, as reported to the peer.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "builtins.NoneType",
            Value::Bool(_) => "builtins.bool",
            Value::Int(_) => "builtins.int",
            Value::Float(_) => "builtins.float",
            Value::Complex(..) => "builtins.complex",
            Value::Str(_) => "builtins.str",
            Value::Bytes(_) => "builtins.bytes",
            Value::Tuple(_) => "builtins.tuple",
            Value::FrozenSet(_) => "builtins.frozenset",
            Value::Slice(_) => "builtins.slice",
            Value::NotImplemented => "builtins.NotImplementedType",
            Value::Ellipsis => "builtins.ellipsis",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Integer value if it fits in an `i64`. Booleans count as integers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => i.to_i64(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => i.to_f64(),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Truth value using the usual container/number conventions.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None | Value::NotImplemented => false,
            Value::Ellipsis | Value::Slice(_) => true,
            Value::Bool(b) => *b,
            Value::Int(i) => !i.is_zero(),
            Value::Float(f) => *f != 0.0,
            Value::Complex(re, im) => *re != 0.0 || *im != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::FrozenSet(set) => !set.is_empty(),
        }
    }

    /// Source-like representation, e.g. `'abc'` or `(1, 2)`.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Complex(re, im) => {
                let sign = if im.is_sign_negative() { '-' } else { '+' };
                write!(f, "({}{}{}j)", format_float(*re), sign, format_float(im.abs()))
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => {
                write!(f, "b'")?;
                for byte in b {
                    match *byte {
                        b'\\' => write!(f, "\\\\")?,
                        b'\'' => write!(f, "\\'")?,
                        0x20..=0x7e => write!(f, "{}", *byte as char)?,
                        _ => write!(f, "\\x{:02x}", byte)?,
                    }
                }
                write!(f, "'")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::FrozenSet(set) => {
                write!(f, "frozenset({{")?;
                for (i, item) in set.items().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "}})")
            }
            Value::Slice(s) => write!(
                f,
                "slice({}, {}, {})",
                s.start.repr(),
                s.stop.repr(),
                s.step.repr()
            ),
            Value::NotImplemented => write!(f, "NotImplemented"),
            Value::Ellipsis => write!(f, "Ellipsis"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i.into())
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i.into())
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i.into())
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i.into())
    }
}

impl From<BigInt> for Value {
    fn from(i: BigInt) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::None, Into::into)
    }
}
