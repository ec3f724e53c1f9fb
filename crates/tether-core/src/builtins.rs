//! Built-in servants.
//!
//! These cover the shapes every application needs (mutable lists, iterators,
//! bound methods, plain functions and classes). Their netref classes are
//! known in advance, so receiving one never costs an INSPECT round trip.

use crate::error::{Result, TetherError};
use crate::locks::{lock, read, write};
use crate::object::{Args, CmpOp, Object, ObjectType, Servant};
use crate::value::{Slice, Value};
use num_traits::{Signed, ToPrimitive};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

/// Shared callable used by functions, methods and class constructors.
pub type MethodFn = Arc<dyn Fn(Args) -> Result<Object> + Send + Sync>;

/// Wrap a closure as a [`MethodFn`].
pub fn method_fn(f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static) -> MethodFn {
    Arc::new(f)
}

macro_rules! builtin_type {
    ($fn_name:ident, $name:literal, [$($method:literal),* $(,)?]) => {
        pub(crate) fn $fn_name() -> Arc<ObjectType> {
            static TYPE: OnceLock<Arc<ObjectType>> = OnceLock::new();
            TYPE.get_or_init(|| {
                Arc::new(ObjectType::new("builtins", $name).with_methods([$($method),*]))
            })
            .clone()
        }
    };
}

builtin_type!(
    list_type,
    "list",
    [
        "append", "extend", "pop", "insert", "index", "count", "clear", "remove", "reverse",
        "__len__", "__getitem__", "__setitem__", "__delitem__", "__contains__", "__iter__",
    ]
);
builtin_type!(list_iterator_type, "list_iterator", ["__next__", "__iter__", "__length_hint__"]);
builtin_type!(method_type, "method", ["__call__"]);
builtin_type!(function_type, "function", ["__call__"]);
builtin_type!(type_type, "type", ["__call__"]);

/// Every built-in type whose netref class can be built without INSPECT.
pub(crate) fn builtin_types() -> Vec<Arc<ObjectType>> {
    vec![
        list_type(),
        list_iterator_type(),
        method_type(),
        function_type(),
        type_type(),
    ]
}

fn index_error(what: &str) -> TetherError {
    crate::vinegar::Exception::index_error(format!("{} index out of range", what)).into()
}

/// Clamp an integer-ish value to i64; `None` stands for an omitted bound.
fn bound(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::None => Ok(None),
        Value::Bool(b) => Ok(Some(i64::from(*b))),
        Value::Int(i) => Ok(Some(i.to_i64().unwrap_or(if i.is_negative() {
            i64::MIN
        } else {
            i64::MAX
        }))),
        other => Err(TetherError::type_error(format!(
            "slice indices must be integers or None, not {}",
            other.type_name()
        ))),
    }
}

/// Positions selected by `slice` over a sequence of `len` items.
pub(crate) fn slice_indices(slice: &Slice, len: usize) -> Result<Vec<usize>> {
    let len = len as i64;
    let step = bound(&slice.step)?.unwrap_or(1);
    if step == 0 {
        return Err(TetherError::value_error("slice step cannot be zero"));
    }
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { v.saturating_add(len) } else { v };
        if step > 0 {
            v.clamp(0, len)
        } else {
            v.clamp(-1, len - 1)
        }
    };
    let start = bound(&slice.start)?
        .map(clamp)
        .unwrap_or(if step > 0 { 0 } else { len - 1 });
    let stop = bound(&slice.stop)?
        .map(clamp)
        .unwrap_or(if step > 0 { len } else { -1 });

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(indices)
}

fn sequence_index(index: &Value, len: usize) -> Result<usize> {
    let i = index.as_i64().ok_or_else(|| {
        TetherError::type_error(format!(
            "list indices must be integers or slices, not {}",
            index.type_name()
        ))
    })?;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(index_error("list"));
    }
    Ok(resolved as usize)
}

/// A mutable list shared with peers by reference.
#[derive(Default)]
pub struct ListObject {
    items: RwLock<Vec<Object>>,
}

impl ListObject {
    pub fn new(items: Vec<Object>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::new(values.into_iter().map(Object::Value).collect())
    }

    pub fn snapshot(&self) -> Vec<Object> {
        read(&self.items).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.items).is_empty()
    }

    fn get_item(&self, key: &Object) -> Result<Object> {
        let items = read(&self.items);
        match key.as_value() {
            Some(Value::Slice(slice)) => {
                let picked = slice_indices(slice, items.len())?
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                Ok(Object::servant(ListObject::new(picked)))
            }
            Some(index) => Ok(items[sequence_index(index, items.len())?].clone()),
            None => Err(TetherError::type_error("list indices must be integers or slices")),
        }
    }

    fn set_item(&self, key: &Object, value: Object) -> Result<()> {
        match key.as_value() {
            Some(Value::Slice(slice)) => {
                // Materialize the replacement before taking the write lock; it
                // may be a remote iterable.
                let replacement = value.iterate()?;
                let mut items = write(&self.items);
                let step = bound(&slice.step)?.unwrap_or(1);
                let indices = slice_indices(slice, items.len())?;
                if step == 1 {
                    let start = match indices.first() {
                        Some(first) => *first,
                        None => bound(&slice.start)?
                            .map(|s| if s < 0 { (s + items.len() as i64).max(0) } else { s })
                            .unwrap_or(0)
                            .min(items.len() as i64) as usize,
                    };
                    let end = start + indices.len();
                    items.splice(start..end, replacement);
                } else {
                    if indices.len() != replacement.len() {
                        return Err(TetherError::value_error(format!(
                            "attempt to assign sequence of size {} to extended slice of size {}",
                            replacement.len(),
                            indices.len()
                        )));
                    }
                    for (i, item) in indices.into_iter().zip(replacement) {
                        items[i] = item;
                    }
                }
                Ok(())
            }
            Some(index) => {
                let mut items = write(&self.items);
                let i = sequence_index(index, items.len())?;
                items[i] = value;
                Ok(())
            }
            None => Err(TetherError::type_error("list indices must be integers or slices")),
        }
    }

    fn del_item(&self, key: &Object) -> Result<()> {
        let removed: Vec<Object> = {
            let mut items = write(&self.items);
            match key.as_value() {
                Some(Value::Slice(slice)) => {
                    let mut indices = slice_indices(slice, items.len())?;
                    indices.sort_unstable_by(|a, b| b.cmp(a));
                    indices.into_iter().map(|i| items.remove(i)).collect()
                }
                Some(index) => {
                    let i = sequence_index(index, items.len())?;
                    vec![items.remove(i)]
                }
                None => {
                    return Err(TetherError::type_error(
                        "list indices must be integers or slices",
                    ))
                }
            }
        };
        // Released references may be netrefs whose finalizers talk to a peer
        drop(removed);
        Ok(())
    }

    fn position(&self, needle: &Object) -> Option<usize> {
        read(&self.items).iter().position(|item| item == needle)
    }
}

impl Servant for ListObject {
    fn object_type(&self) -> Arc<ObjectType> {
        list_type()
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match name {
            "append" => {
                let item = args.get(0)?.clone();
                write(&self.items).push(item);
                Ok(Object::none())
            }
            "extend" => {
                let extra = args.get(0)?.iterate()?;
                write(&self.items).extend(extra);
                Ok(Object::none())
            }
            "insert" => {
                let at = args.i64(0)?;
                let item = args.get(1)?.clone();
                let mut items = write(&self.items);
                let len = items.len() as i64;
                let at = if at < 0 { (at + len).max(0) } else { at.min(len) };
                items.insert(at as usize, item);
                Ok(Object::none())
            }
            "pop" => {
                let mut items = write(&self.items);
                if items.is_empty() {
                    return Err(crate::vinegar::Exception::index_error("pop from empty list").into());
                }
                let at = match args.positional.first() {
                    Some(_) => sequence_index(args.value(0)?, items.len())?,
                    None => items.len() - 1,
                };
                Ok(items.remove(at))
            }
            "index" => self
                .position(args.get(0)?)
                .map(Object::from)
                .ok_or_else(|| TetherError::value_error("item is not in list")),
            "count" => {
                let needle = args.get(0)?;
                Ok(Object::from(
                    read(&self.items).iter().filter(|item| *item == needle).count(),
                ))
            }
            "remove" => {
                let at = self
                    .position(args.get(0)?)
                    .ok_or_else(|| TetherError::value_error("list.remove(x): x not in list"))?;
                let removed = write(&self.items).remove(at);
                drop(removed);
                Ok(Object::none())
            }
            "reverse" => {
                write(&self.items).reverse();
                Ok(Object::none())
            }
            "clear" => {
                let removed = std::mem::take(&mut *write(&self.items));
                drop(removed);
                Ok(Object::none())
            }
            "__len__" => Ok(Object::from(self.len())),
            "__getitem__" => self.get_item(args.get(0)?),
            "__setitem__" => {
                self.set_item(args.get(0)?, args.get(1)?.clone())?;
                Ok(Object::none())
            }
            "__delitem__" => {
                self.del_item(args.get(0)?)?;
                Ok(Object::none())
            }
            "__contains__" => Ok(Object::from(self.position(args.get(0)?).is_some())),
            "__iter__" => Ok(Object::Servant(IteratorObject::over(self.snapshot()))),
            _ => Err(TetherError::attribute(format!(
                "'list' object has no attribute '{}'",
                name
            ))),
        }
    }

    fn repr(&self) -> Result<String> {
        let parts = self
            .snapshot()
            .iter()
            .map(Object::repr)
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("[{}]", parts.join(", ")))
    }

    fn hash(&self) -> Result<i64> {
        Err(TetherError::type_error("unhashable type: 'list'"))
    }

    fn compare(&self, op: CmpOp, other: &Object) -> Result<Object> {
        // Lists compare by content against tuples shipped by value.
        let equal = match other {
            Object::Value(Value::Tuple(values)) => {
                let mine = self.snapshot();
                mine.len() == values.len()
                    && mine
                        .iter()
                        .zip(values)
                        .all(|(a, b)| a.as_value() == Some(b))
            }
            Object::Servant(o) => {
                Arc::as_ptr(o).cast::<()>() == (self as *const Self).cast::<()>()
            }
            _ => false,
        };
        match op {
            CmpOp::Eq => Ok(Object::from(equal)),
            CmpOp::Ne => Ok(Object::from(!equal)),
            _ => Ok(Object::Value(Value::NotImplemented)),
        }
    }

    fn pickle(&self, _protocol: i64) -> Result<Vec<u8>> {
        let values = self
            .snapshot()
            .into_iter()
            .map(Object::into_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(crate::brine::dump(&Value::Tuple(values))?)
    }
}

/// Iterator over a fixed run of items.
pub struct IteratorObject {
    items: Vec<Object>,
    pos: Mutex<usize>,
    this: Weak<IteratorObject>,
}

impl IteratorObject {
    pub fn over(items: Vec<Object>) -> Arc<IteratorObject> {
        Arc::new_cyclic(|this| Self {
            items,
            pos: Mutex::new(0),
            this: this.clone(),
        })
    }

    /// Next item, or `None` once exhausted.
    pub fn next_item(&self) -> Option<Object> {
        let mut pos = lock(&self.pos);
        let item = self.items.get(*pos).cloned();
        if item.is_some() {
            *pos += 1;
        }
        item
    }
}

impl Servant for IteratorObject {
    fn object_type(&self) -> Arc<ObjectType> {
        list_iterator_type()
    }

    fn call_method(&self, name: &str, _args: Args) -> Result<Object> {
        match name {
            "__next__" => self
                .next_item()
                .ok_or_else(|| crate::vinegar::Exception::stop_iteration().into()),
            "__iter__" => self
                .this
                .upgrade()
                .map(Object::from)
                .ok_or_else(|| TetherError::value_error("iterator is being dropped")),
            "__length_hint__" => {
                let pos = *lock(&self.pos);
                Ok(Object::from(self.items.len().saturating_sub(pos)))
            }
            _ => Err(TetherError::attribute(format!(
                "'list_iterator' object has no attribute '{}'",
                name
            ))),
        }
    }
}

/// A method bound to its receiver.
pub struct BoundMethod {
    receiver: Arc<dyn Servant>,
    name: String,
}

impl BoundMethod {
    pub fn new(receiver: Arc<dyn Servant>, name: impl Into<String>) -> Self {
        Self {
            receiver,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Servant for BoundMethod {
    fn object_type(&self) -> Arc<ObjectType> {
        method_type()
    }

    fn call(&self, args: Args) -> Result<Object> {
        self.receiver.call_method(&self.name, args)
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match name {
            "__call__" => self.call(args),
            _ => Err(TetherError::attribute(format!(
                "'method' object has no attribute '{}'",
                name
            ))),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Object> {
        match name {
            "__name__" => Ok(Object::from(self.name.as_str())),
            "__self__" => Ok(Object::Servant(self.receiver.clone())),
            "__doc__" => Ok(self
                .receiver
                .object_type()
                .methods()
                .get(&self.name)
                .cloned()
                .flatten()
                .map(Object::from)
                .unwrap_or_else(Object::none)),
            _ => Err(TetherError::attribute(format!(
                "'method' object has no attribute '{}'",
                name
            ))),
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["__doc__".into(), "__name__".into(), "__self__".into()]
    }

    fn repr(&self) -> Result<String> {
        Ok(format!(
            "<bound method {}.{}>",
            self.receiver.object_type().name(),
            self.name
        ))
    }
}

/// A free-standing callable, e.g. a callback handed to a peer.
pub struct FunctionObject {
    name: String,
    func: MethodFn,
}

impl FunctionObject {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl Servant for FunctionObject {
    fn object_type(&self) -> Arc<ObjectType> {
        function_type()
    }

    fn call(&self, args: Args) -> Result<Object> {
        (self.func)(args)
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match name {
            "__call__" => self.call(args),
            _ => Err(TetherError::attribute(format!(
                "'function' object has no attribute '{}'",
                name
            ))),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Object> {
        match name {
            "__name__" => Ok(Object::from(self.name.as_str())),
            _ => Err(TetherError::attribute(format!(
                "'function' object has no attribute '{}'",
                name
            ))),
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["__name__".into()]
    }

    fn repr(&self) -> Result<String> {
        Ok(format!("<function {}>", self.name))
    }
}

/// A class exposed by reference. Calling it constructs an instance.
pub struct ClassObject {
    ty: Arc<ObjectType>,
    constructor: Option<MethodFn>,
}

impl ClassObject {
    pub fn new(ty: Arc<ObjectType>) -> Self {
        Self {
            ty,
            constructor: None,
        }
    }

    pub fn with_constructor(
        mut self,
        constructor: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        self.constructor = Some(Arc::new(constructor));
        self
    }
}

impl Servant for ClassObject {
    fn object_type(&self) -> Arc<ObjectType> {
        self.ty.clone()
    }

    fn is_class(&self) -> bool {
        true
    }

    // Methods of a class are unbound; only construction is callable here.
    fn has_method(&self, name: &str) -> bool {
        name == "__call__"
    }

    fn call(&self, args: Args) -> Result<Object> {
        match &self.constructor {
            Some(constructor) => constructor(args),
            None => Err(TetherError::type_error(format!(
                "cannot create '{}' instances",
                self.ty.qualified_name()
            ))),
        }
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match name {
            "__call__" => self.call(args),
            _ => Err(TetherError::attribute(format!(
                "type object '{}' has no attribute '{}'",
                self.ty.name(),
                name
            ))),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Object> {
        match name {
            "__name__" => Ok(Object::from(self.ty.name())),
            "__module__" => Ok(Object::from(self.ty.module())),
            "__doc__" => Ok(self.ty.doc().map(Object::from).unwrap_or_else(Object::none)),
            _ => Err(TetherError::attribute(format!(
                "type object '{}' has no attribute '{}'",
                self.ty.name(),
                name
            ))),
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["__doc__".into(), "__module__".into(), "__name__".into()]
    }

    fn dir(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ty
            .method_names()
            .map(str::to_string)
            .chain(self.attr_names())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn repr(&self) -> Result<String> {
        Ok(format!("<class '{}'>", self.ty.qualified_name()))
    }

    fn is_instance(&self, qualified_type: &str) -> bool {
        matches!(qualified_type, "builtins.type" | "builtins.object")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[i64]) -> ListObject {
        ListObject::from_values(values.iter().map(|v| Value::from(*v)))
    }

    fn ints(objs: &[Object]) -> Vec<i64> {
        objs.iter().map(|o| o.as_i64().unwrap()).collect()
    }

    fn slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Object {
        Object::Value(Value::slice(
            start.into(),
            stop.into(),
            step.into(),
        ))
    }

    #[test]
    fn test_slice_indices_follow_sequence_semantics() {
        let s = |a: Option<i64>, b: Option<i64>, c: Option<i64>| Slice {
            start: a.into(),
            stop: b.into(),
            step: c.into(),
        };
        assert_eq!(slice_indices(&s(None, None, None), 5).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(&s(Some(1), Some(-1), None), 5).unwrap(), vec![1, 2, 3]);
        assert_eq!(slice_indices(&s(None, None, Some(-2)), 5).unwrap(), vec![4, 2, 0]);
        assert_eq!(slice_indices(&s(Some(10), Some(20), None), 5).unwrap(), Vec::<usize>::new());
        assert_eq!(slice_indices(&s(Some(-100), Some(2), None), 5).unwrap(), vec![0, 1]);
        assert!(slice_indices(&s(None, None, Some(0)), 5).is_err());
    }

    #[test]
    fn test_list_mutation_methods() {
        let l = list(&[1, 2, 3]);
        l.call_method("append", Args::new(vec![Object::from(4)])).unwrap();
        l.call_method("insert", Args::new(vec![Object::from(0), Object::from(0)])).unwrap();
        assert_eq!(ints(&l.snapshot()), vec![0, 1, 2, 3, 4]);
        assert_eq!(l.call_method("pop", Args::empty()).unwrap(), Object::from(4));
        assert_eq!(
            l.call_method("index", Args::new(vec![Object::from(2)])).unwrap(),
            Object::from(2usize)
        );
        l.call_method("reverse", Args::empty()).unwrap();
        assert_eq!(ints(&l.snapshot()), vec![3, 2, 1, 0]);
        assert_eq!(
            l.call_method("__len__", Args::empty()).unwrap(),
            Object::from(4usize)
        );
    }

    #[test]
    fn test_list_indexing_and_slices() {
        let l = list(&[10, 20, 30, 40]);
        assert_eq!(
            l.call_method("__getitem__", Args::new(vec![Object::from(-1)])).unwrap(),
            Object::from(40)
        );
        let err = l
            .call_method("__getitem__", Args::new(vec![Object::from(9)]))
            .unwrap_err();
        assert!(err.exception().unwrap().is_instance_of("builtins.LookupError"));

        l.call_method(
            "__setitem__",
            Args::new(vec![
                slice(Some(1), Some(3), None),
                Object::from(Value::tuple([Value::from(7)])),
            ]),
        )
        .unwrap();
        assert_eq!(ints(&l.snapshot()), vec![10, 7, 40]);

        l.call_method("__delitem__", Args::new(vec![slice(None, None, Some(2))]))
            .unwrap();
        assert_eq!(ints(&l.snapshot()), vec![7]);
    }

    #[test]
    fn test_iterator_exhaustion_raises_stop_iteration() {
        let it = IteratorObject::over(vec![Object::from(1)]);
        assert_eq!(it.call_method("__next__", Args::empty()).unwrap(), Object::from(1));
        let err = it.call_method("__next__", Args::empty()).unwrap_err();
        assert!(err.is_stop_iteration());
    }

    #[test]
    fn test_list_iterates_through_protocol() {
        let l = Object::servant(list(&[1, 2, 3]));
        assert_eq!(ints(&l.iterate().unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_pickle_requires_plain_values() {
        let l = list(&[1, 2]);
        let bytes = l.pickle(4).unwrap();
        assert_eq!(
            crate::brine::load(&bytes).unwrap(),
            Value::tuple([Value::from(1), Value::from(2)])
        );
        let mixed = ListObject::new(vec![Object::servant(list(&[]))]);
        assert!(mixed.pickle(4).is_err());
    }

    #[test]
    fn test_class_object_constructs() {
        let ty = Arc::new(ObjectType::new("demo", "Counter"));
        let class = ClassObject::new(ty).with_constructor(|args| {
            Ok(Object::servant(ListObject::new(args.positional)))
        });
        assert!(class.is_class());
        let made = class.call(Args::new(vec![Object::from(1)])).unwrap();
        assert_eq!(made.type_name(), "builtins.list");
        assert_eq!(class.repr().unwrap(), "<class 'demo.Counter'>");
    }

    #[test]
    fn test_function_object() {
        let f = FunctionObject::new("double", |args| Ok(Object::from(args.i64(0)? * 2)));
        assert_eq!(f.call(Args::new(vec![Object::from(21)])).unwrap(), Object::from(42));
        assert_eq!(f.get_attr("__name__").unwrap(), Object::from("double"));
    }
}
