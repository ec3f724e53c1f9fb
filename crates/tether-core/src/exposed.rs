//! Closure-backed servants.
//!
//! [`ExposedBuilder`] assembles an object from closures. Methods registered
//! with [`ExposedBuilder::exposed`] get the exposed prefix (`exposed_` by
//! default), which the connection's access rules let peers call by either the
//! bare or the prefixed name.

use crate::builtins::MethodFn;
use crate::error::{Result, TetherError};
use crate::locks::{read, write};
use crate::object::{Args, Object, ObjectType, Servant};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

type GetattrHook = Arc<dyn Fn(&str) -> Option<Result<Object>> + Send + Sync>;
type SetattrHook = Arc<dyn Fn(&str, &Object) -> Option<Result<()>> + Send + Sync>;
type DelattrHook = Arc<dyn Fn(&str) -> Option<Result<()>> + Send + Sync>;

/// A servant whose behaviour is supplied by closures.
pub struct Exposed {
    ty: Arc<ObjectType>,
    methods: HashMap<String, MethodFn>,
    attrs: RwLock<BTreeMap<String, Object>>,
    call: Option<MethodFn>,
    getattr_hook: Option<GetattrHook>,
    setattr_hook: Option<SetattrHook>,
    delattr_hook: Option<DelattrHook>,
}

impl Exposed {
    pub fn builder(module: impl Into<String>, name: impl Into<String>) -> ExposedBuilder {
        ExposedBuilder::new(module, name)
    }

    /// Current value of a data attribute.
    pub fn attr(&self, name: &str) -> Option<Object> {
        read(&self.attrs).get(name).cloned()
    }
}

impl Servant for Exposed {
    fn object_type(&self) -> Arc<ObjectType> {
        self.ty.clone()
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn call_method(&self, name: &str, args: Args) -> Result<Object> {
        match self.methods.get(name) {
            Some(method) => method(args),
            None => Err(TetherError::attribute(format!(
                "'{}' object has no attribute '{}'",
                self.ty.name(),
                name
            ))),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Object> {
        match name {
            "__doc__" => return Ok(self.ty.doc().map(Object::from).unwrap_or_else(Object::none)),
            "__class__" => return Ok(Object::from(self.ty.qualified_name())),
            _ => {}
        }
        self.attr(name).ok_or_else(|| {
            TetherError::attribute(format!(
                "'{}' object has no attribute '{}'",
                self.ty.name(),
                name
            ))
        })
    }

    fn set_attr(&self, name: &str, value: Object) -> Result<()> {
        let previous = write(&self.attrs).insert(name.to_string(), value);
        drop(previous);
        Ok(())
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        let removed = write(&self.attrs).remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(TetherError::attribute(format!(
                "'{}' object has no attribute '{}'",
                self.ty.name(),
                name
            ))),
        }
    }

    fn attr_names(&self) -> Vec<String> {
        read(&self.attrs).keys().cloned().collect()
    }

    fn call(&self, args: Args) -> Result<Object> {
        match &self.call {
            Some(call) => call(args),
            None => Err(TetherError::type_error(format!(
                "'{}' object is not callable",
                self.ty.name()
            ))),
        }
    }

    fn rpc_getattr(&self, name: &str) -> Option<Result<Object>> {
        self.getattr_hook.as_ref().and_then(|hook| hook(name))
    }

    fn rpc_setattr(&self, name: &str, value: &Object) -> Option<Result<()>> {
        self.setattr_hook.as_ref().and_then(|hook| hook(name, value))
    }

    fn rpc_delattr(&self, name: &str) -> Option<Result<()>> {
        self.delattr_hook.as_ref().and_then(|hook| hook(name))
    }
}

/// Builder for [`Exposed`].
pub struct ExposedBuilder {
    ty: ObjectType,
    prefix: String,
    methods: HashMap<String, MethodFn>,
    attrs: BTreeMap<String, Object>,
    call: Option<MethodFn>,
    getattr_hook: Option<GetattrHook>,
    setattr_hook: Option<SetattrHook>,
    delattr_hook: Option<DelattrHook>,
}

impl ExposedBuilder {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ObjectType::new(module, name),
            prefix: "exposed_".to_string(),
            methods: HashMap::new(),
            attrs: BTreeMap::new(),
            call: None,
            getattr_hook: None,
            setattr_hook: None,
            delattr_hook: None,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.ty = self.ty.with_doc(doc);
        self
    }

    pub fn base(mut self, qualified_name: impl Into<String>) -> Self {
        self.ty = self.ty.with_base(qualified_name);
        self
    }

    /// Prefix applied by [`ExposedBuilder::exposed`]; must match the
    /// connection's `exposed_prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Register a method under the exposed prefix.
    pub fn exposed(
        self,
        name: &str,
        f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        let full = format!("{}{}", self.prefix, name);
        self.method_with_doc(&full, None, f)
    }

    pub fn exposed_with_doc(
        self,
        name: &str,
        doc: &str,
        f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        let full = format!("{}{}", self.prefix, name);
        self.method_with_doc(&full, Some(doc), f)
    }

    /// Register a method under its literal name, e.g. `__len__`.
    pub fn method(
        self,
        name: &str,
        f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        self.method_with_doc(name, None, f)
    }

    pub fn method_with_doc(
        mut self,
        name: &str,
        doc: Option<&str>,
        f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static,
    ) -> Self {
        self.ty = self.ty.with_method(name, doc);
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<Object>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    /// Data attribute under the exposed prefix.
    pub fn exposed_attr(self, name: &str, value: impl Into<Object>) -> Self {
        let full = format!("{}{}", self.prefix, name);
        self.attr(&full, value)
    }

    /// Behaviour when the object itself is called.
    pub fn callable(mut self, f: impl Fn(Args) -> Result<Object> + Send + Sync + 'static) -> Self {
        self.call = Some(Arc::new(f));
        self
    }

    /// Custom read policy; returning `None` defers to the access rules.
    pub fn getattr_hook(
        mut self,
        hook: impl Fn(&str) -> Option<Result<Object>> + Send + Sync + 'static,
    ) -> Self {
        self.getattr_hook = Some(Arc::new(hook));
        self
    }

    pub fn setattr_hook(
        mut self,
        hook: impl Fn(&str, &Object) -> Option<Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.setattr_hook = Some(Arc::new(hook));
        self
    }

    pub fn delattr_hook(
        mut self,
        hook: impl Fn(&str) -> Option<Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.delattr_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Exposed {
        Exposed {
            ty: Arc::new(self.ty),
            methods: self.methods,
            attrs: RwLock::new(self.attrs),
            call: self.call,
            getattr_hook: self.getattr_hook,
            setattr_hook: self.setattr_hook,
            delattr_hook: self.delattr_hook,
        }
    }

    pub fn build_arc(self) -> Arc<Exposed> {
        Arc::new(self.build())
    }
}
