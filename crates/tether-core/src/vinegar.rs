//! Vinegar: marshaling exceptions across a connection.
//!
//! An exception travels as a brine tuple
//!
//! ```text
//! ((module, class), args, ((attr, value), ...), traceback_text)
//! ```
//!
//! where `args` and attribute values are plain values (anything else is
//! replaced by its string form before it gets here). The receiving side
//! rebuilds the exception using a class it knows, or synthesizes a generic
//! class named after the original. Traceback text accumulates into a chain
//! each time an exception crosses a boundary.
//!
//! Exhausted iterators raise `StopIteration` constantly, so it has a one-byte
//! form of its own.

use crate::config::{Config, ConnectionConfig};
use crate::error::{Result, TetherError};
use crate::locks::{read, write};
use crate::object::Object;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once, OnceLock, RwLock};

/// Encoded form of `StopIteration`.
pub const STOP_ITERATION_MARKER: i64 = 1;

pub const BUILTINS_MODULE: &str = "builtins";
pub const GENERIC_EXCEPTION: &str = "tether.vinegar.GenericException";

/// Attribute names reserved for the traceback chain and version tag.
const ATTR_REMOTE_TB: &str = "_remote_tb";
const ATTR_REMOTE_VERSION: &str = "_remote_version";

const BUILTIN_HIERARCHY: &[(&str, Option<&str>)] = &[
    ("BaseException", None),
    ("SystemExit", Some("BaseException")),
    ("KeyboardInterrupt", Some("BaseException")),
    ("GeneratorExit", Some("BaseException")),
    ("Exception", Some("BaseException")),
    ("StopIteration", Some("Exception")),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("AssertionError", Some("Exception")),
    ("AttributeError", Some("Exception")),
    ("LookupError", Some("Exception")),
    ("IndexError", Some("LookupError")),
    ("KeyError", Some("LookupError")),
    ("NameError", Some("Exception")),
    ("ImportError", Some("Exception")),
    ("OSError", Some("Exception")),
    ("TimeoutError", Some("OSError")),
    ("ConnectionError", Some("OSError")),
    ("EOFError", Some("Exception")),
    ("RuntimeError", Some("Exception")),
    ("NotImplementedError", Some("RuntimeError")),
    ("ReferenceError", Some("Exception")),
    ("TypeError", Some("Exception")),
    ("ValueError", Some("Exception")),
];

/// An exception class: its qualified name and ancestry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionClass {
    module: String,
    name: String,
    /// Qualified names, this class first.
    ancestry: Vec<String>,
}

fn builtin_classes() -> &'static HashMap<&'static str, Arc<ExceptionClass>> {
    static CLASSES: OnceLock<HashMap<&'static str, Arc<ExceptionClass>>> = OnceLock::new();
    CLASSES.get_or_init(|| {
        let mut classes: HashMap<&'static str, Arc<ExceptionClass>> = HashMap::new();
        for (name, parent) in BUILTIN_HIERARCHY {
            let mut ancestry = vec![format!("{}.{}", BUILTINS_MODULE, name)];
            if let Some(parent) = parent.and_then(|p| classes.get(p)) {
                ancestry.extend(parent.ancestry.iter().cloned());
            }
            classes.insert(
                name,
                Arc::new(ExceptionClass {
                    module: BUILTINS_MODULE.to_string(),
                    name: name.to_string(),
                    ancestry,
                }),
            );
        }
        classes
    })
}

fn generic_base() -> Arc<ExceptionClass> {
    static GENERIC: OnceLock<Arc<ExceptionClass>> = OnceLock::new();
    GENERIC
        .get_or_init(|| ExceptionClass::new("tether.vinegar", "GenericException", &builtin("Exception")))
        .clone()
}

/// A builtin class by short name. Unknown names fall back to `Exception`.
fn builtin(name: &str) -> Arc<ExceptionClass> {
    let classes = builtin_classes();
    classes
        .get(name)
        .or_else(|| classes.get("Exception"))
        .cloned()
        .unwrap_or_else(|| {
            Arc::new(ExceptionClass {
                module: BUILTINS_MODULE.to_string(),
                name: name.to_string(),
                ancestry: vec![format!("{}.{}", BUILTINS_MODULE, name)],
            })
        })
}

impl ExceptionClass {
    /// A new class deriving from `base`.
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        base: &ExceptionClass,
    ) -> Arc<Self> {
        let module = module.into();
        let name = name.into();
        let mut ancestry = vec![format!("{}.{}", module, name)];
        ancestry.extend(base.ancestry.iter().cloned());
        Arc::new(Self {
            module,
            name,
            ancestry,
        })
    }

    /// A builtin class such as `ValueError`.
    pub fn builtin(name: &str) -> Option<Arc<Self>> {
        builtin_classes().get(name).cloned()
    }

    /// The base of every synthesized class.
    pub fn generic() -> Arc<Self> {
        generic_base()
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

    pub fn ancestry(&self) -> &[String] {
        &self.ancestry
    }

    /// Subclass test. A bare name matches any module.
    pub fn is_subclass_of(&self, class: &str) -> bool {
        self.ancestry.iter().any(|entry| {
            entry == class
                || (!class.contains('.')
                    && entry.rsplit('.').next().is_some_and(|short| short == class))
        })
    }

    /// Name as shown in a traceback's last line.
    fn display_name(&self) -> String {
        if self.module == BUILTINS_MODULE {
            self.name.clone()
        } else {
            self.qualified_name()
        }
    }
}

/// How a registered custom class may be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Usable whenever `instantiate_custom_exceptions` is on.
    Loaded,
    /// Additionally requires `import_custom_exceptions`.
    Importable,
}

#[derive(Debug, Default)]
struct RegistryInner {
    custom: HashMap<String, (Arc<ExceptionClass>, Availability)>,
    generic: HashMap<String, Arc<ExceptionClass>>,
}

/// Exception classes this endpoint can reconstruct.
///
/// Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct ExceptionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ExceptionRegistry {
    pub fn register(&self, class: Arc<ExceptionClass>) {
        self.insert(class, Availability::Loaded);
    }

    pub fn register_importable(&self, class: Arc<ExceptionClass>) {
        self.insert(class, Availability::Importable);
    }

    fn insert(&self, class: Arc<ExceptionClass>, availability: Availability) {
        write(&self.inner)
            .custom
            .insert(class.qualified_name(), (class, availability));
    }

    pub fn is_registered(&self, qualified_name: &str) -> bool {
        read(&self.inner).custom.contains_key(qualified_name)
    }

    /// Pick the class to rebuild `module.name` as, under the given policy.
    pub fn resolve(
        &self,
        module: &str,
        name: &str,
        instantiate_custom: bool,
        import_custom: bool,
    ) -> Arc<ExceptionClass> {
        if module == BUILTINS_MODULE {
            if let Some(class) = ExceptionClass::builtin(name) {
                return class;
            }
        }
        let qualified = format!("{}.{}", module, name);
        if qualified == GENERIC_EXCEPTION {
            return generic_base();
        }
        if instantiate_custom {
            if let Some((class, availability)) = read(&self.inner).custom.get(&qualified) {
                if *availability == Availability::Loaded || import_custom {
                    return class.clone();
                }
            }
        }
        if let Some(class) = read(&self.inner).generic.get(&qualified) {
            return class.clone();
        }
        let class = ExceptionClass::new(module, name, &generic_base());
        write(&self.inner)
            .generic
            .entry(qualified)
            .or_insert(class)
            .clone()
    }
}

/// An exception raised by a handler, locally or on a peer.
#[derive(Debug, Clone)]
pub struct Exception {
    class: Arc<ExceptionClass>,
    args: Vec<Value>,
    attributes: Vec<(String, Value)>,
    frames: Vec<String>,
    remote_traceback: Vec<String>,
    remote_version: Option<String>,
}

impl Exception {
    pub fn new(class: Arc<ExceptionClass>, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            attributes: Vec::new(),
            frames: Vec::new(),
            remote_traceback: Vec::new(),
            remote_version: None,
        }
    }

    /// A builtin exception with a single message argument.
    pub fn builtin(name: &str, message: impl Into<String>) -> Self {
        Self::new(builtin(name), vec![Value::Str(message.into())])
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::builtin("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::builtin("TypeError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::builtin("AttributeError", message)
    }

    pub fn key_error(key: impl Into<Value>) -> Self {
        Self::new(builtin("KeyError"), vec![key.into()])
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::builtin("IndexError", message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::builtin("RuntimeError", message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::builtin("ReferenceError", message)
    }

    pub fn timeout_error(message: impl Into<String>) -> Self {
        Self::builtin("TimeoutError", message)
    }

    pub fn eof_error(message: impl Into<String>) -> Self {
        Self::builtin("EOFError", message)
    }

    pub fn os_error(message: impl Into<String>) -> Self {
        Self::builtin("OSError", message)
    }

    pub fn not_implemented_error(message: impl Into<String>) -> Self {
        Self::builtin("NotImplementedError", message)
    }

    pub fn stop_iteration() -> Self {
        Self::new(builtin("StopIteration"), Vec::new())
    }

    pub fn system_exit(code: i64) -> Self {
        Self::new(builtin("SystemExit"), vec![Value::from(code)])
    }

    pub fn keyboard_interrupt() -> Self {
        Self::new(builtin("KeyboardInterrupt"), Vec::new())
    }

    /// Append an argument; references are replaced by their string form.
    pub fn with_arg(mut self, arg: impl Into<Object>) -> Self {
        self.args.push(flatten(arg.into()));
        self
    }

    /// Set an attribute; references are replaced by their string form.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Object>) -> Self {
        let name = name.into();
        let value = flatten(value.into());
        self.attributes.retain(|(k, _)| *k != name);
        self.attributes.push((name, value));
        self
    }

    /// Record a traceback frame (innermost last).
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    pub fn class(&self) -> &Arc<ExceptionClass> {
        &self.class
    }

    pub fn module(&self) -> &str {
        self.class.module()
    }

    pub fn name(&self) -> &str {
        self.class.name()
    }

    pub fn qualified_name(&self) -> String {
        self.class.qualified_name()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn attributes(&self) -> &[(String, Value)] {
        &self.attributes
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// Traceback texts from earlier hops, oldest first.
    pub fn remote_traceback(&self) -> &[String] {
        &self.remote_traceback
    }

    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        !self.remote_traceback.is_empty()
    }

    pub fn is_instance_of(&self, class: &str) -> bool {
        self.class.is_subclass_of(class)
    }

    pub fn is_stop_iteration(&self) -> bool {
        self.is_instance_of("builtins.StopIteration")
    }

    pub fn is_system_exit(&self) -> bool {
        self.is_instance_of("builtins.SystemExit")
    }

    pub fn is_keyboard_interrupt(&self) -> bool {
        self.is_instance_of("builtins.KeyboardInterrupt")
    }

    /// The arguments rendered the way a one-line error message shows them.
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => single.to_string(),
            many => Value::Tuple(many.to_vec()).to_string(),
        }
    }

    /// Locally formatted traceback.
    pub fn traceback_text(&self) -> String {
        let mut text = String::from("Traceback (most recent call last):\n");
        for frame in &self.frames {
            text.push_str("  ");
            text.push_str(frame);
            text.push('\n');
        }
        text.push_str(&self.headline());
        text
    }

    fn headline(&self) -> String {
        let message = self.message();
        if message.is_empty() {
            self.class.display_name()
        } else {
            format!("{}: {}", self.class.display_name(), message)
        }
    }
}

fn flatten(obj: Object) -> Value {
    match obj {
        Object::Value(v) => v,
        other => Value::Str(other.str().unwrap_or_else(|_| format!("<{}>", other.type_name()))),
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.headline())?;
        for (i, tb) in self.remote_traceback.iter().enumerate() {
            write!(
                f,
                "\n\n========= Remote Traceback ({}) =========\n{}",
                i + 1,
                tb
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// Version tag attached to outgoing exceptions.
pub fn local_version() -> String {
    format!("tether/{}", env!("CARGO_PKG_VERSION"))
}

/// Marshal an exception for the wire.
pub fn dump(exc: &Exception, config: &Config) -> Value {
    if exc.is_stop_iteration() {
        return Value::from(STOP_ITERATION_MARKER);
    }
    let mut attrs: Vec<Value> = exc
        .attributes
        .iter()
        .map(|(k, v)| Value::tuple([Value::from(k.as_str()), v.clone()]))
        .collect();
    attrs.push(Value::tuple([
        Value::from(ATTR_REMOTE_TB),
        Value::tuple(exc.remote_traceback.iter().map(|tb| Value::from(tb.as_str()))),
    ]));
    if config.include_local_version {
        attrs.push(Value::tuple([
            Value::from(ATTR_REMOTE_VERSION),
            Value::from(local_version()),
        ]));
    }
    let traceback = if config.include_local_traceback {
        exc.traceback_text()
    } else {
        ConnectionConfig::TRACEBACK_DENIED.to_string()
    };
    Value::tuple([
        Value::tuple([Value::from(exc.module()), Value::from(exc.name())]),
        Value::Tuple(exc.args.clone()),
        Value::Tuple(attrs),
        Value::Str(traceback),
    ])
}

/// Rebuild an exception received from a peer.
pub fn load(value: &Value, config: &Config) -> Result<Exception> {
    if value.as_i64() == Some(STOP_ITERATION_MARKER) && matches!(value, Value::Int(_)) {
        return Ok(Exception::stop_iteration());
    }
    let malformed = || TetherError::Protocol(format!("malformed exception payload: {}", value.repr()));
    let [class, args, attrs, traceback] = value.as_tuple().ok_or_else(malformed)? else {
        return Err(malformed());
    };
    let [module, name] = class.as_tuple().ok_or_else(malformed)? else {
        return Err(malformed());
    };
    let module = module.as_str().ok_or_else(malformed)?;
    let name = name.as_str().ok_or_else(malformed)?;
    let class = config.exceptions.resolve(
        module,
        name,
        config.instantiate_custom_exceptions,
        config.import_custom_exceptions,
    );

    let mut exc = Exception::new(class, args.as_tuple().ok_or_else(malformed)?.to_vec());
    for pair in attrs.as_tuple().ok_or_else(malformed)? {
        let [key, val] = pair.as_tuple().ok_or_else(malformed)? else {
            return Err(malformed());
        };
        match key.as_str().ok_or_else(malformed)? {
            ATTR_REMOTE_TB => {
                exc.remote_traceback = val
                    .as_tuple()
                    .ok_or_else(malformed)?
                    .iter()
                    .filter_map(|tb| tb.as_str().map(str::to_string))
                    .collect();
            }
            ATTR_REMOTE_VERSION => exc.remote_version = val.as_str().map(str::to_string),
            other => exc.attributes.push((other.to_string(), val.clone())),
        }
    }
    exc.remote_traceback
        .push(traceback.as_str().ok_or_else(malformed)?.to_string());
    Ok(exc)
}

/// Report printed for an exception that unwinds to the top of a thread.
pub fn format_unhandled(exc: &Exception) -> String {
    let mut out = String::new();
    for tb in &exc.remote_traceback {
        out.push_str("======= Remote traceback =======\n");
        out.push_str(tb);
        out.push('\n');
    }
    out.push_str("\n======= Local exception =======\n");
    out.push_str(&exc.traceback_text());
    out
}

/// Install a process-wide panic hook that prints the remote traceback chain
/// of an [`Exception`] or [`TetherError`] panic payload before the usual
/// report. Idempotent.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let exc = payload
                .downcast_ref::<Exception>()
                .or_else(|| payload.downcast_ref::<TetherError>().and_then(TetherError::exception));
            if let Some(exc) = exc {
                if exc.is_remote() {
                    eprintln!("{}", format_unhandled(exc));
                }
            }
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_hop(exc: &Exception, sender: &Config, receiver: &Config) -> Exception {
        let wire = crate::brine::dump(&dump(exc, sender)).unwrap();
        load(&crate::brine::load(&wire).unwrap(), receiver).unwrap()
    }

    #[test]
    fn test_builtin_hierarchy() {
        let exc = Exception::index_error("list index out of range");
        assert!(exc.is_instance_of("builtins.IndexError"));
        assert!(exc.is_instance_of("LookupError"));
        assert!(exc.is_instance_of("builtins.Exception"));
        assert!(!exc.is_instance_of("builtins.KeyError"));
        assert!(Exception::system_exit(2).is_instance_of("BaseException"));
        assert!(!Exception::system_exit(2).is_instance_of("Exception"));
    }

    #[test]
    fn test_stop_iteration_is_one_byte() {
        let config = Config::default();
        let wire = crate::brine::dump(&dump(&Exception::stop_iteration(), &config)).unwrap();
        assert_eq!(wire.len(), 1);
        let back = load(&crate::brine::load(&wire).unwrap(), &config).unwrap();
        assert!(back.is_stop_iteration());
    }

    #[test]
    fn test_builtin_roundtrip_preserves_class_args_and_traceback() {
        let config = Config::default();
        let exc = Exception::value_error("boom")
            .with_attr("code", 7)
            .with_frame("in handler CALLATTR 'fail'");
        let back = remote_hop(&exc, &config, &config);
        assert_eq!(back.qualified_name(), "builtins.ValueError");
        assert_eq!(back.args(), &[Value::from("boom")]);
        assert_eq!(back.attr("code"), Some(&Value::from(7)));
        assert_eq!(back.remote_traceback().len(), 1);
        assert!(back.remote_traceback()[0].contains("ValueError: boom"));
        assert_eq!(back.remote_version(), Some(local_version().as_str()));
        assert!(back.to_string().contains("========= Remote Traceback (1) ========="));
    }

    #[test]
    fn test_traceback_chain_accumulates() {
        let config = Config::default();
        let first = remote_hop(&Exception::runtime_error("deep"), &config, &config);
        let second = remote_hop(&first, &config, &config);
        assert_eq!(second.remote_traceback().len(), 2);
        assert!(second.to_string().contains("Remote Traceback (2)"));
    }

    #[test]
    fn test_traceback_denied() {
        let sender = Config {
            include_local_traceback: false,
            include_local_version: false,
            ..Config::default()
        };
        let back = remote_hop(&Exception::type_error("x"), &sender, &Config::default());
        assert_eq!(back.remote_traceback(), &[ConnectionConfig::TRACEBACK_DENIED.to_string()]);
        assert_eq!(back.remote_version(), None);
    }

    #[test]
    fn test_custom_class_policy() {
        let app_error = ExceptionClass::new("app.errors", "QuotaExceeded", &builtin("RuntimeError"));
        let exc = Exception::new(app_error.clone(), vec![Value::from("over quota")]);

        // Unknown to the receiver: generic class named after the original
        let plain = Config::default();
        let back = remote_hop(&exc, &plain, &plain);
        assert_eq!(back.qualified_name(), "app.errors.QuotaExceeded");
        assert!(back.is_instance_of(GENERIC_EXCEPTION));
        assert!(!back.is_instance_of("builtins.RuntimeError"));

        // Registered and instantiation allowed: the real class
        let permissive = Config {
            instantiate_custom_exceptions: true,
            ..Config::default()
        };
        permissive.exceptions.register(app_error.clone());
        let back = remote_hop(&exc, &plain, &permissive);
        assert!(back.is_instance_of("builtins.RuntimeError"));
        assert!(!back.is_instance_of(GENERIC_EXCEPTION));

        // Importable classes additionally need the import switch
        let importable = Config {
            instantiate_custom_exceptions: true,
            ..Config::default()
        };
        importable.exceptions.register_importable(app_error);
        let back = remote_hop(&exc, &plain, &importable);
        assert!(back.is_instance_of(GENERIC_EXCEPTION));
    }

    #[test]
    fn test_generic_classes_are_cached() {
        let registry = ExceptionRegistry::default();
        let a = registry.resolve("x", "Oops", false, false);
        let b = registry.resolve("x", "Oops", false, false);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reference_args_are_flattened() {
        let list = Object::servant(crate::builtins::ListObject::from_values([Value::from(1)]));
        let exc = Exception::value_error("bad").with_arg(list);
        assert_eq!(exc.args()[1], Value::from("[1]"));
    }

    #[test]
    fn test_malformed_payload() {
        let config = Config::default();
        assert!(matches!(
            load(&Value::from("junk"), &config),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn test_unhandled_report_layout() {
        let config = Config::default();
        let back = remote_hop(&Exception::value_error("boom"), &config, &config);
        let report = format_unhandled(&back);
        let remote_at = report.find("======= Remote traceback =======").unwrap();
        let local_at = report.find("======= Local exception =======").unwrap();
        assert!(remote_at < local_at);
    }
}
