//! Server side of every request handler.

use super::access::{check_attr, Access};
use super::{bump, Connection};
use crate::builtins::type_type;
use crate::error::{Result, TetherError};
use crate::object::{lookup_attr, Args, CmpOp, IdPack, Object, Servant};
use crate::protocol::Handler;
use crate::service::service_aliases;
use crate::value::Value;
use crate::vinegar::{self, Exception};
use std::sync::Arc;

/// Split request arguments into exactly `N` parts.
fn arity<const N: usize>(handler: Handler, args: Vec<Object>) -> Result<[Object; N]> {
    args.try_into().map_err(|args: Vec<Object>| {
        TetherError::type_error(format!(
            "{} takes {} arguments ({} given)",
            handler,
            N,
            args.len()
        ))
    })
}

fn target(obj: &Object) -> Result<Arc<dyn Servant>> {
    obj.as_servant().ok_or_else(|| {
        TetherError::type_error(format!(
            "'{}' object is not a reference",
            obj.type_name()
        ))
    })
}

fn string_arg(handler: Handler, obj: &Object) -> Result<&str> {
    obj.as_str()
        .ok_or_else(|| TetherError::type_error(format!("{} expects a string name", handler)))
}

/// Rebuild call arguments from a positional tuple and `(name, value)` pairs.
fn call_args(positional: Object, keywords: Object) -> Result<Args> {
    let mut args = Args::new(positional.into_items()?);
    for pair in keywords.into_items()? {
        let [name, value]: [Object; 2] = pair
            .into_items()?
            .try_into()
            .map_err(|_| TetherError::type_error("keyword arguments must be (name, value) pairs"))?;
        let name = name
            .as_str()
            .ok_or_else(|| TetherError::type_error("keywords must be strings"))?
            .to_string();
        args = args.with_keyword(name, value);
    }
    Ok(args)
}

fn names_tuple(names: impl IntoIterator<Item = String>) -> Object {
    Object::Value(Value::tuple(names.into_iter().map(Value::from)))
}

impl Connection {
    pub(super) fn handle_request(&self, handler: Handler, boxed_args: &Value) -> Result<Object> {
        let args = self.unbox(boxed_args)?.into_items()?;
        match handler {
            Handler::Ping => {
                let [data] = arity(handler, args)?;
                Ok(data)
            }
            Handler::Close => {
                self.cleanup("closed by peer");
                Ok(Object::none())
            }
            Handler::GetRoot => self
                .local_root()
                .map(Object::Servant)
                .ok_or_else(|| TetherError::Closed(self.connid().to_string())),
            Handler::GetAttr => {
                let [obj, name] = arity(handler, args)?;
                self.handle_getattr(&target(&obj)?, string_arg(handler, &name)?)
            }
            Handler::SetAttr => {
                let [obj, name, value] = arity(handler, args)?;
                let target = target(&obj)?;
                let name = string_arg(handler, &name)?;
                if let Some(hooked) = target.rpc_setattr(name, &value) {
                    return hooked.map(|()| Object::none());
                }
                let name = check_attr(self.config(), &*target, name, Access::Set)?;
                target.set_attr(&name, value)?;
                Ok(Object::none())
            }
            Handler::DelAttr => {
                let [obj, name] = arity(handler, args)?;
                let target = target(&obj)?;
                let name = string_arg(handler, &name)?;
                if let Some(hooked) = target.rpc_delattr(name) {
                    return hooked.map(|()| Object::none());
                }
                let name = check_attr(self.config(), &*target, name, Access::Delete)?;
                target.del_attr(&name)?;
                Ok(Object::none())
            }
            Handler::Call => {
                let [obj, positional, keywords] = arity(handler, args)?;
                obj.call(call_args(positional, keywords)?)
            }
            Handler::CallAttr => {
                let [obj, name, positional, keywords] = arity(handler, args)?;
                let call = call_args(positional, keywords)?;
                self.handle_callattr(&target(&obj)?, string_arg(handler, &name)?, call)
            }
            Handler::Repr => {
                let [obj] = arity(handler, args)?;
                Ok(Object::from(obj.repr()?))
            }
            Handler::Str => {
                let [obj] = arity(handler, args)?;
                Ok(Object::from(obj.str()?))
            }
            Handler::Cmp => {
                let [obj, other, op] = arity(handler, args)?;
                let op_name = string_arg(handler, &op)?;
                let op = CmpOp::from_dunder(op_name).ok_or_else(|| {
                    TetherError::value_error(format!("unknown comparison '{}'", op_name))
                })?;
                let target = target(&obj)?;
                check_attr(self.config(), &*target, op_name, Access::Get)?;
                target.compare(op, &other)
            }
            Handler::Hash => {
                let [obj] = arity(handler, args)?;
                Ok(Object::from(target(&obj)?.hash()?))
            }
            Handler::Dir => {
                let [obj] = arity(handler, args)?;
                Ok(names_tuple(target(&obj)?.dir()))
            }
            Handler::Pickle => {
                let [obj, protocol] = arity(handler, args)?;
                if !self.config().allow_pickle {
                    return Err(TetherError::value_error("pickling is disabled"));
                }
                let protocol = protocol
                    .as_i64()
                    .ok_or_else(|| TetherError::type_error("pickle protocol must be an integer"))?;
                Ok(Object::from(target(&obj)?.pickle(protocol)?))
            }
            Handler::Del => {
                let [id_pack, count] = arity(handler, args)?;
                self.handle_del(&id_pack, &count)
            }
            Handler::Inspect => {
                let [id_pack] = arity(handler, args)?;
                self.handle_inspect(&id_pack)
            }
            Handler::BuffIter => {
                let [obj, count] = arity(handler, args)?;
                let count = count
                    .as_i64()
                    .and_then(|c| usize::try_from(c).ok())
                    .ok_or_else(|| TetherError::type_error("BUFFITER count must be a non-negative integer"))?;
                let iterator = target(&obj)?;
                let mut items = Vec::with_capacity(count);
                while items.len() < count {
                    match iterator.call_method("__next__", Args::empty()) {
                        Ok(item) => items.push(item),
                        Err(e) if e.is_stop_iteration() => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(Object::tuple(items))
            }
            Handler::OldSlicing => {
                let [obj, attempt, fallback, start, stop, extra] = arity(handler, args)?;
                self.handle_oldslicing(
                    &target(&obj)?,
                    string_arg(handler, &attempt)?,
                    string_arg(handler, &fallback)?,
                    start.into_value()?,
                    stop.into_value()?,
                    extra.into_items()?,
                )
            }
            Handler::CtxExit => {
                let [obj, exc] = arity(handler, args)?;
                let target = target(&obj)?;
                check_attr(self.config(), &*target, "__exit__", Access::Get)?;
                let exc = match exc {
                    Object::Value(Value::None) => None,
                    Object::Value(dumped) => Some(vinegar::load(&dumped, self.config())?),
                    other => {
                        return Err(TetherError::type_error(format!(
                            "CTXEXIT expects an exception, got {}",
                            other.type_name()
                        )))
                    }
                };
                target.ctx_exit(exc.as_ref())
            }
            Handler::InstanceCheck => {
                let [obj, type_name] = arity(handler, args)?;
                let type_name = string_arg(handler, &type_name)?;
                Ok(Object::from(target(&obj)?.is_instance(type_name)))
            }
            Handler::GetServiceAliases => Ok(names_tuple(service_aliases(&**self.service()))),
        }
    }

    fn handle_getattr(&self, target: &Arc<dyn Servant>, name: &str) -> Result<Object> {
        if let Some(hooked) = target.rpc_getattr(name) {
            return hooked;
        }
        let name = check_attr(self.config(), &**target, name, Access::Get)?;
        lookup_attr(target, &name)
    }

    fn handle_callattr(&self, target: &Arc<dyn Servant>, name: &str, args: Args) -> Result<Object> {
        if let Some(hooked) = target.rpc_getattr(name) {
            return hooked?.call(args);
        }
        let name = check_attr(self.config(), &**target, name, Access::Get)?;
        if target.has_method(&name) {
            target.call_method(&name, args)
        } else {
            target.get_attr(&name)?.call(args)
        }
    }

    fn handle_del(&self, id_pack: &Object, count: &Object) -> Result<Object> {
        let id_pack = IdPack::from_value(id_pack.as_value().unwrap_or(&Value::None))?;
        let count = count
            .as_i64()
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| TetherError::type_error("DEL count must be a non-negative integer"))?;
        bump(&self.inner.stats.dels_received);
        let released = self.inner.local_objects.decref(&id_pack, count);
        drop(released);
        Ok(Object::none())
    }

    fn handle_inspect(&self, id_pack: &Object) -> Result<Object> {
        let id_pack = IdPack::from_value(id_pack.as_value().unwrap_or(&Value::None))?;
        let obj = self
            .inner
            .local_objects
            .get(&id_pack)
            .ok_or_else(|| TetherError::StaleReference(id_pack.clone()))?;
        let target = target(&obj)?;
        let ty = if target.is_class() {
            type_type()
        } else {
            target.object_type()
        };
        let entries = ty.methods().iter().map(|(name, doc)| {
            Value::tuple([
                Value::from(name.as_str()),
                doc.as_deref().map_or(Value::None, Value::from),
            ])
        });
        Ok(Object::Value(Value::tuple(entries)))
    }

    /// Slicing with a two-step lookup: `attempt(slice(start, stop), *extra)`,
    /// or when the target has no such attribute,
    /// `fallback(start, stop, *extra)` with an open stop as the largest index.
    fn handle_oldslicing(
        &self,
        target: &Arc<dyn Servant>,
        attempt: &str,
        fallback: &str,
        start: Value,
        stop: Value,
        extra: Vec<Object>,
    ) -> Result<Object> {
        match self.handle_getattr(target, attempt) {
            Ok(method) => {
                let slice = Object::from(Value::slice(start, stop, Value::None));
                method.call(Args::new(extra).prepend(slice))
            }
            Err(e) if is_attribute_error(&e) => {
                let method = self.handle_getattr(target, fallback)?;
                let stop = if stop.is_none() { Value::from(i64::MAX) } else { stop };
                let mut positional = vec![Object::from(start), Object::from(stop)];
                positional.extend(extra);
                method.call(Args::new(positional))
            }
            Err(e) => Err(e),
        }
    }
}

fn is_attribute_error(err: &TetherError) -> bool {
    err.exception()
        .is_some_and(|exc: &Exception| exc.is_instance_of("AttributeError"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::builtins::{ClassObject, ListObject};
    use crate::config::Config;
    use crate::exposed::Exposed;
    use crate::factory::connect_pair;
    use crate::helpers::BgServingThread;
    use crate::locks::lock;
    use crate::object::ObjectType;
    use crate::service::{ExposedService, VoidService};
    use std::sync::Mutex;

    struct Fixture {
        client: Connection,
        _server: Connection,
        _bg: BgServingThread,
    }

    fn fixture(server_config: Config) -> Fixture {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let service = ExposedService::new("FixtureService", move |_conn| {
            let log = log.clone();
            Exposed::builder("tests", "Fixture")
                .exposed("numbers", |_| {
                    Ok(Object::servant(ListObject::from_values(
                        (0..25).map(Value::from),
                    )))
                })
                .exposed("record", move |args| {
                    lock(&log).push(args.str(0)?.to_string());
                    Ok(Object::from(lock(&log).len()))
                })
                .exposed("kw", |args| {
                    Ok(args
                        .keyword("flag")
                        .cloned()
                        .unwrap_or_else(|| Object::from("missing")))
                })
                .exposed("klass", |_| {
                    let ty = Arc::new(ObjectType::new("tests", "Widget").with_method("spin", None));
                    Ok(Object::servant(ClassObject::new(ty)))
                })
                .exposed_attr("label", "fixture")
                .attr("hidden", 7)
                .build_arc()
        });
        let (client, server) = connect_pair(
            Arc::new(VoidService),
            Config::default(),
            Arc::new(service),
            server_config,
        )
        .unwrap();
        let bg = BgServingThread::start(server.clone()).unwrap();
        Fixture {
            client,
            _server: server,
            _bg: bg,
        }
    }

    #[test]
    fn test_getattr_policy() {
        let fx = fixture(Config::default());
        let root = fx.client.root().unwrap();
        assert_eq!(root.getattr("label").unwrap(), Object::from("fixture"));
        let err = root.getattr("hidden").unwrap_err();
        assert!(is_attribute_error(&err));
    }

    #[test]
    fn test_setattr_requires_switch() {
        let fx = fixture(Config::default());
        let root = fx.client.root().unwrap();
        assert!(is_attribute_error(&root.setattr("label", "x").unwrap_err()));

        let fx = fixture(Config {
            allow_setattr: true,
            ..Config::default()
        });
        let root = fx.client.root().unwrap();
        root.setattr("label", "renamed").unwrap();
        assert_eq!(root.getattr("label").unwrap(), Object::from("renamed"));
    }

    #[test]
    fn test_callattr_forwards_keywords() {
        let fx = fixture(Config::default());
        let root = fx.client.root().unwrap();
        let args = Args::empty().with_keyword("flag", true);
        assert_eq!(root.call_method("kw", args).unwrap(), Object::from(true));
        assert_eq!(root.call_method("kw", ()).unwrap(), Object::from("missing"));
        assert_eq!(
            root.call_method("record", Args::new(vec![Object::from("a")]))
                .unwrap(),
            Object::from(1usize)
        );
    }

    #[test]
    fn test_buffiter_and_slicing() {
        let fx = fixture(Config::default());
        let numbers = fx
            .client
            .root()
            .unwrap()
            .call_method("numbers", ())
            .unwrap()
            .into_netref()
            .unwrap();

        let collected: Vec<i64> = numbers
            .iter_chunked(10)
            .unwrap()
            .map(|item| item.unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(collected, (0..25).collect::<Vec<_>>());

        let head = numbers.get_slice(None, Some(3)).unwrap();
        let head: Vec<i64> = head
            .iterate()
            .unwrap()
            .iter()
            .map(|o| o.as_i64().unwrap())
            .collect();
        assert_eq!(head, vec![0, 1, 2]);
    }

    #[test]
    fn test_inspect_distinguishes_classes() {
        let fx = fixture(Config::default());
        let class = fx
            .client
            .root()
            .unwrap()
            .call_method("klass", ())
            .unwrap()
            .into_netref()
            .unwrap();
        assert!(class.is_class());
        assert!(class.has_method("__call__"));
        assert!(!class.has_method("spin"));
    }

    #[test]
    fn test_pickle_disabled_by_default() {
        let fx = fixture(Config::default());
        let err = fx.client.root().unwrap().pickle(4).unwrap_err();
        let exc = err.exception().unwrap();
        assert!(exc.is_instance_of("ValueError"));
        assert_eq!(exc.message(), "pickling is disabled");
    }

    #[test]
    fn test_dir_and_repr() {
        let fx = fixture(Config::default());
        let root = fx.client.root().unwrap();
        let names = root.dir().unwrap();
        assert!(names.contains(&"exposed_numbers".to_string()));
        assert!(root.repr().unwrap().starts_with("<tests.Fixture object at"));
        assert_eq!(fx.client.proxy_count(), 1);
    }

    #[test]
    fn test_bad_arity_is_reported_to_caller() {
        let fx = fixture(Config::default());
        let err = fx
            .client
            .sync_request(Handler::Hash, Vec::new())
            .unwrap_err();
        let exc = err.exception().unwrap();
        assert!(exc.is_instance_of("TypeError"));
        assert!(exc.message().contains("HASH takes 1 arguments"));
        assert!(!fx.client.closed());
    }
}
