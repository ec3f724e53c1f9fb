//! Boxing: how objects cross the connection.
//!
//! Values travel as copies, tuples item by item, and everything else as a
//! reference. A reference to one of the receiver's own objects travels back
//! as a local reference so the receiver gets the original, not a proxy of a
//! proxy.

use super::{bump, Connection};
use crate::error::{Result, TetherError};
use crate::locks::lock;
use crate::netref::{Netref, NetrefClass};
use crate::object::{servant_id_pack, IdPack, Object};
use crate::protocol::{BoxLabel, Handler};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::trace;

fn labelled(label: BoxLabel, data: Value) -> Value {
    Value::tuple([Value::from(label as i64), data])
}

/// Whether a boxed payload is a plain value, i.e. unboxing it needs no
/// connection state.
pub(super) fn is_value_box(boxed: &Value) -> bool {
    boxed
        .as_tuple()
        .and_then(|items| items.first())
        .and_then(Value::as_i64)
        == Some(BoxLabel::Value as i64)
}

impl Connection {
    pub(super) fn box_object(&self, obj: &Object) -> Result<Value> {
        let id_pack = match obj {
            Object::Value(value) => return Ok(labelled(BoxLabel::Value, value.clone())),
            Object::Tuple(items) => {
                let mut boxed = Vec::with_capacity(items.len());
                for item in items {
                    match self.box_object(item) {
                        Ok(b) => boxed.push(b),
                        Err(e) => {
                            boxed.iter().for_each(|b| self.release_boxed(b));
                            return Err(e);
                        }
                    }
                }
                return Ok(labelled(BoxLabel::Tuple, Value::Tuple(boxed)));
            }
            Object::Netref(netref) if netref.belongs_to(self) => {
                return Ok(labelled(BoxLabel::LocalRef, netref.id_pack().to_value()));
            }
            Object::Netref(netref) => netref.reexport_id_pack(),
            Object::Servant(servant) => servant_id_pack(servant),
        };
        let data = id_pack.to_value();
        self.inner.local_objects.add(id_pack, obj.clone());
        bump(&self.inner.stats.proxies_sent);
        Ok(labelled(BoxLabel::Proxy, data))
    }

    /// Undo the references `box_object` registered for a payload that never
    /// reached the peer.
    pub(super) fn release_boxed(&self, boxed: &Value) {
        let Some([label, data]) = boxed.as_tuple() else {
            return;
        };
        match label.as_i64().and_then(BoxLabel::from_code) {
            Some(BoxLabel::Tuple) => {
                for item in data.as_tuple().unwrap_or_default() {
                    self.release_boxed(item);
                }
            }
            Some(BoxLabel::Proxy) => {
                if let Ok(id_pack) = IdPack::from_value(data) {
                    let released = self.inner.local_objects.decref(&id_pack, 1);
                    drop(released);
                }
            }
            _ => {}
        }
    }

    pub(super) fn unbox(&self, boxed: &Value) -> Result<Object> {
        let invalid = || TetherError::Protocol(format!("invalid box: {}", boxed.repr()));
        let [label, data] = boxed.as_tuple().ok_or_else(invalid)? else {
            return Err(invalid());
        };
        let label = label
            .as_i64()
            .and_then(BoxLabel::from_code)
            .ok_or_else(invalid)?;
        match label {
            BoxLabel::Value => Ok(Object::Value(data.clone())),
            BoxLabel::Tuple => {
                let items = data
                    .as_tuple()
                    .ok_or_else(invalid)?
                    .iter()
                    .map(|item| self.unbox(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Object::tuple(items))
            }
            BoxLabel::LocalRef => {
                let id_pack = IdPack::from_value(data)?;
                self.inner
                    .local_objects
                    .get(&id_pack)
                    .ok_or(TetherError::StaleReference(id_pack))
            }
            BoxLabel::Proxy => {
                let id_pack = IdPack::from_value(data)?;
                self.proxy_for(id_pack).map(Object::Netref)
            }
        }
    }

    /// The netref for a peer object, reusing the live one if there is one.
    fn proxy_for(&self, id_pack: IdPack) -> Result<Netref> {
        bump(&self.inner.stats.proxies_received);
        let cached = lock(&self.inner.proxies)
            .get(&id_pack)
            .and_then(Weak::upgrade);
        if let Some(inner) = cached {
            let netref = Netref::from_inner(inner);
            netref.inc_refcount();
            return Ok(netref);
        }

        let class = match self.netref_class(&id_pack) {
            Ok(class) => class,
            Err(e) => {
                // The peer counted this reference; hand it back
                if !self.closed() {
                    let release = vec![Object::from(id_pack.to_value()), Object::from(1u64)];
                    if let Err(del_err) = self.send_oneway(Handler::Del, release) {
                        trace!(connid = %self.connid(), error = %del_err, "Failed to release reference");
                    }
                }
                return Err(e);
            }
        };

        let mut proxies = lock(&self.inner.proxies);
        if let Some(inner) = proxies.get(&id_pack).and_then(Weak::upgrade) {
            let netref = Netref::from_inner(inner);
            netref.inc_refcount();
            return Ok(netref);
        }
        let netref = Netref::new(self.clone(), id_pack.clone(), class);
        proxies.insert(id_pack, netref.downgrade());
        Ok(netref)
    }

    fn netref_class(&self, id_pack: &IdPack) -> Result<Arc<NetrefClass>> {
        let key = (id_pack.type_name.clone(), id_pack.class_id, id_pack.is_class());
        let cached = lock(&self.inner.classes).get(&key).cloned();
        if let Some(class) = cached {
            return Ok(class);
        }
        if !id_pack.is_class() {
            if let Some(class) = NetrefClass::builtin(&id_pack.type_name) {
                return Ok(class);
            }
        }
        let methods = self.inspect(id_pack)?;
        let class = Arc::new(NetrefClass::new(&id_pack.type_name, &methods));
        Ok(lock(&self.inner.classes).entry(key).or_insert(class).clone())
    }

    /// Ask the peer for the method table of a remote object.
    fn inspect(&self, id_pack: &IdPack) -> Result<BTreeMap<String, Option<String>>> {
        let reply = self
            .sync_request(Handler::Inspect, vec![Object::from(id_pack.to_value())])?
            .into_value()?;
        let invalid = || TetherError::Protocol(format!("invalid INSPECT reply: {}", reply.repr()));
        reply
            .as_tuple()
            .ok_or_else(invalid)?
            .iter()
            .map(|entry| match entry.as_tuple() {
                Some([name, doc]) => {
                    let name = name.as_str().ok_or_else(invalid)?;
                    Ok((name.to_string(), doc.as_str().map(str::to_string)))
                }
                _ => Err(invalid()),
            })
            .collect()
    }
}
