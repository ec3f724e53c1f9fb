//! Refcounted table of local objects the peer holds references to.

use crate::locks::lock;
use crate::object::{IdPack, Object};
use std::collections::HashMap;
use std::sync::Mutex;

/// Local objects keyed by id-pack, each with the number of times it has been
/// sent to the peer and not yet released.
///
/// Removed objects are handed back to the caller so they are dropped outside
/// the table lock (a servant's drop may release netrefs of its own).
#[derive(Default)]
pub(crate) struct LocalObjects {
    entries: Mutex<HashMap<IdPack, (Object, u64)>>,
}

impl LocalObjects {
    /// Register one more reference held by the peer.
    pub(crate) fn add(&self, id_pack: IdPack, obj: Object) {
        lock(&self.entries)
            .entry(id_pack)
            .and_modify(|(_, count)| *count += 1)
            .or_insert((obj, 1));
    }

    pub(crate) fn get(&self, id_pack: &IdPack) -> Option<Object> {
        lock(&self.entries).get(id_pack).map(|(obj, _)| obj.clone())
    }

    pub(crate) fn refcount(&self, id_pack: &IdPack) -> Option<u64> {
        lock(&self.entries).get(id_pack).map(|(_, count)| *count)
    }

    /// Release `count` references. Unknown ids are ignored; an entry whose
    /// count reaches zero is removed and returned.
    pub(crate) fn decref(&self, id_pack: &IdPack, count: u64) -> Option<Object> {
        let mut entries = lock(&self.entries);
        let remaining = {
            let (_, refs) = entries.get_mut(id_pack)?;
            *refs = refs.saturating_sub(count);
            *refs
        };
        if remaining == 0 {
            entries.remove(id_pack).map(|(obj, _)| obj)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Empty the table, returning everything it held.
    pub(crate) fn clear(&self) -> Vec<Object> {
        lock(&self.entries)
            .drain()
            .map(|(_, (obj, _))| obj)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(n: u64) -> IdPack {
        IdPack::new("builtins.list", 1, n)
    }

    #[test]
    fn test_refcount_balance() {
        let table = LocalObjects::default();
        table.add(pack(1), Object::from(1));
        table.add(pack(1), Object::from(1));
        assert_eq!(table.refcount(&pack(1)), Some(2));

        assert!(table.decref(&pack(1), 1).is_none());
        assert_eq!(table.refcount(&pack(1)), Some(1));
        assert_eq!(table.decref(&pack(1), 1), Some(Object::from(1)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_out_of_order_and_oversized_release() {
        let table = LocalObjects::default();
        assert!(table.decref(&pack(9), 3).is_none());

        table.add(pack(2), Object::from("x"));
        assert!(table.decref(&pack(2), 5).is_some());
        assert!(table.get(&pack(2)).is_none());
    }

    #[test]
    fn test_clear_returns_objects() {
        let table = LocalObjects::default();
        table.add(pack(1), Object::from(1));
        table.add(pack(2), Object::from(2));
        assert_eq!(table.clear().len(), 2);
        assert_eq!(table.len(), 0);
    }
}
