use crate::block::{ItemPosition, ItemPtr, Prelim};
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{
    event_keys, Branch, BranchPtr, Entries, EntryChange, Observable, Path, SharedRef, ToJson,
    Value,
};
use bin0::any::Any;
use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;

/// Operations of a shared keyed mapping. Every key points at the most recent
/// value inserted under it; concurrent writes to the same key converge to the
/// one made by the highest-ordered peer.
pub trait Map: SharedRef {
    /// Number of undeleted entries.
    fn len<T: ReadTxn>(&self, _txn: &T) -> u32 {
        let mut len = 0;
        for item in self.as_ref().map.values() {
            if !item.is_deleted() {
                len += 1;
            }
        }
        len
    }

    /// Insert `value` under `key`. A previous value stored under the same
    /// key is overwritten (and tombstoned).
    fn insert<K: Into<Arc<str>>, V: Prelim>(&self, txn: &mut TransactionMut, key: K, value: V) {
        let key = key.into();
        let branch = BranchPtr::from(self.as_ref());
        let pos = ItemPosition {
            parent: branch.into(),
            left: branch.map.get(&key).cloned(),
            right: None,
            index: 0,
            current_attrs: None,
        };
        txn.create_item(&pos, value, Some(key));
    }

    /// Remove the entry under `key`, returning its value when one existed.
    fn remove(&self, txn: &mut TransactionMut, key: &str) -> Option<Value> {
        self.as_ref().remove(txn, key)
    }

    /// The current value under `key`.
    fn get<T: ReadTxn>(&self, _txn: &T, key: &str) -> Option<Value> {
        self.as_ref().get(key)
    }

    fn contains_key<T: ReadTxn>(&self, _txn: &T, key: &str) -> bool {
        match self.as_ref().map.get(key) {
            Some(item) => !item.is_deleted(),
            None => false,
        }
    }

    /// Remove every entry of this map.
    fn clear(&self, txn: &mut TransactionMut) {
        let entries: Vec<ItemPtr> = self.as_ref().map.values().cloned().collect();
        for item in entries {
            if !item.is_deleted() {
                txn.delete(item);
            }
        }
    }

    /// Iterator over the `(key, value)` entries.
    fn iter<'a, T: ReadTxn>(&'a self, txn: &'a T) -> MapIter<'a, T> {
        MapIter {
            entries: self.as_ref().entries(),
            _txn: txn,
        }
    }

    /// Iterator over the keys holding undeleted values.
    fn keys<'a, T: ReadTxn>(&'a self, txn: &'a T) -> Keys<'a, T> {
        Keys(self.iter(txn))
    }
}

/// A reference to the shared keyed mapping of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef(BranchPtr);

impl Map for MapRef {}

impl SharedRef for MapRef {}

impl AsRef<Branch> for MapRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for MapRef {
    fn from(branch: BranchPtr) -> Self {
        MapRef(branch)
    }
}

impl Observable for MapRef {
    type Event = MapEvent;
}

impl TryFrom<Value> for MapRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Map(map) = value {
            Ok(map)
        } else {
            Err(value)
        }
    }
}

impl ToJson for MapRef {
    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let mut entries = HashMap::new();
        for (key, value) in self.iter(txn) {
            entries.insert(key.to_string(), value.to_json(txn));
        }
        Any::Map(Box::new(entries))
    }
}

pub struct MapIter<'a, T> {
    entries: Entries<'a>,
    _txn: &'a T,
}

impl<'a, T: ReadTxn> Iterator for MapIter<'a, T> {
    type Item = (&'a str, Value);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, item) = self.entries.next()?;
        let value = item.content.get_last().unwrap_or_default();
        Some((key.as_ref(), value))
    }
}

pub struct Keys<'a, T>(MapIter<'a, T>);

impl<'a, T: ReadTxn> Iterator for Keys<'a, T> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, _) = self.0.next()?;
        Some(key)
    }
}

/// A preliminary map: a set of entries which will become a [MapRef] nested
/// inside a shared document once integrated.
#[derive(Debug, Clone, Default)]
pub struct MapPrelim(pub HashMap<Arc<str>, Any>);

impl<K, V> From<HashMap<K, V>> for MapPrelim
where
    K: Into<Arc<str>>,
    V: Into<Any>,
{
    fn from(entries: HashMap<K, V>) -> Self {
        MapPrelim(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl Prelim for MapPrelim {
    fn into_content(
        self,
        _txn: &mut TransactionMut,
    ) -> (crate::block::Content, Option<Self>) {
        (
            crate::block::Content::Type(Branch::new(crate::types::TypeRef::Map)),
            Some(self),
        )
    }

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr) {
        let map = MapRef::from(inner_ref);
        for (key, value) in self.0 {
            map.insert(txn, key, value);
        }
    }
}

/// Event generated by [MapRef::observe] subscriptions.
pub struct MapEvent {
    pub(crate) target: BranchPtr,
    pub(crate) current_target: BranchPtr,
    keys_changed: HashSet<Option<Arc<str>>>,
    keys: OnceCell<HashMap<Arc<str>, EntryChange>>,
}

impl MapEvent {
    pub(crate) fn new(target: BranchPtr, keys_changed: HashSet<Option<Arc<str>>>) -> Self {
        MapEvent {
            target,
            current_target: target,
            keys_changed,
            keys: OnceCell::new(),
        }
    }

    /// The shared map this event refers to.
    pub fn target(&self) -> MapRef {
        MapRef::from(self.target)
    }

    /// Path from the root of the document to the changed map.
    pub fn path(&self) -> Path {
        Branch::path(self.current_target, self.target)
    }

    /// Summary of the entries changed within the committing transaction.
    pub fn keys(&self, txn: &TransactionMut) -> &HashMap<Arc<str>, EntryChange> {
        self.keys
            .get_or_init(|| event_keys(txn, self.target, &self.keys_changed))
    }
}
