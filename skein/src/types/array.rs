use crate::block::{Content, ItemPtr, Prelim, RangePrelim, ID};
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{
    event_change_set, Branch, BranchPtr, Change, ChangeSet, Observable, Path, SharedRef, ToJson,
    TypeRef, Value,
};
use bin0::any::Any;
use std::cell::OnceCell;
use std::collections::{HashSet, VecDeque};
use std::convert::TryFrom;

/// Operations of a shared ordered sequence of values.
pub trait Array: SharedRef {
    /// Number of elements stored in this sequence.
    fn len<T: ReadTxn>(&self, _txn: &T) -> u32 {
        self.as_ref().len()
    }

    /// Insert a single `value` at the given `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the sequence length.
    fn insert<V: Prelim>(&self, txn: &mut TransactionMut, index: u32, value: V) -> Value {
        let ptr = self.as_ref().insert_at(txn, index, value);
        item_value(ptr)
    }

    /// Insert a run of values at the given `index` as one batch.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the sequence length.
    fn insert_range<T: Into<Vec<Any>>>(&self, txn: &mut TransactionMut, index: u32, values: T) {
        self.as_ref()
            .insert_at(txn, index, RangePrelim(values.into()));
    }

    /// Append `value` at the end of the sequence.
    fn push_back<V: Prelim>(&self, txn: &mut TransactionMut, value: V) -> Value {
        let len = self.len(txn);
        self.insert(txn, len, value)
    }

    /// Prepend `value` at the beginning of the sequence.
    fn push_front<V: Prelim>(&self, txn: &mut TransactionMut, value: V) -> Value {
        self.insert(txn, 0, value)
    }

    /// Remove a single element at `index`.
    fn remove(&self, txn: &mut TransactionMut, index: u32) {
        let removed = self.as_ref().remove_at(txn, index, 1);
        if removed != 1 {
            panic!("index {} out of bounds", index);
        }
    }

    /// Remove `len` consecutive elements starting at `index`.
    fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        let removed = self.as_ref().remove_at(txn, index, len);
        if removed != len {
            panic!("range {}..{} out of bounds", index, index + len);
        }
    }

    /// The element stored under `index`.
    fn get<T: ReadTxn>(&self, _txn: &T, index: u32) -> Option<Value> {
        let (content, offset) = self.as_ref().get_at(index)?;
        let values = content.get_content();
        values.into_iter().nth(offset)
    }

    /// Iterator over the elements of this sequence.
    fn iter<'a, T: ReadTxn>(&self, txn: &'a T) -> ArrayIter<'a, T> {
        ArrayIter::new(BranchPtr::from(self.as_ref()), txn)
    }
}

/// A reference to the shared ordered sequence of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRef(BranchPtr);

impl Array for ArrayRef {}

impl SharedRef for ArrayRef {}

impl AsRef<Branch> for ArrayRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for ArrayRef {
    fn from(branch: BranchPtr) -> Self {
        ArrayRef(branch)
    }
}

impl Observable for ArrayRef {
    type Event = ArrayEvent;
}

impl TryFrom<Value> for ArrayRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Array(array) = value {
            Ok(array)
        } else {
            Err(value)
        }
    }
}

impl ToJson for ArrayRef {
    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let values: Vec<Any> = self.iter(txn).map(|value| value.to_json(txn)).collect();
        Any::Array(values.into_boxed_slice())
    }
}

pub struct ArrayIter<'a, T> {
    buf: VecDeque<Value>,
    next: Option<ItemPtr>,
    _txn: &'a T,
}

impl<'a, T: ReadTxn> ArrayIter<'a, T> {
    fn new(branch: BranchPtr, txn: &'a T) -> Self {
        ArrayIter {
            buf: VecDeque::new(),
            next: branch.start,
            _txn: txn,
        }
    }
}

impl<'a, T: ReadTxn> Iterator for ArrayIter<'a, T> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.buf.pop_front() {
                return Some(value);
            }
            let item = self.next?;
            self.next = item.right;
            if !item.is_deleted() && item.is_countable() {
                self.buf.extend(item.content.get_content());
            }
        }
    }
}

fn item_value(ptr: ItemPtr) -> Value {
    ptr.content.get_last().unwrap_or_default()
}

/// A preliminary sequence: a set of values which will become an [ArrayRef]
/// nested inside a shared document once integrated.
#[derive(Debug, Clone, Default)]
pub struct ArrayPrelim(pub Vec<Any>);

impl<T> From<Vec<T>> for ArrayPrelim
where
    T: Into<Any>,
{
    fn from(values: Vec<T>) -> Self {
        ArrayPrelim(values.into_iter().map(|value| value.into()).collect())
    }
}

impl Prelim for ArrayPrelim {
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        (Content::Type(Branch::new(TypeRef::Array)), Some(self))
    }

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr) {
        let array = ArrayRef::from(inner_ref);
        for value in self.0 {
            array.push_back(txn, value);
        }
    }
}

/// Event generated by [ArrayRef::observe] subscriptions.
pub struct ArrayEvent {
    pub(crate) target: BranchPtr,
    pub(crate) current_target: BranchPtr,
    change_set: OnceCell<Box<ChangeSet<Change>>>,
}

impl ArrayEvent {
    pub(crate) fn new(target: BranchPtr) -> Self {
        ArrayEvent {
            target,
            current_target: target,
            change_set: OnceCell::new(),
        }
    }

    /// The shared sequence this event refers to.
    pub fn target(&self) -> ArrayRef {
        ArrayRef::from(self.target)
    }

    /// Path from the root of the document to the changed sequence.
    pub fn path(&self) -> Path {
        Branch::path(self.current_target, self.target)
    }

    /// A run-length delta describing the changes made to the sequence within
    /// the committing transaction.
    pub fn delta(&self, txn: &TransactionMut) -> &[Change] {
        &self.changes(txn).delta
    }

    /// Ids of the items inserted within the committing transaction.
    pub fn added(&self, txn: &TransactionMut) -> &HashSet<ID> {
        &self.changes(txn).added
    }

    /// Ids of the items deleted within the committing transaction.
    pub fn deleted(&self, txn: &TransactionMut) -> &HashSet<ID> {
        &self.changes(txn).deleted
    }

    fn changes(&self, txn: &TransactionMut) -> &ChangeSet<Change> {
        self.change_set
            .get_or_init(|| Box::new(event_change_set(txn, self.target.start)))
    }
}
