use crate::block::ID;
use crate::transaction::ReadTxn;
use crate::types::{Branch, BranchPtr, Value};
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use bin0::error::Error;
use std::sync::Arc;

const SCOPE_ITEM: u8 = 0;
const SCOPE_ROOT: u8 = 1;
const SCOPE_NESTED: u8 = 2;

/// Which side of the referenced position a sticky index is glued to: an
/// [Assoc::After] index stays attached to the element on its left, an
/// [Assoc::Before] index to the element on its right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    After,
    Before,
}

/// The anchor of a [StickyIndex]: either a concrete logical position, or the
/// boundary of a (root or nested) type for indexes pointing at the very
/// start or end of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexScope {
    /// A single logical position, identified permanently.
    Relative(ID),
    /// Boundary of a nested type, identified by the item holding it.
    Nested(ID),
    /// Boundary of a root type, identified by name.
    Root(Arc<str>),
}

/// A permanent reference to a logical cursor position within a sequence.
/// Unlike a plain index, it keeps pointing between the same two elements as
/// concurrent edits shift their absolute positions around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyIndex {
    pub(crate) scope: IndexScope,
    pub assoc: Assoc,
}

impl StickyIndex {
    pub fn new(scope: IndexScope, assoc: Assoc) -> Self {
        StickyIndex { scope, assoc }
    }

    /// Creates a sticky reference to the position currently addressed by
    /// `index` within the sequence component of `shared`.
    pub fn at<T: ReadTxn, S: AsRef<Branch>>(
        _txn: &T,
        shared: &S,
        index: u32,
        assoc: Assoc,
    ) -> StickyIndex {
        let branch = BranchPtr::from(shared.as_ref());
        let anchor = match assoc {
            Assoc::After => {
                if index == 0 {
                    None
                } else {
                    Self::item_id_at(branch, index - 1)
                }
            }
            Assoc::Before => Self::item_id_at(branch, index),
        };
        match anchor {
            Some(id) => StickyIndex::new(IndexScope::Relative(id), assoc),
            None => StickyIndex::new(Self::type_scope(branch), assoc),
        }
    }

    fn item_id_at(branch: BranchPtr, mut index: u32) -> Option<ID> {
        let mut current = branch.start;
        while let Some(item) = current {
            if !item.is_deleted() && item.is_countable() {
                if index < item.len() {
                    return Some(ID::new(item.id.client, item.id.clock + index));
                }
                index -= item.len();
            }
            current = item.right;
        }
        None
    }

    fn type_scope(branch: BranchPtr) -> IndexScope {
        match branch.item {
            Some(item) => IndexScope::Nested(item.id),
            None => IndexScope::Root(
                branch
                    .name
                    .clone()
                    .expect("unexpected case: root type without a name"),
            ),
        }
    }

    /// Resolves the current absolute position of this reference: the shared
    /// type it lives in and the offset within it, counting only visible
    /// elements. Returns `None` when the referenced position or its whole
    /// type is no longer known.
    pub fn get_offset<T: ReadTxn>(&self, txn: &T) -> Option<(Value, u32)> {
        let store = txn.store();
        match &self.scope {
            IndexScope::Relative(id) => {
                let item = store.blocks.get_item(id)?;
                let parent = *item.parent.as_branch()?;
                if !store.is_alive(&parent) {
                    return None;
                }
                let mut offset = 0u32;
                let mut current = parent.start;
                while let Some(i) = current {
                    if i == item {
                        break;
                    }
                    if !i.is_deleted() && i.is_countable() {
                        offset += i.len();
                    }
                    current = i.right;
                }
                if !item.is_deleted() && item.is_countable() {
                    offset += id.clock - item.id.clock;
                    if self.assoc == Assoc::After {
                        offset += 1;
                    }
                }
                Some((parent.into(), offset))
            }
            IndexScope::Nested(id) => {
                let item = store.blocks.get_item(id)?;
                if item.is_deleted() {
                    return None;
                }
                let branch = match &item.content {
                    crate::block::Content::Type(branch) => BranchPtr::from(branch),
                    _ => return None,
                };
                Some(Self::boundary(branch, self.assoc))
            }
            IndexScope::Root(name) => {
                let branch = store.get_type(name.as_ref())?;
                Some(Self::boundary(branch, self.assoc))
            }
        }
    }

    fn boundary(branch: BranchPtr, assoc: Assoc) -> (Value, u32) {
        let offset = match assoc {
            Assoc::After => 0,
            Assoc::Before => branch.len(),
        };
        (branch.into(), offset)
    }
}

impl Encode for StickyIndex {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match &self.scope {
            IndexScope::Relative(id) => {
                encoder.write_u8(SCOPE_ITEM);
                encoder.write_left_id(id);
            }
            IndexScope::Root(name) => {
                encoder.write_u8(SCOPE_ROOT);
                encoder.write_key(name);
            }
            IndexScope::Nested(id) => {
                encoder.write_u8(SCOPE_NESTED);
                encoder.write_left_id(id);
            }
        }
        encoder.write_u8(match self.assoc {
            Assoc::After => 0,
            Assoc::Before => 1,
        });
    }
}

impl Decode for StickyIndex {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error> {
        let scope = match decoder.read_u8()? {
            SCOPE_ITEM => IndexScope::Relative(decoder.read_left_id()?),
            SCOPE_ROOT => IndexScope::Root(decoder.read_key()?),
            SCOPE_NESTED => IndexScope::Nested(decoder.read_left_id()?),
            other => return Err(Error::UnexpectedValue(other)),
        };
        let assoc = match decoder.read_u8()? {
            0 => Assoc::After,
            1 => Assoc::Before,
            other => return Err(Error::UnexpectedValue(other)),
        };
        Ok(StickyIndex::new(scope, assoc))
    }
}
