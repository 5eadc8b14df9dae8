use crate::struct_store::StructStore;
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{Attrs, Branch, BranchPtr, TypePtr, TypeRef, Value};
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use crate::ClientID;
use bin0::any::Any;
use bin0::binary;
use bin0::error::Error;
use smallstr::SmallString;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// Content reference of a garbage-collected tombstone.
pub const BLOCK_GC_REF: u8 = 0;
/// Content reference of [Content::Deleted].
pub const BLOCK_ITEM_DELETED_REF: u8 = 1;
/// Content reference of [Content::Json].
pub const BLOCK_ITEM_JSON_REF: u8 = 2;
/// Content reference of [Content::Binary].
pub const BLOCK_ITEM_BINARY_REF: u8 = 3;
/// Content reference of [Content::String].
pub const BLOCK_ITEM_STRING_REF: u8 = 4;
/// Content reference of [Content::Embed].
pub const BLOCK_ITEM_EMBED_REF: u8 = 5;
/// Content reference of [Content::Format].
pub const BLOCK_ITEM_FORMAT_REF: u8 = 6;
/// Content reference of [Content::Type].
pub const BLOCK_ITEM_TYPE_REF: u8 = 7;

/// Globally unique identifier of a single logical position produced by a
/// client: a `(client, clock)` pair. An item covering multiple positions
/// consumes that many consecutive clock values starting at its id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ID {
    pub client: ClientID,
    pub clock: u32,
}

impl ID {
    pub const fn new(client: ClientID, clock: u32) -> Self {
        ID { client, clock }
    }
}

impl std::fmt::Display for ID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}#{}>", self.client, self.clock)
    }
}

const ITEM_FLAG_KEEP: u8 = 0b0001;
const ITEM_FLAG_COUNTABLE: u8 = 0b0010;
const ITEM_FLAG_DELETED: u8 = 0b0100;

/// Mutable state bits of an [Item].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ItemFlags(u8);

impl ItemFlags {
    pub fn new(countable: bool) -> Self {
        ItemFlags(if countable { ITEM_FLAG_COUNTABLE } else { 0 })
    }

    #[inline]
    pub fn is_keep(&self) -> bool {
        self.0 & ITEM_FLAG_KEEP != 0
    }

    #[inline]
    pub fn set_keep(&mut self, keep: bool) {
        if keep {
            self.0 |= ITEM_FLAG_KEEP;
        } else {
            self.0 &= !ITEM_FLAG_KEEP;
        }
    }

    #[inline]
    pub fn is_countable(&self) -> bool {
        self.0 & ITEM_FLAG_COUNTABLE != 0
    }

    #[inline]
    pub fn clear_countable(&mut self) {
        self.0 &= !ITEM_FLAG_COUNTABLE;
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.0 & ITEM_FLAG_DELETED != 0
    }

    #[inline]
    pub fn set_deleted(&mut self) {
        self.0 |= ITEM_FLAG_DELETED;
    }
}

/// Raw pointer to an [Item] living inside the struct store. Items are boxed,
/// so the pointer remains stable while the per-client vectors reallocate.
/// Everything that links items together - `left`, `right`, parent maps, list
/// heads - is expressed in terms of these pointers.
#[repr(transparent)]
#[derive(Copy, Clone, Hash)]
pub(crate) struct ItemPtr(NonNull<Item>);

impl ItemPtr {
    #[inline]
    pub fn id(&self) -> &ID {
        &self.deref().id
    }
}

impl PartialEq for ItemPtr {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl Eq for ItemPtr {}

impl Deref for ItemPtr {
    type Target = Item;

    fn deref(&self) -> &Item {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for ItemPtr {
    fn deref_mut(&mut self) -> &mut Item {
        unsafe { self.0.as_mut() }
    }
}

impl<'a> From<&'a Item> for ItemPtr {
    fn from(item: &'a Item) -> Self {
        ItemPtr(unsafe { NonNull::new_unchecked(item as *const Item as *mut Item) })
    }
}

impl<'a> From<&'a mut Item> for ItemPtr {
    fn from(item: &'a mut Item) -> Self {
        ItemPtr(NonNull::from(item))
    }
}

impl<'a> From<&'a Box<Item>> for ItemPtr {
    fn from(item: &'a Box<Item>) -> Self {
        ItemPtr::from(item.as_ref())
    }
}

impl std::fmt::Debug for ItemPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.deref(), f)
    }
}

/// A tombstone covering `start..end` clock values of a single client. It
/// advertises itself as deleted and carries no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GC {
    pub start: u32,
    /// Exclusive end of the covered clock range.
    pub end: u32,
}

impl GC {
    pub fn new(start: u32, len: u32) -> Self {
        GC {
            start,
            end: start + len,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// A slot in a per-client struct vector: either a live (or tombstoned) item
/// or a garbage-collected range.
#[derive(Debug)]
pub(crate) enum BlockCell {
    GC(GC),
    Item(Box<Item>),
}

impl BlockCell {
    pub fn clock_start(&self) -> u32 {
        match self {
            BlockCell::GC(gc) => gc.start,
            BlockCell::Item(item) => item.id.clock,
        }
    }

    /// Exclusive end of the covered clock range.
    pub fn clock_end(&self) -> u32 {
        match self {
            BlockCell::GC(gc) => gc.end,
            BlockCell::Item(item) => item.id.clock + item.len(),
        }
    }

    pub fn len(&self) -> u32 {
        self.clock_end() - self.clock_start()
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            BlockCell::GC(_) => true,
            BlockCell::Item(item) => item.is_deleted(),
        }
    }

    pub fn as_item(&self) -> Option<ItemPtr> {
        match self {
            BlockCell::GC(_) => None,
            BlockCell::Item(item) => Some(ItemPtr::from(item)),
        }
    }

    /// Write this struct entry, skipping the first `offset` clock values.
    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        match self {
            BlockCell::GC(gc) => {
                encoder.write_info(BLOCK_GC_REF);
                encoder.write_len(gc.len() - offset);
            }
            BlockCell::Item(item) => item.encode(encoder, offset),
        }
    }
}

/// A single node of the item graph: a run of consecutive logical positions
/// produced by one client, anchored between the neighbours it observed at
/// creation time.
pub(crate) struct Item {
    pub id: ID,
    /// Id of the last position of the item that was the left neighbour at
    /// creation time. Immutable.
    pub origin: Option<ID>,
    /// Id of the item that was the right neighbour at creation time.
    /// Immutable.
    pub right_origin: Option<ID>,
    /// Current left neighbour within the parent's list.
    pub left: Option<ItemPtr>,
    /// Current right neighbour within the parent's list.
    pub right: Option<ItemPtr>,
    /// The shared type this item lives in.
    pub parent: TypePtr,
    /// For map-like parents, the key this item was inserted under.
    pub parent_sub: Option<Arc<str>>,
    pub content: Content,
    /// Forward-in-time pointer to the item created to redo this one after an
    /// undo. Kept as a stable id because the replacement may split or merge.
    pub redone: Option<ID>,
    pub info: ItemFlags,
}

impl Item {
    pub fn new(
        id: ID,
        left: Option<ItemPtr>,
        origin: Option<ID>,
        right: Option<ItemPtr>,
        right_origin: Option<ID>,
        parent: TypePtr,
        parent_sub: Option<Arc<str>>,
        content: Content,
    ) -> Box<Item> {
        let info = ItemFlags::new(content.is_countable());
        Box::new(Item {
            id,
            origin,
            right_origin,
            left,
            right,
            parent,
            parent_sub,
            content,
            redone: None,
            info,
        })
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.content.len()
    }

    pub fn last_id(&self) -> ID {
        ID::new(self.id.client, self.id.clock + self.len() - 1)
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.info.is_deleted()
    }

    #[inline]
    pub fn is_countable(&self) -> bool {
        self.info.is_countable()
    }

    pub fn mark_as_deleted(&mut self) {
        self.info.set_deleted()
    }

    /// Split this item at `diff` clock values from its start, producing the
    /// right twin wired into the linked list. The caller is responsible for
    /// inserting the twin into the struct vector right after this item.
    pub fn splice(&mut self, diff: u32) -> Option<Box<Item>> {
        if diff == 0 {
            return None;
        }
        let client = self.id.client;
        let clock = self.id.clock;
        let content = self.content.splice(diff as usize)?;
        let mut new = Box::new(Item {
            id: ID::new(client, clock + diff),
            origin: Some(ID::new(client, clock + diff - 1)),
            right_origin: self.right_origin,
            left: Some(ItemPtr::from(&mut *self)),
            right: self.right,
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            content,
            redone: self
                .redone
                .map(|id| ID::new(id.client, id.clock + diff)),
            info: self.info,
        });
        let new_ptr = ItemPtr::from(&new);
        if let Some(mut right) = self.right {
            right.left = Some(new_ptr);
        } else if let Some(sub) = &self.parent_sub {
            // the right twin became the rightmost item of its key
            if let TypePtr::Branch(parent) = &self.parent {
                let mut parent = *parent;
                parent.map.insert(sub.clone(), new_ptr);
            }
        }
        self.right = Some(new_ptr);
        Some(new)
    }

    /// Try to fold `other` - the item directly to the right within the same
    /// client's struct vector - into this one. Mergeable items represent the
    /// same logical content whether kept separate or folded.
    pub fn try_merge(&mut self, other_ptr: ItemPtr) -> bool {
        let other: &Item = &other_ptr;
        if self.id.client == other.id.client
            && self.id.clock + self.len() == other.id.clock
            && other.origin == Some(self.last_id())
            && self.right == Some(other_ptr)
            && self.right_origin == other.right_origin
            && self.is_deleted() == other.is_deleted()
            && self.redone.is_none()
            && other.redone.is_none()
            && self.content.try_merge(&other.content)
        {
            if other.info.is_keep() {
                self.info.set_keep(true);
            }
            self.right = other.right;
            let self_ptr = ItemPtr::from(&mut *self);
            if let Some(mut right) = self.right {
                right.left = Some(self_ptr);
            }
            true
        } else {
            false
        }
    }

    /// Resolve a freshly decoded item against the local store: materialize
    /// `left`/`right` neighbours out of the origins (splitting covering items
    /// when the anchor falls inside one) and resolve the parent reference.
    /// Must only be called once all dependencies are known to be present.
    pub fn repair(&mut self, txn: &mut TransactionMut) {
        let mut gc_neighbour = false;
        if let Some(origin) = self.origin {
            match txn.get_item_clean_end(&origin) {
                Some(left) => {
                    self.origin = Some(left.last_id());
                    self.left = Some(left);
                }
                // anchor was garbage collected together with its parent
                None => gc_neighbour = true,
            }
        }
        if let Some(right_origin) = self.right_origin {
            match txn.get_item_clean_start(&right_origin) {
                Some(right) => {
                    self.right_origin = Some(*right.id());
                    self.right = Some(right);
                }
                None => gc_neighbour = true,
            }
        }
        if gc_neighbour {
            // the surroundings are gone; this item will be integrated as a
            // garbage-collected range
            self.parent = TypePtr::Unknown;
            return;
        }
        match &self.parent {
            TypePtr::Unknown => {
                if let Some(neighbour) = self.right.or(self.left) {
                    self.parent = neighbour.parent.clone();
                    self.parent_sub = neighbour.parent_sub.clone();
                }
            }
            TypePtr::Named(name) => {
                let branch = txn
                    .store_mut()
                    .get_or_create_type(name.clone(), TypeRef::Undefined);
                self.parent = TypePtr::Branch(branch);
            }
            TypePtr::ID(id) => {
                self.parent = match txn.store().blocks.get_item(id) {
                    Some(parent_item) => match &parent_item.content {
                        Content::Type(branch) => TypePtr::Branch(BranchPtr::from(branch)),
                        _ => TypePtr::Unknown,
                    },
                    // the parent has been garbage collected
                    None => TypePtr::Unknown,
                };
            }
            TypePtr::Branch(_) => {}
        }
    }

    /// Write this item as a struct entry, skipping `offset` clock values.
    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        let origin = if offset > 0 {
            Some(ID::new(self.id.client, self.id.clock + offset - 1))
        } else {
            self.origin
        };
        let info = (self.content.ref_number() & binary::BITS5)
            | origin.map_or(0, |_| binary::BIT8)
            | self.right_origin.map_or(0, |_| binary::BIT7)
            | self.parent_sub.as_ref().map_or(0, |_| binary::BIT6);
        encoder.write_info(info);
        if let Some(origin) = origin.as_ref() {
            encoder.write_left_id(origin);
        }
        if let Some(right_origin) = self.right_origin.as_ref() {
            encoder.write_right_id(right_origin);
        }
        if origin.is_none() && self.right_origin.is_none() {
            match &self.parent {
                TypePtr::Branch(branch) => {
                    if let Some(item) = branch.item {
                        encoder.write_parent_info(false);
                        encoder.write_left_id(item.id());
                    } else {
                        encoder.write_parent_info(true);
                        let name = branch
                            .name
                            .as_deref()
                            .expect("unexpected case: root type without a name");
                        encoder.write_key(name);
                    }
                }
                TypePtr::Named(name) => {
                    encoder.write_parent_info(true);
                    encoder.write_key(name);
                }
                TypePtr::ID(id) => {
                    encoder.write_parent_info(false);
                    encoder.write_left_id(id);
                }
                TypePtr::Unknown => {
                    panic!("unexpected case: cannot encode an item with unresolved parent")
                }
            }
            if let Some(parent_sub) = self.parent_sub.as_deref() {
                encoder.write_key(parent_sub);
            }
        }
        self.content.encode(encoder, offset);
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.id)?;
        if let Some(origin) = self.origin.as_ref() {
            write!(f, ", origin: {}", origin)?;
        }
        if let Some(right_origin) = self.right_origin.as_ref() {
            write!(f, ", right origin: {}", right_origin)?;
        }
        if let Some(sub) = self.parent_sub.as_deref() {
            write!(f, ", key: '{}'", sub)?;
        }
        if self.is_deleted() {
            write!(f, ", deleted")?;
        }
        write!(f, ": {})", self.content)
    }
}

impl ItemPtr {
    /// Integrate this item into the document graph using the conflict
    /// resolution algorithm: scan right from the seeded position, advancing
    /// past concurrent items which are either produced by lower client ids
    /// anchored at the same origin, or causally bound to land before this
    /// item's cluster. Both decision sets only depend on causally earlier
    /// items, so every peer resolves the same order.
    ///
    /// `offset` is non-zero only when a remote item partially overlaps with
    /// already known state; the known prefix is skipped.
    pub(crate) fn integrate(&mut self, txn: &mut TransactionMut, offset: u32) {
        let self_ptr = *self;
        let this: &mut Item = unsafe { &mut *self.0.as_ptr() };
        if offset > 0 {
            this.id.clock += offset;
            let left = txn
                .get_item_clean_end(&ID::new(this.id.client, this.id.clock - 1))
                .expect("unexpected case: item overlaps local state but has no left twin");
            this.origin = Some(left.last_id());
            this.left = Some(left);
            this.content = this
                .content
                .splice(offset as usize)
                .expect("unexpected case: content of a partially known item is not splittable");
        }
        let mut parent_ref = match &this.parent {
            TypePtr::Branch(branch) => *branch,
            _ => panic!("unexpected case: item integrated without a resolved parent"),
        };

        let detect_conflict = (this.left.is_none()
            && this.right.map_or(true, |r| r.left.is_some()))
            || this.left.map_or(false, |l| l.right != this.right);
        if detect_conflict {
            let mut left = this.left;
            let mut o = if let Some(l) = left {
                l.right
            } else if let Some(sub) = &this.parent_sub {
                let mut o = parent_ref.map.get(sub).cloned();
                while let Some(item) = o {
                    if item.left.is_none() {
                        break;
                    }
                    o = item.left;
                }
                o
            } else {
                parent_ref.start
            };
            let mut items_before_origin: HashSet<ItemPtr> = HashSet::new();
            let mut conflicting_items: HashSet<ItemPtr> = HashSet::new();
            while let Some(item) = o {
                if Some(item) == this.right {
                    break;
                }
                items_before_origin.insert(item);
                conflicting_items.insert(item);
                if this.origin == item.origin {
                    // same origin: the lower client id goes further left
                    if item.id.client < this.id.client {
                        left = Some(item);
                        conflicting_items.clear();
                    } else if this.right_origin == item.right_origin {
                        // identical anchors: fates are tied, order is settled
                        break;
                    }
                } else {
                    let origin_ptr = item
                        .origin
                        .as_ref()
                        .and_then(|id| txn.store().blocks.get_item(id));
                    match origin_ptr {
                        Some(origin) if items_before_origin.contains(&origin) => {
                            if !conflicting_items.contains(&origin) {
                                left = Some(item);
                                conflicting_items.clear();
                            }
                        }
                        _ => break,
                    }
                }
                o = item.right;
            }
            this.left = left;
        }

        // splice into the linked list
        if let Some(mut left) = this.left {
            this.right = left.right;
            left.right = Some(self_ptr);
        } else {
            let right = if let Some(sub) = &this.parent_sub {
                let mut right = parent_ref.map.get(sub).cloned();
                while let Some(item) = right {
                    if item.left.is_none() {
                        break;
                    }
                    right = item.left;
                }
                right
            } else {
                let start = parent_ref.start;
                parent_ref.start = Some(self_ptr);
                start
            };
            this.right = right;
        }
        if let Some(mut right) = this.right {
            right.left = Some(self_ptr);
        } else if let Some(sub) = &this.parent_sub {
            // this became the current value of its key
            parent_ref.map.insert(sub.clone(), self_ptr);
            if let Some(left) = this.left {
                // the previous value has been overwritten
                txn.delete(left);
            }
        }

        if this.parent_sub.is_none() && this.is_countable() && !this.is_deleted() {
            parent_ref.block_len += this.len();
        }

        // content hooks
        match &this.content {
            Content::Deleted(len) => {
                txn.delete_set.insert(this.id, *len);
                this.info.set_deleted();
            }
            Content::Type(branch) => {
                let mut inner = BranchPtr::from(branch);
                inner.item = Some(self_ptr);
                txn.store_mut().register(inner);
            }
            _ => {}
        }

        txn.add_changed_type(parent_ref, this.parent_sub.clone());
        let parent_deleted = parent_ref.item.map_or(false, |item| item.is_deleted());
        if parent_deleted || (this.parent_sub.is_some() && this.right.is_some()) {
            // either the parent is gone or a map entry lost to a newer value
            txn.delete(self_ptr);
        }
    }

    /// Free the payload of a deleted item. Children of a deleted nested type
    /// are replaced by [GC] ranges wholesale; the item itself keeps its shell
    /// (so the surrounding linked list stays intact) unless its own parent
    /// was collected too.
    pub(crate) fn gc(self, store: &mut StructStore, parent_gcd: bool) {
        let this: &mut Item = unsafe { &mut *self.0.as_ptr() };
        if !this.is_deleted() {
            panic!("unexpected case: garbage collecting an undeleted item");
        }
        let id = this.id;
        let len = this.len();
        if let Content::Type(branch) = &this.content {
            let mut inner = BranchPtr::from(branch);
            let mut curr = inner.start;
            while let Some(child) = curr {
                let next = child.right;
                child.gc(store, true);
                curr = next;
            }
            inner.start = None;
            let entries: Vec<ItemPtr> = inner.map.values().cloned().collect();
            for entry in entries {
                let mut curr = Some(entry);
                while let Some(child) = curr {
                    let prev = child.left;
                    child.gc(store, true);
                    curr = prev;
                }
            }
            inner.map.clear();
        }
        if parent_gcd {
            store.replace_with_gc(&id);
        } else {
            this.content = Content::Deleted(len);
            this.info.clear_countable();
        }
    }
}

/// Payload of an item. Each variant knows its logical length, whether its
/// positions are countable, how to split and merge, and how to serialize.
pub enum Content {
    /// Tombstoned content of `len` positions whose payload was dropped.
    Deleted(u32),
    /// A run of user-supplied cells.
    Json(Vec<Any>),
    /// An opaque binary blob, occupying a single position.
    Binary(Vec<u8>),
    /// A chunk of text.
    String(SplittableString),
    /// An embedded object inside a text sequence, occupying one position.
    Embed(Box<Any>),
    /// A zero-width marker toggling an inline formatting attribute.
    Format { key: Arc<str>, value: Box<Any> },
    /// A nested shared type.
    Type(Arc<Branch>),
}

impl Content {
    pub fn len(&self) -> u32 {
        match self {
            Content::Deleted(len) => *len,
            Content::Json(values) => values.len() as u32,
            Content::String(str) => str.len(),
            Content::Binary(_) | Content::Embed(_) | Content::Format { .. } | Content::Type(_) => 1,
        }
    }

    pub fn is_countable(&self) -> bool {
        match self {
            Content::Deleted(_) | Content::Format { .. } => false,
            _ => true,
        }
    }

    pub fn ref_number(&self) -> u8 {
        match self {
            Content::Deleted(_) => BLOCK_ITEM_DELETED_REF,
            Content::Json(_) => BLOCK_ITEM_JSON_REF,
            Content::Binary(_) => BLOCK_ITEM_BINARY_REF,
            Content::String(_) => BLOCK_ITEM_STRING_REF,
            Content::Embed(_) => BLOCK_ITEM_EMBED_REF,
            Content::Format { .. } => BLOCK_ITEM_FORMAT_REF,
            Content::Type(_) => BLOCK_ITEM_TYPE_REF,
        }
    }

    /// Split off the content covering everything from `offset` onwards,
    /// leaving the prefix in place. Returns `None` for single-position
    /// variants, which can never be split.
    pub fn splice(&mut self, offset: usize) -> Option<Content> {
        match self {
            Content::Deleted(len) => {
                let right = Content::Deleted(*len - offset as u32);
                *len = offset as u32;
                Some(right)
            }
            Content::Json(values) => {
                let right = values.split_off(offset);
                Some(Content::Json(right))
            }
            Content::String(str) => Some(Content::String(str.split_off(offset))),
            _ => None,
        }
    }

    /// Fold `other` into self if the pair represents a contiguous run of the
    /// same kind. Binary blobs are never merged - merging is required to be
    /// sound, not complete.
    pub fn try_merge(&mut self, other: &Content) -> bool {
        match (self, other) {
            (Content::Deleted(len), Content::Deleted(other_len)) => {
                *len += other_len;
                true
            }
            (Content::Json(values), Content::Json(other_values)) => {
                values.extend_from_slice(other_values);
                true
            }
            (Content::String(str), Content::String(other_str)) => {
                str.push_str(other_str.as_str());
                true
            }
            _ => false,
        }
    }

    /// Materialized values of every position covered by this content.
    pub fn get_content(&self) -> Vec<Value> {
        match self {
            Content::Json(values) => values.iter().map(|any| Value::Any(any.clone())).collect(),
            Content::Binary(buf) => vec![Value::Any(Any::Buffer(buf.clone().into_boxed_slice()))],
            Content::String(str) => str
                .as_str()
                .chars()
                .map(|c| Value::Any(Any::String(c.to_string().into_boxed_str())))
                .collect(),
            Content::Embed(any) => vec![Value::Any(any.as_ref().clone())],
            Content::Type(branch) => vec![BranchPtr::from(branch).into()],
            Content::Deleted(_) | Content::Format { .. } => Vec::new(),
        }
    }

    /// The value of the last position - for map entries, the current value.
    pub fn get_last(&self) -> Option<Value> {
        match self {
            Content::Json(values) => values.last().map(|any| Value::Any(any.clone())),
            Content::Binary(buf) => Some(Value::Any(Any::Buffer(buf.clone().into_boxed_slice()))),
            Content::String(str) => Some(Value::Any(Any::String(str.as_str().into()))),
            Content::Embed(any) => Some(Value::Any(any.as_ref().clone())),
            Content::Type(branch) => Some(BranchPtr::from(branch).into()),
            Content::Deleted(_) | Content::Format { .. } => None,
        }
    }

    /// A structural copy used when redoing a formerly deleted item. Nested
    /// types are copied as empty shells of the same kind - their children are
    /// redone item by item.
    pub fn copy(&self) -> Content {
        match self {
            Content::Deleted(len) => Content::Deleted(*len),
            Content::Json(values) => Content::Json(values.clone()),
            Content::Binary(buf) => Content::Binary(buf.clone()),
            Content::String(str) => Content::String(str.clone()),
            Content::Embed(any) => Content::Embed(any.clone()),
            Content::Format { key, value } => Content::Format {
                key: key.clone(),
                value: value.clone(),
            },
            Content::Type(branch) => Content::Type(Branch::new(branch.type_ref().clone())),
        }
    }

    pub fn encode<E: Encoder>(&self, encoder: &mut E, offset: u32) {
        match self {
            Content::Deleted(len) => encoder.write_len(*len - offset),
            Content::Json(values) => {
                encoder.write_len(values.len() as u32 - offset);
                for value in &values[offset as usize..] {
                    encoder.write_json(value);
                }
            }
            Content::Binary(buf) => encoder.write_buf(buf),
            Content::String(str) => {
                if offset == 0 {
                    encoder.write_string(str.as_str());
                } else {
                    encoder.write_string(str.tail(offset as usize));
                }
            }
            Content::Embed(any) => encoder.write_json(any),
            Content::Format { key, value } => {
                encoder.write_key(key);
                encoder.write_json(value);
            }
            Content::Type(branch) => branch.type_ref().encode(encoder),
        }
    }

    pub fn decode<D: Decoder>(decoder: &mut D, ref_number: u8) -> Result<Self, Error> {
        match ref_number {
            BLOCK_ITEM_DELETED_REF => Ok(Content::Deleted(decoder.read_len()?)),
            BLOCK_ITEM_JSON_REF => {
                let len = decoder.read_len()?;
                let mut values = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    values.push(decoder.read_json()?);
                }
                Ok(Content::Json(values))
            }
            BLOCK_ITEM_BINARY_REF => Ok(Content::Binary(decoder.read_buf()?.to_vec())),
            BLOCK_ITEM_STRING_REF => Ok(Content::String(decoder.read_string()?.into())),
            BLOCK_ITEM_EMBED_REF => Ok(Content::Embed(Box::new(decoder.read_json()?))),
            BLOCK_ITEM_FORMAT_REF => Ok(Content::Format {
                key: decoder.read_key()?,
                value: Box::new(decoder.read_json()?),
            }),
            BLOCK_ITEM_TYPE_REF => {
                let type_ref = TypeRef::decode(decoder)?;
                Ok(Content::Type(Branch::new(type_ref)))
            }
            other => Err(Error::UnexpectedValue(other)),
        }
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Deleted(len) => write!(f, "deleted({})", len),
            Content::Json(values) => {
                write!(f, "[")?;
                let mut iter = values.iter();
                if let Some(value) = iter.next() {
                    write!(f, "{}", value)?;
                }
                for value in iter {
                    write!(f, ", {}", value)?;
                }
                write!(f, "]")
            }
            Content::Binary(buf) => write!(f, "binary({} bytes)", buf.len()),
            Content::String(str) => write!(f, "'{}'", str.as_str()),
            Content::Embed(any) => write!(f, "embed({})", any),
            Content::Format { key, value } => write!(f, "<{}={}>", key, value),
            Content::Type(branch) => write!(f, "{}", branch),
        }
    }
}

/// Text content with logical positions counted in unicode scalar values.
/// Kept inline for short chunks, which dominate real editing traces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplittableString {
    content: SmallString<[u8; 8]>,
}

impl SplittableString {
    /// Length in unicode scalar values.
    pub fn len(&self) -> u32 {
        self.content.as_str().chars().count() as u32
    }

    pub fn as_str(&self) -> &str {
        self.content.as_str()
    }

    pub fn push_str(&mut self, str: &str) {
        self.content.push_str(str);
    }

    fn byte_offset(&self, char_offset: usize) -> usize {
        self.content
            .as_str()
            .char_indices()
            .nth(char_offset)
            .map(|(pos, _)| pos)
            .unwrap_or_else(|| self.content.len())
    }

    /// Everything from the given character offset onwards.
    pub fn tail(&self, char_offset: usize) -> &str {
        &self.content.as_str()[self.byte_offset(char_offset)..]
    }

    /// Split at a character offset, truncating self to the prefix.
    pub fn split_off(&mut self, char_offset: usize) -> SplittableString {
        let at = self.byte_offset(char_offset);
        let right = SmallString::from_str(&self.content.as_str()[at..]);
        self.content.truncate(at);
        SplittableString { content: right }
    }
}

impl<'a> From<&'a str> for SplittableString {
    fn from(str: &'a str) -> Self {
        SplittableString {
            content: SmallString::from_str(str),
        }
    }
}

impl From<String> for SplittableString {
    fn from(str: String) -> Self {
        SplittableString {
            content: SmallString::from_string(str),
        }
    }
}

/// A not-yet-integrated value, convertible into item content. Complex types
/// (preliminary arrays, maps, texts) split integration in two: the shell is
/// integrated as [Content::Type] first, then [Prelim::integrate] fills it.
pub trait Prelim: Sized {
    fn into_content(self, txn: &mut TransactionMut) -> (Content, Option<Self>);

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr);
}

impl<T> Prelim for T
where
    T: Into<Any>,
{
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        let value: Any = self.into();
        let content = match value {
            Any::Buffer(buf) => Content::Binary(buf.into_vec()),
            other => Content::Json(vec![other]),
        };
        (content, None)
    }

    fn integrate(self, _txn: &mut TransactionMut, _inner_ref: BranchPtr) {}
}

/// Inserts a run of cells as a single multi-position item.
pub(crate) struct RangePrelim(pub Vec<Any>);

impl Prelim for RangePrelim {
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        (Content::Json(self.0), None)
    }

    fn integrate(self, _txn: &mut TransactionMut, _inner_ref: BranchPtr) {}
}

/// A cursor between two items of a list-like parent, tracking the formatting
/// attributes accumulated while walking towards it.
pub(crate) struct ItemPosition {
    pub parent: TypePtr,
    pub left: Option<ItemPtr>,
    pub right: Option<ItemPtr>,
    pub index: u32,
    pub current_attrs: Option<Box<Attrs>>,
}

impl ItemPosition {
    /// Move the cursor one item to the right, folding formatting markers into
    /// the running attribute set. Returns false at the end of the list.
    pub fn forward(&mut self) -> bool {
        if let Some(right) = self.right {
            if !right.is_deleted() {
                match &right.content {
                    Content::Format { key, value } => {
                        let attrs = self
                            .current_attrs
                            .get_or_insert_with(|| Box::new(Attrs::new()));
                        update_current_attributes(attrs, key, value);
                    }
                    _ => {
                        if right.is_countable() {
                            self.index += right.len();
                        }
                    }
                }
            }
            self.left = Some(right);
            self.right = right.right;
            true
        } else {
            false
        }
    }
}

/// Fold a formatting marker into a running attribute set. A null value
/// removes the attribute.
pub(crate) fn update_current_attributes(attrs: &mut Attrs, key: &Arc<str>, value: &Any) {
    if *value == Any::Null {
        attrs.remove(key);
    } else {
        attrs.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splittable_string_counts_scalar_values() {
        let str = SplittableString::from("zażółć");
        assert_eq!(str.len(), 6);
        let mut left = str.clone();
        let right = left.split_off(2);
        assert_eq!(left.as_str(), "za");
        assert_eq!(right.as_str(), "żółć");
        assert_eq!(right.len(), 4);
    }

    #[test]
    fn content_split_and_merge_roundtrip() {
        let mut content = Content::Json(vec![Any::from(1.0), Any::from(2.0), Any::from(3.0)]);
        let right = content.splice(1).unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(right.len(), 2);
        assert!(content.try_merge(&right));
        assert_eq!(content.len(), 3);
    }

    #[test]
    fn deleted_content_splits_by_length() {
        let mut content = Content::Deleted(10);
        let right = content.splice(4).unwrap();
        assert_eq!(content.len(), 4);
        assert_eq!(right.len(), 6);
    }

    #[test]
    fn binary_content_does_not_merge() {
        let mut left = Content::Binary(vec![1, 2]);
        let right = Content::Binary(vec![3]);
        assert!(!left.try_merge(&right));
    }

    #[test]
    fn format_content_is_not_countable() {
        let format = Content::Format {
            key: "bold".into(),
            value: Box::new(Any::Bool(true)),
        };
        assert!(!format.is_countable());
        assert_eq!(format.len(), 1);
        let deleted = Content::Deleted(3);
        assert!(!deleted.is_countable());
        let string = Content::String("ab".into());
        assert!(string.is_countable());
    }
}
