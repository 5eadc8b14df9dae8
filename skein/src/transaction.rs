use crate::block::{Content, Item, ItemPosition, ItemPtr, Prelim, ID};
use crate::id_set::DeleteSet;
use crate::store::Store;
use crate::struct_store::{ClientStructList, StateVector};
use crate::types::{BranchPtr, Event, Events, TypePtr};
use crate::update::Update;
use crate::updates::encoder::{Encode, Encoder, EncoderV1};
use crate::ClientID;
use atomic_refcell::{AtomicRef, AtomicRefMut};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An arbitrary tag attached to a transaction by its initiator. Origins are
/// compared by value; they are commonly used to distinguish local edits from
/// specific remote providers, and to scope undo capture.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Origin(Arc<[u8]>);

impl Origin {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Origin {
    fn from(value: &[u8]) -> Self {
        Origin(value.into())
    }
}

impl From<&str> for Origin {
    fn from(value: &str) -> Self {
        Origin(value.as_bytes().into())
    }
}

impl From<String> for Origin {
    fn from(value: String) -> Self {
        Origin(value.as_bytes().into())
    }
}

impl From<u32> for Origin {
    fn from(value: u32) -> Self {
        Origin(value.to_be_bytes().as_ref().into())
    }
}

impl From<i64> for Origin {
    fn from(value: i64) -> Self {
        Origin(value.to_be_bytes().as_ref().into())
    }
}

impl From<usize> for Origin {
    fn from(value: usize) -> Self {
        Origin(value.to_be_bytes().as_ref().into())
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(str) => write!(f, "Origin('{}')", str),
            Err(_) => write!(f, "Origin({:?})", &self.0),
        }
    }
}

/// Read-only access to a document's state, shared by [Transaction] and
/// [TransactionMut].
pub trait ReadTxn {
    #[doc(hidden)]
    fn store(&self) -> &Store;

    /// State vector of the document: for every known client, the next clock
    /// value expected from it.
    fn state_vector(&self) -> StateVector {
        self.store().blocks.get_state_vector()
    }

    /// Encode the local state vector into its binary form.
    fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_to_vec()
    }

    /// Encode all changes a peer described by `sv` has not seen yet,
    /// followed by the full delete set. Applying the result on that peer
    /// brings it in sync with this document.
    fn encode_state_as_update(&self, sv: &StateVector) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        self.store().encode_diff(sv, &mut encoder);
        encoder.to_vec()
    }
}

/// A read-only snapshot of a document. Many read transactions may be alive
/// at the same time, but they exclude a read-write transaction.
pub struct Transaction<'doc> {
    store: AtomicRef<'doc, Store>,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(store: AtomicRef<'doc, Store>) -> Self {
        Transaction { store }
    }
}

impl<'doc> ReadTxn for Transaction<'doc> {
    fn store(&self) -> &Store {
        &self.store
    }
}

/// A read-write transaction: the only context in which a document can be
/// mutated. All changes made through it are bundled and take their
/// observable effect at commit, which runs automatically when the
/// transaction is dropped.
pub struct TransactionMut<'doc> {
    pub(crate) store: AtomicRefMut<'doc, Store>,
    /// State vector at the moment this transaction was opened.
    pub(crate) before_state: StateVector,
    /// State vector at commit; filled during the close sequence.
    pub(crate) after_state: StateVector,
    /// Ranges deleted within the scope of this transaction.
    pub(crate) delete_set: DeleteSet,
    /// Directly modified types, with the set of changed map keys (or `None`
    /// for sequence changes).
    pub(crate) changed: HashMap<BranchPtr, HashSet<Option<Arc<str>>>>,
    /// Every type whose subtree changed; filled during the close sequence
    /// and consumed by deep observers and the undo manager.
    pub(crate) changed_parent_types: Vec<BranchPtr>,
    /// Ids of blocks created by splits, revisited by the merge pass.
    pub(crate) merge_blocks: SmallVec<[ID; 4]>,
    origin: Option<Origin>,
    committed: bool,
}

impl<'doc> ReadTxn for TransactionMut<'doc> {
    fn store(&self) -> &Store {
        &self.store
    }
}

impl<'doc> Drop for TransactionMut<'doc> {
    fn drop(&mut self) {
        self.commit()
    }
}

impl<'doc> TransactionMut<'doc> {
    pub(crate) fn new(store: AtomicRefMut<'doc, Store>, origin: Option<Origin>) -> Self {
        let before_state = store.blocks.get_state_vector();
        TransactionMut {
            store,
            before_state,
            after_state: StateVector::default(),
            delete_set: DeleteSet::new(),
            changed: HashMap::default(),
            changed_parent_types: Vec::default(),
            merge_blocks: SmallVec::new(),
            origin,
            committed: false,
        }
    }

    /// The tag this transaction was opened with.
    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// True when `id` was produced within the scope of this transaction.
    pub(crate) fn has_added(&self, id: &ID) -> bool {
        id.clock >= self.before_state.get(&id.client)
    }

    /// True when `id` was deleted within the scope of this transaction.
    pub(crate) fn has_deleted(&self, id: &ID) -> bool {
        self.delete_set.is_deleted(id)
    }

    /// Encode the changes bundled by this transaction: every struct created
    /// within it plus its delete set. Emitted on the update stream at commit.
    pub fn encode_update(&self) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        self.store.write_blocks_from(&self.before_state, &mut encoder);
        self.delete_set.encode(&mut encoder);
        encoder.to_vec()
    }

    /// Record `parent` (and the changed key) for observer dispatch, but only
    /// when the parent itself was alive before this transaction: freshly
    /// created types surface through their own insertion event.
    pub(crate) fn add_changed_type(&mut self, parent: BranchPtr, parent_sub: Option<Arc<str>>) {
        let trigger = match parent.item {
            None => true,
            Some(item) => {
                item.id.clock < self.before_state.get(&item.id.client) && !item.is_deleted()
            }
        };
        if trigger {
            self.changed.entry(parent).or_default().insert(parent_sub);
        }
    }

    /// Split the item behind `ptr` at `offset`, remembering the twin as a
    /// merge candidate for the cleanup pass.
    pub(crate) fn split(&mut self, ptr: ItemPtr, offset: u32) -> Option<ItemPtr> {
        let right = self.store.blocks.split_block(ptr, offset)?;
        self.merge_blocks.push(*right.id());
        Some(right)
    }

    /// The item starting exactly at `id`, splitting the covering item when
    /// `id` falls inside one. `None` when the id is unknown or its range was
    /// garbage collected.
    pub(crate) fn get_item_clean_start(&mut self, id: &ID) -> Option<ItemPtr> {
        let item = self.store.blocks.get_item(id)?;
        if item.id().clock == id.clock {
            Some(item)
        } else {
            self.split(item, id.clock - item.id().clock)
        }
    }

    /// The item ending exactly at `id` (inclusive), splitting when needed.
    pub(crate) fn get_item_clean_end(&mut self, id: &ID) -> Option<ItemPtr> {
        let item = self.store.blocks.get_item(id)?;
        if item.id().clock + item.len() - 1 != id.clock {
            self.split(item, id.clock - item.id().clock + 1);
        }
        Some(item)
    }

    /// Delete the item: mark it tombstoned, record the range in the delete
    /// set, adjust the parent length and recursively delete the contents of
    /// nested types. Returns false when the item was already deleted.
    pub(crate) fn delete(&mut self, ptr: ItemPtr) -> bool {
        let mut item = ptr;
        if item.is_deleted() {
            return false;
        }
        if item.parent_sub.is_none() && item.is_countable() {
            if let TypePtr::Branch(mut parent) = item.parent.clone() {
                parent.block_len -= item.len();
            }
        }
        item.mark_as_deleted();
        self.delete_set.insert(item.id, item.len());
        if let TypePtr::Branch(parent) = item.parent.clone() {
            self.add_changed_type(parent, item.parent_sub.clone());
        }
        if let Content::Type(branch) = &item.content {
            let branch_ptr = BranchPtr::from(branch);
            self.store.deregister(&branch_ptr);
            let mut child = branch_ptr.start;
            while let Some(c) = child {
                child = c.right;
                if !c.is_deleted() {
                    self.delete(c);
                }
            }
            let entries: Vec<ItemPtr> = branch_ptr.map.values().cloned().collect();
            for entry in entries {
                if !entry.is_deleted() {
                    self.delete(entry);
                }
            }
        }
        true
    }

    /// Allocate and integrate a new item at the given position. The item
    /// consumes the next clock values of the local client.
    pub(crate) fn create_item<T: Prelim>(
        &mut self,
        pos: &ItemPosition,
        value: T,
        parent_sub: Option<Arc<str>>,
    ) -> ItemPtr {
        let (content, remainder) = value.into_content(self);
        let inner_ref = if let Content::Type(branch) = &content {
            Some(BranchPtr::from(branch))
        } else {
            None
        };
        let block_ptr = self.create_item_with_content(pos, content, parent_sub);
        if let Some(remainder) = remainder {
            remainder.integrate(self, inner_ref.unwrap());
        }
        block_ptr
    }

    /// Allocate and integrate a new item carrying already materialized
    /// content.
    pub(crate) fn create_item_with_content(
        &mut self,
        pos: &ItemPosition,
        content: Content,
        parent_sub: Option<Arc<str>>,
    ) -> ItemPtr {
        let left = pos.left;
        let right = pos.right;
        let origin = left.map(|ptr| ptr.last_id());
        let right_origin = right.map(|ptr| *ptr.id());
        let client_id = self.store.options.client_id;
        let id = ID::new(client_id, self.store.blocks.get_clock(&client_id));
        let block = Item::new(
            id,
            left,
            origin,
            right,
            right_origin,
            pos.parent.clone(),
            parent_sub,
            content,
        );
        let mut block_ptr = ItemPtr::from(&block);
        block_ptr.integrate(self, 0);
        self.store.blocks.push_item(block);
        block_ptr
    }

    /// Apply a decoded remote update. Structs whose dependencies are missing
    /// are parked in the pending queue and revisited whenever new updates
    /// land; delete ranges beyond the known state are parked likewise.
    pub fn apply_update(&mut self, update: Update) {
        let (remaining, remaining_ds) = update.integrate(self);

        let mut retry = false;
        match self.store.pending.take() {
            Some(mut pending) => {
                // check if the new update unlocked any of the parked structs
                for (client, &clock) in pending.missing.iter() {
                    if clock < self.store.blocks.get_clock(client) {
                        retry = true;
                        break;
                    }
                }
                if let Some(remaining) = remaining {
                    for (&client, &clock) in remaining.missing.iter() {
                        pending.missing.set_min(client, clock);
                    }
                    pending.update.merge(remaining.update);
                }
                self.store.pending = Some(pending);
            }
            None => {
                self.store.pending = remaining;
            }
        }

        let pending_ds = self.store.pending_ds.take();
        let mut merged_ds = remaining_ds;
        if let Some(pending_ds) = pending_ds {
            let unapplied = self.apply_delete(&pending_ds);
            merged_ds = match (merged_ds, unapplied) {
                (Some(mut a), Some(b)) => {
                    a.merge(b);
                    Some(a)
                }
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
        }
        self.store.pending_ds = merged_ds;

        if retry {
            if let Some(pending) = self.store.pending.take() {
                let mut update = pending.update;
                if let Some(ds) = self.store.pending_ds.take() {
                    update.delete_set.merge(ds);
                }
                self.apply_update(update);
            }
        }
    }

    /// Apply a remote delete set, clamping it to the locally known state.
    /// Returns the part which could not be applied yet.
    pub(crate) fn apply_delete(&mut self, ds: &DeleteSet) -> Option<DeleteSet> {
        let mut unapplied = DeleteSet::new();
        for (client, ranges) in ds.iter() {
            let client = *client;
            let state = self.store.blocks.get_clock(&client);
            for range in ranges.iter() {
                let clock = range.start;
                let clock_end = range.end;
                if clock < state {
                    if state < clock_end {
                        unapplied.insert(ID::new(client, state), clock_end - state);
                    }
                    let end = clock_end.min(state);
                    let mut current = clock;
                    while current < end {
                        let cell = match self.store.blocks.get(&ID::new(client, current)) {
                            Some(cell) => (cell.as_item(), cell.clock_end()),
                            None => break,
                        };
                        match cell.0 {
                            Some(item) if !item.is_deleted() => {
                                let mut target = item;
                                if target.id().clock < current {
                                    target = match self.get_item_clean_start(&ID::new(client, current))
                                    {
                                        Some(target) => target,
                                        None => break,
                                    };
                                }
                                if target.id().clock + target.len() > end {
                                    self.split(target, end - target.id().clock);
                                }
                                current += target.len();
                                self.delete(target);
                            }
                            _ => {
                                // tombstones and gc ranges are already deleted
                                current = cell.1;
                            }
                        }
                    }
                } else {
                    unapplied.insert(ID::new(client, clock), clock_end - clock);
                }
            }
        }
        if unapplied.is_empty() {
            None
        } else {
            unapplied.squash();
            Some(unapplied)
        }
    }

    /// Visit every item overlapping `clock..clock+len` of `client`, splitting
    /// at both boundaries so that visited items lie fully inside the range.
    /// Garbage-collected ranges are skipped.
    pub(crate) fn iterate_range<F>(&mut self, client: ClientID, clock: u32, len: u32, f: &mut F)
    where
        F: FnMut(&mut TransactionMut, ItemPtr),
    {
        if len == 0 {
            return;
        }
        let end = clock + len;
        let mut current = clock;
        while current < end {
            let advance;
            let found = self.get_item_clean_start(&ID::new(client, current));
            match found {
                Some(item) => {
                    if item.id().clock + item.len() > end {
                        self.split(item, end - item.id().clock);
                    }
                    advance = item.len();
                    f(self, item);
                }
                None => match self.store.blocks.get(&ID::new(client, current)) {
                    Some(cell) => advance = cell.clock_end() - current,
                    None => return,
                },
            }
            current += advance;
        }
    }

    /// Commit this transaction, running the close sequence: squash the
    /// delete set, fill the after state, fire shallow and deep observers,
    /// garbage collect, merge adjacent structs, and emit document events.
    /// Called automatically on drop.
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        // 1. squash the delete set
        self.delete_set.squash();
        // 2. fill the after state
        self.after_state = self.store.blocks.get_state_vector();

        // 3. fire shallow observers, skipping deleted types
        let changed = std::mem::take(&mut self.changed);
        let mut events: Vec<Event> = Vec::with_capacity(changed.len());
        for (ptr, subs) in changed {
            if self.store.is_alive(&ptr) {
                if let Some(event) = ptr.trigger(self, subs) {
                    events.push(event);
                }
            }
        }

        // 4. bubble events up to every ancestor; fire deep observers with a
        // top-down ordered batch per ancestor
        if !events.is_empty() {
            let mut deep_events: HashMap<BranchPtr, Vec<&Event>> = HashMap::new();
            for event in events.iter() {
                let mut current = event.target_ptr();
                loop {
                    if !self.changed_parent_types.contains(&current) {
                        self.changed_parent_types.push(current);
                    }
                    if current.deep_observers.has_subscribers() {
                        deep_events.entry(current).or_default().push(event);
                    }
                    match current.item.and_then(|item| item.parent.as_branch().cloned()) {
                        Some(parent) => current = parent,
                        None => break,
                    }
                }
            }
            for (branch, mut batch) in deep_events {
                for event in batch.iter() {
                    let mut ptr = unsafe {
                        std::ptr::NonNull::new_unchecked(*event as *const Event as *mut Event)
                    };
                    unsafe { ptr.as_mut() }.set_current_target(branch);
                }
                let batch = Events::new(&mut batch);
                branch.trigger_deep(self, &batch);
            }
        }
        drop(events);

        // 5. notify document listeners before the payloads are collected
        if let Some(store_events) = self.store.events.as_deref() {
            store_events.emit_after_transaction(self);
        }

        // 6. garbage collect the delete set
        if !self.store.options.skip_gc {
            self.try_gc();
        }

        // 7. merge structs touched by this transaction
        self.try_merge_blocks();

        // 8.-9. cleanup notification and the update stream
        if let Some(store_events) = self.store.events.as_deref() {
            store_events.emit_transaction_cleanup(self);
            store_events.emit_update(self);
        }
    }

    /// Replace the payload of deleted, non-pinned items with bare tombstones.
    fn try_gc(&mut self) {
        let ds = self.delete_set.clone();
        for (client, ranges) in ds.iter() {
            for range in ranges.iter() {
                let mut index = {
                    let blocks = match self.store.blocks.get_client(client) {
                        Some(blocks) => blocks,
                        None => continue,
                    };
                    match blocks.find_pivot(range.start) {
                        Some(index) => index,
                        None => continue,
                    }
                };
                loop {
                    let item = {
                        let blocks = self.store.blocks.get_client(client).unwrap();
                        if index >= blocks.len() {
                            break;
                        }
                        let cell = &blocks[index];
                        if cell.clock_start() >= range.end {
                            break;
                        }
                        cell.as_item()
                    };
                    if let Some(item) = item {
                        if item.is_deleted() && !item.info.is_keep() {
                            item.gc(&mut self.store.blocks, false);
                        }
                    }
                    index += 1;
                }
            }
        }
    }

    fn try_merge_blocks(&mut self) {
        // merge everything written by this transaction, right to left
        let after = self.after_state.clone();
        for (client, &clock) in after.iter() {
            let before_clock = self.before_state.get(client);
            if before_clock == clock {
                continue;
            }
            if let Some(blocks) = self.store.blocks.get_client_mut(client) {
                let first_change = blocks.find_pivot(before_clock).unwrap_or(0).max(1);
                let mut i = blocks.len() - 1;
                while i >= first_change {
                    Self::try_merge_with_left(blocks, i);
                    i -= 1;
                }
            }
        }
        // merge tombstones covered by the delete set
        let ds = self.delete_set.clone();
        for (client, ranges) in ds.iter() {
            for range in ranges.iter().rev() {
                let blocks = match self.store.blocks.get_client_mut(client) {
                    Some(blocks) => blocks,
                    None => continue,
                };
                let pivot = match blocks.find_pivot(range.end - 1) {
                    Some(pivot) => pivot,
                    None => continue,
                };
                // start one struct right of the last deleted one
                let mut si = (pivot + 1).min(blocks.len() - 1);
                while si > 0 && blocks[si].clock_start() >= range.start {
                    Self::try_merge_with_left(blocks, si);
                    si -= 1;
                }
            }
        }
        // revisit blocks produced by splits
        let merge_blocks = std::mem::take(&mut self.merge_blocks);
        for id in merge_blocks {
            if let Some(blocks) = self.store.blocks.get_client_mut(&id.client) {
                if let Some(pos) = blocks.find_pivot(id.clock) {
                    if pos + 1 < blocks.len() {
                        Self::try_merge_with_left(blocks, pos + 1);
                    }
                    if pos > 0 {
                        Self::try_merge_with_left(blocks, pos);
                    }
                }
            }
        }
    }

    fn try_merge_with_left(blocks: &mut ClientStructList, index: usize) -> bool {
        use crate::block::BlockCell;
        if index == 0 || index >= blocks.len() {
            return false;
        }
        match (&blocks[index - 1], &blocks[index]) {
            (BlockCell::GC(_), BlockCell::GC(gc)) => {
                let end = gc.end;
                if let BlockCell::GC(left) = &mut blocks[index - 1] {
                    left.end = end;
                }
                blocks.remove(index);
                true
            }
            (BlockCell::Item(_), BlockCell::Item(_)) => {
                let right_ptr = blocks[index].as_item().unwrap();
                let mut left_ptr = blocks[index - 1].as_item().unwrap();
                if left_ptr.try_merge(right_ptr) {
                    // repair the parent map when it pointed at the merged-in
                    // right half
                    if let Some(sub) = right_ptr.parent_sub.clone() {
                        if let TypePtr::Branch(mut parent) = right_ptr.parent.clone() {
                            if parent.map.get(&sub) == Some(&right_ptr) {
                                parent.map.insert(sub, left_ptr);
                            }
                        }
                    }
                    blocks.remove(index);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}
