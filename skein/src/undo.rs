use crate::block::{Content, Item, ItemPtr, ID};
use crate::doc::Doc;
use crate::id_set::DeleteSet;
use crate::observer::{Observer, Subscription};
use crate::store::Store;
use crate::transaction::{Origin, ReadTxn, TransactionMut};
use crate::types::{Branch, BranchPtr, TypePtr};
use atomic_refcell::AtomicRefCell;
use bin0::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration of an [UndoManager].
#[derive(Debug, Clone)]
pub struct Options {
    /// Consecutive captured transactions closer to each other than this
    /// timeout are coalesced into a single undo step.
    pub capture_timeout: Duration,
    /// Additional transaction origins to capture. Untagged transactions and
    /// the manager's own undo/redo transactions are always captured.
    pub tracked_origins: HashSet<Origin>,
    /// When set, a map entry overwritten by a remote peer is reclaimed by
    /// undo instead of conceding to the remote value.
    pub ignore_remote_map_changes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            capture_timeout: Duration::from_millis(500),
            tracked_origins: HashSet::new(),
            ignore_remote_map_changes: false,
        }
    }
}

/// A single undoable step: the summary of one or more coalesced transactions.
pub struct StackItem {
    /// Ranges deleted by the captured transactions.
    deletions: DeleteSet,
    /// First clock value produced by the captured transactions.
    start: u32,
    /// Number of clock values produced by the captured transactions.
    len: u32,
    /// Arbitrary metadata attached by `stack-item-added` observers (e.g. a
    /// cursor position to restore).
    pub meta: Arc<AtomicRefCell<HashMap<Arc<str>, Any>>>,
}

impl StackItem {
    fn new(deletions: DeleteSet, start: u32, len: u32) -> Self {
        StackItem {
            deletions,
            start,
            len,
            meta: Arc::new(AtomicRefCell::new(HashMap::new())),
        }
    }

    pub fn deletions(&self) -> &DeleteSet {
        &self.deletions
    }

    fn contains_insertion(&self, client: crate::ClientID, id: &ID) -> bool {
        id.client == client && id.clock >= self.start && id.clock < self.start + self.len
    }
}

impl Clone for StackItem {
    fn clone(&self) -> Self {
        StackItem {
            deletions: self.deletions.clone(),
            start: self.start,
            len: self.len,
            meta: self.meta.clone(),
        }
    }
}

impl std::fmt::Debug for StackItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StackItem({}..{})", self.start, self.start + self.len)
    }
}

struct UndoState {
    scope: Vec<BranchPtr>,
    options: Options,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    undoing: bool,
    redoing: bool,
    last_change: Option<Instant>,
    observer_added: Observer<StackItem>,
    observer_popped: Observer<StackItem>,
}

/// Tracks transactions affecting a set of shared roots and turns them into
/// undoable steps by inverting their effect, while preserving the intent of
/// concurrent remote changes.
pub struct UndoManager {
    doc: Doc,
    state: Arc<AtomicRefCell<UndoState>>,
    origin: Origin,
    _sub: Subscription,
}

impl UndoManager {
    /// Creates an undo manager scoped to the subtree of a single shared
    /// root, capturing untagged local transactions.
    pub fn new<T: AsRef<Branch>>(doc: &Doc, scope: &T) -> Self {
        Self::with_options(doc, scope, Options::default())
    }

    pub fn with_options<T: AsRef<Branch>>(doc: &Doc, scope: &T, options: Options) -> Self {
        let state = Arc::new(AtomicRefCell::new(UndoState {
            scope: vec![BranchPtr::from(scope.as_ref())],
            options,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            undoing: false,
            redoing: false,
            last_change: None,
            observer_added: Observer::default(),
            observer_popped: Observer::default(),
        }));
        let origin = Origin::from(Arc::as_ptr(&state) as usize);
        let sub = {
            let state = state.clone();
            let origin = origin.clone();
            doc.observe_after_transaction(move |txn, _event| {
                Self::handle_after_transaction(&state, &origin, txn);
            })
        };
        UndoManager {
            doc: doc.clone(),
            state,
            origin,
            _sub: sub,
        }
    }

    /// Extend the tracked scope by another shared root.
    pub fn expand_scope<T: AsRef<Branch>>(&self, scope: &T) {
        let mut state = self.state.borrow_mut();
        let branch = BranchPtr::from(scope.as_ref());
        if !state.scope.contains(&branch) {
            state.scope.push(branch);
        }
    }

    /// Capture transactions tagged with `origin` in addition to the
    /// untagged ones.
    pub fn include_origin<O: Into<Origin>>(&self, origin: O) {
        let mut state = self.state.borrow_mut();
        state.options.tracked_origins.insert(origin.into());
    }

    pub fn can_undo(&self) -> bool {
        !self.state.borrow().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.borrow().redo_stack.is_empty()
    }

    /// Close the currently coalescing undo step: the next captured
    /// transaction starts a fresh one.
    pub fn reset(&self) {
        self.state.borrow_mut().last_change = None;
    }

    /// Drop both stacks, unpinning every item they kept alive.
    pub fn clear(&mut self) {
        let items: Vec<StackItem> = {
            let mut state = self.state.borrow_mut();
            let mut items: Vec<StackItem> = state.undo_stack.drain(..).collect();
            items.extend(state.redo_stack.drain(..));
            items
        };
        let txn = self.doc.transact();
        for item in items {
            release_stack_item(txn.store(), &item);
        }
    }

    /// Subscribe a callback fired whenever a new stack item is pushed;
    /// callers commonly attach metadata (like selections) to the item here.
    pub fn observe_item_added<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &StackItem) -> () + 'static,
    {
        self.state.borrow().observer_added.subscribe(f)
    }

    /// Subscribe a callback fired whenever a stack item has been applied.
    pub fn observe_item_popped<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &StackItem) -> () + 'static,
    {
        self.state.borrow().observer_popped.subscribe(f)
    }

    /// Undo the most recent captured step. Returns false when there was
    /// nothing (applicable) to undo.
    pub fn undo(&mut self) -> bool {
        self.state.borrow_mut().undoing = true;
        let result = self.pop(true);
        self.state.borrow_mut().undoing = false;
        result
    }

    /// Redo the most recently undone step. Returns false when there was
    /// nothing (applicable) to redo.
    pub fn redo(&mut self) -> bool {
        self.state.borrow_mut().redoing = true;
        let result = self.pop(false);
        self.state.borrow_mut().redoing = false;
        result
    }

    fn pop(&mut self, undo: bool) -> bool {
        loop {
            let item = {
                let mut state = self.state.borrow_mut();
                if undo {
                    state.undo_stack.pop()
                } else {
                    state.redo_stack.pop()
                }
            };
            let item = match item {
                Some(item) => item,
                None => return false,
            };
            let (scope, ignore_remote_map_changes) = {
                let state = self.state.borrow();
                (state.scope.clone(), state.options.ignore_remote_map_changes)
            };
            let performed = {
                let mut txn = self.doc.transact_mut_with(self.origin.clone());
                let performed =
                    Self::pop_stack_item(&mut txn, &scope, &item, ignore_remote_map_changes);
                if performed {
                    let callbacks = self.state.borrow().observer_popped.callbacks();
                    if let Some(callbacks) = callbacks {
                        for f in callbacks {
                            f(&txn, &item);
                        }
                    }
                }
                txn.commit();
                performed
            };
            if performed {
                return true;
            }
        }
    }

    fn handle_after_transaction(
        state_ref: &Arc<AtomicRefCell<UndoState>>,
        manager_origin: &Origin,
        txn: &TransactionMut,
    ) {
        let snapshot = {
            let mut state = state_ref.borrow_mut();
            if !state
                .scope
                .iter()
                .any(|branch| txn.changed_parent_types.contains(branch))
            {
                return;
            }
            let tracked = match txn.origin() {
                None => true,
                Some(origin) => {
                    origin == manager_origin || state.options.tracked_origins.contains(origin)
                }
            };
            if !tracked {
                return;
            }
            let undoing = state.undoing;
            let redoing = state.redoing;
            let client = txn.store().options.client_id;
            let start = txn.before_state.get(&client);
            let len = txn.after_state.get(&client) - start;

            if undoing {
                // the next undo step must not coalesce with this one
                state.last_change = None;
            } else if !redoing {
                // a fresh local change invalidates the redo stack
                let dropped: Vec<StackItem> = state.redo_stack.drain(..).collect();
                for item in dropped {
                    release_stack_item(txn.store(), &item);
                }
            }

            let now = Instant::now();
            let coalesce = !undoing
                && !redoing
                && match state.last_change {
                    Some(last) => now.duration_since(last) < state.options.capture_timeout,
                    None => false,
                };
            let timeout_stamp = !undoing && !redoing;
            let stack = if undoing {
                &mut state.redo_stack
            } else {
                &mut state.undo_stack
            };
            let mut added = false;
            if coalesce && !stack.is_empty() {
                let last = stack.last_mut().unwrap();
                last.deletions.merge(txn.delete_set.clone());
                last.len = (start + len) - last.start;
            } else {
                stack.push(StackItem::new(txn.delete_set.clone(), start, len));
                added = true;
            }
            let snapshot = stack.last().unwrap().clone();
            if timeout_stamp {
                state.last_change = Some(now);
            }

            // pin the deleted items under the tracked scope so that the
            // garbage collector leaves their payloads in place
            let scope = state.scope.clone();
            iterate_deleted_items(txn.store(), &txn.delete_set, &mut |item| {
                if scope.iter().any(|branch| branch.is_parent_of(Some(item))) {
                    keep_item(item, true);
                }
            });

            if added {
                Some(snapshot)
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            let callbacks = state_ref.borrow().observer_added.callbacks();
            if let Some(callbacks) = callbacks {
                for f in callbacks {
                    f(txn, &snapshot);
                }
            }
        }
    }

    fn pop_stack_item(
        txn: &mut TransactionMut,
        scope: &[BranchPtr],
        item: &StackItem,
        ignore_remote_map_changes: bool,
    ) -> bool {
        let mut performed = false;
        let client = txn.store().options.client_id;

        // resurrect the items deleted by the captured transactions
        let mut to_redo: HashSet<ItemPtr> = HashSet::new();
        let deletions = item.deletions.clone();
        for (del_client, ranges) in deletions.iter() {
            for range in ranges.iter() {
                txn.iterate_range(
                    *del_client,
                    range.start,
                    range.end - range.start,
                    &mut |txn, struct_ptr| {
                        let mut ptr = struct_ptr;
                        if !scope.iter().any(|branch| branch.is_parent_of(Some(ptr))) {
                            return;
                        }
                        if ptr.redone.is_some() {
                            let (found, diff) = txn.store().follow_redone(&ptr.id);
                            match found {
                                Some(mut current) => {
                                    if diff > 0 {
                                        current = match txn.get_item_clean_start(&ID::new(
                                            current.id.client,
                                            current.id.clock + diff,
                                        )) {
                                            Some(current) => current,
                                            None => return,
                                        };
                                    }
                                    ptr = current;
                                }
                                None => return,
                            }
                        }
                        to_redo.insert(ptr);
                    },
                );
            }
        }
        for &ptr in to_redo.iter() {
            let redone =
                Self::redo_item(txn, ptr, &to_redo, item, ignore_remote_map_changes).is_some();
            performed = redone || performed;
        }

        // delete the items inserted by the captured transactions
        let mut to_delete: Vec<ItemPtr> = Vec::new();
        txn.iterate_range(client, item.start, item.len, &mut |txn, struct_ptr| {
            let mut ptr = struct_ptr;
            if ptr.redone.is_some() {
                let (found, diff) = txn.store().follow_redone(&ptr.id);
                match found {
                    Some(mut current) => {
                        if diff > 0 {
                            current = match txn.get_item_clean_start(&ID::new(
                                current.id.client,
                                current.id.clock + diff,
                            )) {
                                Some(current) => current,
                                None => return,
                            };
                        }
                        ptr = current;
                    }
                    None => return,
                }
            }
            to_delete.push(ptr);
        });
        // delete in reverse so that children are deleted before parents
        for ptr in to_delete.into_iter().rev() {
            if scope.iter().any(|branch| branch.is_parent_of(Some(ptr))) {
                if txn.delete(ptr) {
                    performed = true;
                }
            }
        }

        performed
    }

    /// Recreate a deleted item at the equivalent position of its (possibly
    /// redone) parent. Returns the replica, or `None` when redoing is not
    /// possible because it would conflict with a remote change.
    fn redo_item(
        txn: &mut TransactionMut,
        item: ItemPtr,
        redo_items: &HashSet<ItemPtr>,
        popped: &StackItem,
        ignore_remote_map_changes: bool,
    ) -> Option<ItemPtr> {
        if let Some(redone) = item.redone {
            // already redone by an earlier step; hand out the replica
            return txn.get_item_clean_start(&redone);
        }
        let local_client = txn.store().options.client_id;
        let mut parent_item = item.parent.as_branch().and_then(|branch| branch.item);
        if let Some(pi) = parent_item {
            if pi.is_deleted() {
                // redo the parent first when it is going to be redone anyway
                if pi.redone.is_none() {
                    if !redo_items.contains(&pi) {
                        return None;
                    }
                    Self::redo_item(txn, pi, redo_items, popped, ignore_remote_map_changes)?;
                }
                let mut current = pi;
                while let Some(redone) = current.redone {
                    current = txn.get_item_clean_start(&redone)?;
                }
                parent_item = Some(current);
            }
        }
        let parent_branch: BranchPtr = match parent_item {
            None => *item.parent.as_branch()?,
            Some(pi) => match &pi.content {
                Content::Type(branch) => BranchPtr::from(branch),
                _ => return None,
            },
        };

        let mut left: Option<ItemPtr>;
        let mut right: Option<ItemPtr>;
        if item.parent_sub.is_none() {
            // a sequence item is redone at its old position
            left = item.left;
            right = Some(item);
            while let Some(l) = left {
                if let Some(trace) = trace_redone(txn, Some(l), parent_item) {
                    left = Some(trace);
                    break;
                }
                left = l.left;
            }
            while let Some(r) = right {
                if let Some(trace) = trace_redone(txn, Some(r), parent_item) {
                    right = Some(trace);
                    break;
                }
                right = r.right;
            }
        } else {
            right = None;
            if item.right.is_some() && !ignore_remote_map_changes {
                // when the values written on top of this entry are being
                // deleted by this very undo step, the redone item replaces
                // them; a surviving remote value wins instead
                let mut current = item;
                loop {
                    match current.right {
                        Some(r)
                            if r.redone.is_some()
                                || popped.contains_insertion(local_client, &r.id) =>
                        {
                            current = r;
                        }
                        _ => break,
                    }
                }
                while let Some(redone) = current.redone {
                    current = txn.get_item_clean_start(&redone)?;
                }
                if current.right.is_some() {
                    // conflicts with a change from another client
                    return None;
                }
                left = Some(current);
            } else {
                left = item
                    .parent_sub
                    .as_ref()
                    .and_then(|sub| parent_branch.map.get(sub).cloned());
            }
        }

        let next_id = ID::new(local_client, txn.store().blocks.get_clock(&local_client));
        let mut redone_item = Item::new(
            next_id,
            left,
            left.map(|l| l.last_id()),
            right,
            right.map(|r| *r.id()),
            TypePtr::Branch(parent_branch),
            item.parent_sub.clone(),
            item.content.copy(),
        );
        redone_item.info.set_keep(true);
        {
            let mut source = item;
            source.redone = Some(next_id);
        }
        let mut ptr = ItemPtr::from(&redone_item);
        ptr.integrate(txn, 0);
        txn.store_mut().blocks.push_item(redone_item);
        Some(ptr)
    }
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("UndoManager")
            .field("undo_stack", &state.undo_stack)
            .field("redo_stack", &state.redo_stack)
            .finish()
    }
}

/// Walk the `redone` chain of `ptr` until an item under `parent_item` is
/// found.
fn trace_redone(
    txn: &mut TransactionMut,
    mut ptr: Option<ItemPtr>,
    parent_item: Option<ItemPtr>,
) -> Option<ItemPtr> {
    while let Some(item) = ptr {
        if item.parent.as_branch().and_then(|branch| branch.item) == parent_item {
            return Some(item);
        }
        ptr = match item.redone {
            Some(redone) => txn.get_item_clean_start(&redone),
            None => None,
        };
    }
    None
}

/// Pin (or unpin) an item and its ancestor chain, protecting the payloads
/// from the garbage collector.
fn keep_item(ptr: ItemPtr, keep: bool) {
    let mut current = Some(ptr);
    while let Some(mut item) = current {
        if item.info.is_keep() == keep {
            break;
        }
        item.info.set_keep(keep);
        current = item.parent.as_branch().and_then(|branch| branch.item);
    }
}

/// Visit every item overlapping the delete set, without splitting at run
/// boundaries. Used for keep-flag bookkeeping, where covering a slightly
/// larger item is sound.
fn iterate_deleted_items<F: FnMut(ItemPtr)>(store: &Store, ds: &DeleteSet, f: &mut F) {
    for (client, ranges) in ds.iter() {
        if let Some(blocks) = store.blocks.get_client(client) {
            for range in ranges.iter() {
                if let Some(mut index) = blocks.find_pivot(range.start) {
                    while index < blocks.len() {
                        let cell = &blocks[index];
                        if cell.clock_start() >= range.end {
                            break;
                        }
                        if let Some(item) = cell.as_item() {
                            f(item);
                        }
                        index += 1;
                    }
                }
            }
        }
    }
}

fn release_stack_item(store: &Store, item: &StackItem) {
    iterate_deleted_items(store, &item.deletions, &mut |item| {
        keep_item(item, false);
    });
}
