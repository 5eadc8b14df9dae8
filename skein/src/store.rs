use crate::block::{ItemPtr, ID};
use crate::doc::Options;
use crate::event::{TransactionCleanupEvent, UpdateEvent};
use crate::id_set::DeleteSet;
use crate::observer::{Observer, Subscription};
use crate::struct_store::{StateVector, StructStore};
use crate::transaction::TransactionMut;
use crate::types::{Branch, BranchPtr, TypeRef};
use crate::update::PendingUpdate;
use crate::updates::encoder::{Encode, Encoder};
use crate::ClientID;
use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut, BorrowError, BorrowMutError};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Store is the core element of a document. It contains all of the document
/// information: the struct store, the map of root types, pending updates
/// waiting for missing dependencies, and document-level subscriptions.
pub struct Store {
    pub(crate) options: Options,

    /// Root types (a.k.a. top-level types), defined by users at the document
    /// level. They have unique names and are never transmitted themselves,
    /// only referenced.
    pub(crate) types: HashMap<Arc<str>, Arc<Branch>>,

    /// Registry of all alive branch nodes of this document. Event dispatch
    /// skips branches which have been deleted within the committing
    /// transaction.
    pub(crate) node_registry: HashSet<BranchPtr>,

    /// The struct store: all blocks (inserted or tombstoned operations)
    /// integrated - and therefore visible - in the current document.
    pub(crate) blocks: StructStore,

    /// A pending update: blocks which could not be integrated yet because
    /// some of their dependencies are missing.
    pub(crate) pending: Option<PendingUpdate>,

    /// A pending delete set: deleted ranges which refer to blocks that have
    /// not been integrated yet.
    pub(crate) pending_ds: Option<DeleteSet>,

    pub(crate) events: Option<Box<StoreEvents>>,
}

impl Store {
    pub(crate) fn new(options: Options) -> Self {
        Store {
            options,
            types: HashMap::default(),
            node_registry: HashSet::default(),
            blocks: StructStore::default(),
            pending: None,
            pending_ds: None,
            events: None,
        }
    }

    /// The latest clock value produced and integrated by the local client.
    pub fn get_local_state(&self) -> u32 {
        self.blocks.get_clock(&self.options.client_id)
    }

    pub(crate) fn get_type<K: AsRef<str>>(&self, key: K) -> Option<BranchPtr> {
        let branch = self.types.get(key.as_ref())?;
        Some(BranchPtr::from(branch))
    }

    /// Returns a branch reference of a root-level type, creating an empty
    /// placeholder if the type was not defined before.
    pub(crate) fn get_or_create_type<K: Into<Arc<str>>>(
        &mut self,
        key: K,
        type_ref: TypeRef,
    ) -> BranchPtr {
        let key = key.into();
        match self.types.entry(key.clone()) {
            Entry::Occupied(e) => {
                let mut branch_ref = BranchPtr::from(e.get());
                branch_ref.repair_type_ref(type_ref);
                branch_ref
            }
            Entry::Vacant(e) => {
                let branch = Branch::new(type_ref);
                let mut branch_ref = BranchPtr::from(&branch);
                branch_ref.name = Some(key);
                self.node_registry.insert(branch_ref);
                e.insert(branch);
                branch_ref
            }
        }
    }

    /// Compute a diff to sync with another client.
    ///
    /// This is the most efficient method to sync with another client by only
    /// syncing the differences.
    ///
    /// The sync protocol is:
    /// * Send the local [StateVector] to the other client.
    /// * The other client uses that state vector to compute the minimal diff.
    pub fn encode_diff<E: Encoder>(&self, sv: &StateVector, encoder: &mut E) {
        self.write_blocks_from(sv, encoder);
        let delete_set = DeleteSet::from_store(&self.blocks);
        delete_set.encode(encoder);
    }

    pub(crate) fn write_blocks_from<E: Encoder>(&self, sv: &StateVector, encoder: &mut E) {
        let local_sv = self.blocks.get_state_vector();
        let mut diff = Self::diff_state_vectors(&local_sv, sv);

        // Write items with higher client ids first.
        // This heavily improves the conflict resolution algorithm.
        diff.sort_by(|a, b| b.0.cmp(&a.0));

        encoder.write_var(diff.len());
        for (client, clock) in diff {
            let blocks = self.blocks.get_client(&client).unwrap();
            // make sure the first id exists
            let clock = clock.max(blocks.first_clock());
            let start = blocks.find_pivot(clock).unwrap();
            // write the number of encoded structs
            encoder.write_var(blocks.len() - start);
            encoder.write_client(client);
            encoder.write_var(clock);
            let first_block = &blocks[start];
            // write the first struct with an offset
            first_block.encode(encoder, clock - first_block.clock_start());
            for i in (start + 1)..blocks.len() {
                blocks[i].encode(encoder, 0);
            }
        }
    }

    fn diff_state_vectors(local_sv: &StateVector, remote_sv: &StateVector) -> Vec<(ClientID, u32)> {
        let mut diff = Vec::new();
        for (client, &remote_clock) in remote_sv.iter() {
            let local_clock = local_sv.get(client);
            if local_clock > remote_clock {
                diff.push((*client, remote_clock));
            }
        }
        for (client, _) in local_sv.iter() {
            if remote_sv.get(client) == 0 {
                diff.push((*client, 0));
            }
        }
        diff
    }

    /// Follows the chain of `redone` pointers from `id` to the current
    /// representative of that logical position. Returns the final item and
    /// the clock distance travelled into it.
    pub(crate) fn follow_redone(&self, id: &ID) -> (Option<ItemPtr>, u32) {
        let mut next_id = Some(*id);
        let mut ptr = None;
        let mut diff = 0;
        while {
            if let Some(mut next) = next_id {
                if diff > 0 {
                    next.clock += diff;
                    next_id = Some(next.clone());
                }
                ptr = self.blocks.get_item(&next);
                if let Some(item) = ptr.as_deref() {
                    diff = next.clock - item.id.clock;
                    next_id = item.redone;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        } {}
        (ptr, diff)
    }

    pub fn is_alive(&self, branch_ptr: &BranchPtr) -> bool {
        self.node_registry.contains(branch_ptr)
    }

    pub(crate) fn register(&mut self, branch: BranchPtr) {
        self.node_registry.insert(branch);
    }

    pub(crate) fn deregister(&mut self, branch: &BranchPtr) {
        self.node_registry.remove(branch);
    }

    pub(crate) fn events_mut(&mut self) -> &mut StoreEvents {
        self.events.get_or_insert_with(Box::default)
    }
}

impl Encode for Store {
    /// Encodes the whole document state into a binary update.
    ///
    /// Document updates are idempotent and commutative:
    /// * It doesn't matter in which order updates are applied.
    /// * As long as all clients receive the same updates, they end up with
    ///   the same content.
    /// * Even if an update contains known information, the unknown part is
    ///   extracted and integrated.
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.encode_diff(&StateVector::default(), encoder)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct(&self.options.client_id.to_string());
        if !self.types.is_empty() {
            s.field("root types", &self.types);
        }
        if !self.blocks.is_empty() {
            s.field("blocks", &self.blocks);
        }
        if let Some(pending) = self.pending.as_ref() {
            s.field("pending", pending);
        }
        if let Some(pending_ds) = self.pending_ds.as_ref() {
            s.field("pending delete set", pending_ds);
        }
        s.finish()
    }
}

#[repr(transparent)]
#[derive(Clone)]
pub(crate) struct StoreRef(pub(crate) Arc<AtomicRefCell<Store>>);

impl StoreRef {
    pub fn try_borrow(&self) -> Result<AtomicRef<Store>, BorrowError> {
        self.0.try_borrow()
    }

    pub fn try_borrow_mut(&self) -> Result<AtomicRefMut<Store>, BorrowMutError> {
        self.0.try_borrow_mut()
    }

    pub fn options(&self) -> &Options {
        let store = unsafe { self.0.as_ptr().as_ref().unwrap() };
        &store.options
    }
}

impl From<Store> for StoreRef {
    fn from(store: Store) -> Self {
        StoreRef(Arc::new(AtomicRefCell::new(store)))
    }
}

/// Document-level subscriptions, allocated lazily on first observer
/// registration.
#[derive(Default)]
pub(crate) struct StoreEvents {
    /// Callbacks fired right after observer dispatch, before the garbage
    /// collection and merge passes run. The undo manager pins the items it
    /// may need to resurrect from within this notification.
    pub(crate) after_transaction_events: Observer<TransactionCleanupEvent>,

    /// Callbacks fired at the end of the commit close sequence, after the
    /// garbage collection and merge passes.
    pub(crate) transaction_cleanup_events: Observer<TransactionCleanupEvent>,

    /// Callbacks fired with the binary update produced by a committed
    /// transaction, if anything changed.
    pub(crate) update_events: Observer<UpdateEvent>,
}

impl StoreEvents {
    /// Subscribe a callback fired once a transaction finished dispatching
    /// its observers, but before tombstone payloads are collected.
    pub fn observe_after_transaction<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &TransactionCleanupEvent) -> () + 'static,
    {
        self.after_transaction_events.subscribe(f)
    }

    pub fn emit_after_transaction(&self, txn: &TransactionMut) {
        if let Some(callbacks) = self.after_transaction_events.callbacks() {
            let event = TransactionCleanupEvent::new(txn);
            for f in callbacks {
                f(txn, &event);
            }
        }
    }

    /// Subscribe a callback receiving the binary update of every committed
    /// transaction that changed anything. The payload can be passed to
    /// remote peers right away.
    ///
    /// Returns a subscription which unsubscribes the callback when dropped.
    pub fn observe_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &UpdateEvent) -> () + 'static,
    {
        self.update_events.subscribe(f)
    }

    pub fn emit_update(&self, txn: &TransactionMut) {
        if let Some(callbacks) = self.update_events.callbacks() {
            if !txn.delete_set.is_empty() || txn.after_state != txn.before_state {
                // produce the update only if anything changed
                let event = UpdateEvent::new(txn);
                for f in callbacks {
                    f(txn, &event);
                }
            }
        }
    }

    /// Subscribe a callback fired when a transaction commit finished its
    /// cleanup passes.
    pub fn observe_transaction_cleanup<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &TransactionCleanupEvent) -> () + 'static,
    {
        self.transaction_cleanup_events.subscribe(f)
    }

    pub fn emit_transaction_cleanup(&self, txn: &TransactionMut) {
        if let Some(callbacks) = self.transaction_cleanup_events.callbacks() {
            let event = TransactionCleanupEvent::new(txn);
            for f in callbacks {
                f(txn, &event);
            }
        }
    }
}
