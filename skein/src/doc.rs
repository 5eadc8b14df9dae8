use crate::error::Error;
use crate::event::{TransactionCleanupEvent, UpdateEvent};
use crate::observer::Subscription;
use crate::store::{Store, StoreRef};
use crate::struct_store::StateVector;
use crate::transaction::{Origin, ReadTxn, Transaction, TransactionMut};
use crate::types::{
    ArrayRef, BranchPtr, MapRef, TextRef, TypeRef, XmlFragmentRef,
};
use crate::update::Update;
use crate::updates::decoder::Decode;
use crate::ClientID;
use rand::Rng;
use std::sync::Arc;

/// Configuration of a [Doc] instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Globally unique client identifier of this peer. Randomized by
    /// default; override it only when the uniqueness is guaranteed by other
    /// means, since two active peers sharing a client id corrupt each other.
    pub client_id: ClientID,
    /// Globally unique identity tag of the document.
    pub guid: Arc<str>,
    /// When set, deleted payloads are retained as full tombstones instead of
    /// being garbage collected after every transaction.
    pub skip_gc: bool,
}

impl Options {
    pub fn new() -> Self {
        let client_id: u32 = rand::thread_rng().gen();
        Self::with_client_id(client_id)
    }

    pub fn with_client_id(client_id: ClientID) -> Self {
        Options {
            client_id,
            guid: uuid_v4(),
            skip_gc: false,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

/// Generates a random v4 UUID string.
pub fn uuid_v4() -> Arc<str> {
    let mut rng = rand::thread_rng();
    let mut bytes: [u8; 16] = rng.gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let mut out = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.into()
}

/// A collaborative document: the shared root types it exposes converge with
/// every other peer's replica once the same set of updates was exchanged, in
/// any order.
///
/// Cloning a [Doc] produces another handle to the same document.
pub struct Doc {
    store: StoreRef,
}

impl Doc {
    /// Creates a new document with a randomized client id.
    pub fn new() -> Self {
        Self::with_options(Options::new())
    }

    /// Creates a new document with the given client id. The caller is
    /// responsible for its uniqueness among collaborating peers.
    pub fn with_client_id(client_id: ClientID) -> Self {
        Self::with_options(Options::with_client_id(client_id))
    }

    pub fn with_options(options: Options) -> Self {
        Doc {
            store: StoreRef::from(Store::new(options)),
        }
    }

    pub fn options(&self) -> &Options {
        self.store.options()
    }

    pub fn client_id(&self) -> ClientID {
        self.options().client_id
    }

    pub fn guid(&self) -> &str {
        &self.options().guid
    }

    /// Opens a read-only transaction.
    ///
    /// # Panics
    ///
    /// Panics when a read-write transaction is active on this document.
    pub fn transact(&self) -> Transaction {
        let store = self
            .store
            .try_borrow()
            .expect("document store is locked by a read-write transaction");
        Transaction::new(store)
    }

    /// Opens a read-write transaction. Its changes are committed when the
    /// transaction is dropped. Only one read-write transaction may be active
    /// per document; nested operations compose by threading the transaction
    /// through, which keeps observer-triggered cascades serialized.
    ///
    /// # Panics
    ///
    /// Panics when another transaction is active on this document.
    pub fn transact_mut(&self) -> TransactionMut {
        self.transact_mut_impl(None)
    }

    /// Opens a read-write transaction tagged with an origin. The origin can
    /// be read back in observer callbacks and is used by the undo manager to
    /// decide whether a transaction should be captured.
    pub fn transact_mut_with<T: Into<Origin>>(&self, origin: T) -> TransactionMut {
        self.transact_mut_impl(Some(origin.into()))
    }

    fn transact_mut_impl(&self, origin: Option<Origin>) -> TransactionMut {
        let store = self
            .store
            .try_borrow_mut()
            .expect("document store is locked by another transaction");
        TransactionMut::new(store, origin)
    }

    /// Returns the root sequence type under `name`, creating it if needed.
    /// Subsequent calls with the same name return the same instance.
    ///
    /// # Panics
    ///
    /// Panics when the root type under `name` was created with a different
    /// constructor.
    pub fn get_array(&self, name: &str) -> ArrayRef {
        ArrayRef::from(self.get_or_create(name, TypeRef::Array))
    }

    /// Returns the root keyed mapping under `name`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics when the root type under `name` was created with a different
    /// constructor.
    pub fn get_map(&self, name: &str) -> MapRef {
        MapRef::from(self.get_or_create(name, TypeRef::Map))
    }

    /// Returns the root rich text under `name`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics when the root type under `name` was created with a different
    /// constructor.
    pub fn get_text(&self, name: &str) -> TextRef {
        TextRef::from(self.get_or_create(name, TypeRef::Text))
    }

    /// Returns the root XML fragment under `name`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics when the root type under `name` was created with a different
    /// constructor.
    pub fn get_xml_fragment(&self, name: &str) -> XmlFragmentRef {
        XmlFragmentRef::from(self.get_or_create(name, TypeRef::XmlFragment))
    }

    fn get_or_create(&self, name: &str, type_ref: TypeRef) -> BranchPtr {
        let mut store = self
            .store
            .try_borrow_mut()
            .expect("document store is locked by an active transaction");
        let branch = store.get_or_create_type(name, type_ref.clone());
        let actual = branch.type_ref();
        if *actual != type_ref {
            panic!(
                "root type '{}' was created as {}, but accessed as {}",
                name, actual, type_ref
            );
        }
        branch
    }

    /// Decode `update` and integrate it into this document within an
    /// implicit transaction. Observers fire at commit. Structs whose
    /// dependencies have not arrived yet are parked and integrated once the
    /// missing updates land.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), Error> {
        let update = Update::decode_from(update)?;
        let mut txn = self.transact_mut();
        txn.apply_update(update);
        Ok(())
    }

    /// Same as [Doc::apply_update], with the implicit transaction tagged by
    /// `origin`.
    pub fn apply_update_with<T: Into<Origin>>(&self, update: &[u8], origin: T) -> Result<(), Error> {
        let update = Update::decode_from(update)?;
        let mut txn = self.transact_mut_with(origin);
        txn.apply_update(update);
        Ok(())
    }

    /// Encode the local state vector; see [ReadTxn::encode_state_vector].
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.transact().encode_state_vector()
    }

    /// Encode everything a peer described by `sv` is missing; see
    /// [ReadTxn::encode_state_as_update].
    pub fn encode_state_as_update(&self, sv: &StateVector) -> Vec<u8> {
        self.transact().encode_state_as_update(sv)
    }

    /// Subscribe a callback fired with the binary update of every committed
    /// transaction that changed the document.
    pub fn observe_update<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &UpdateEvent) -> () + 'static,
    {
        let mut store = self
            .store
            .try_borrow_mut()
            .expect("document store is locked by an active transaction");
        store.events_mut().observe_update(f)
    }

    /// Subscribe a callback fired after observer dispatch of every committed
    /// transaction, before the cleanup passes run.
    pub fn observe_after_transaction<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &TransactionCleanupEvent) -> () + 'static,
    {
        let mut store = self
            .store
            .try_borrow_mut()
            .expect("document store is locked by an active transaction");
        store.events_mut().observe_after_transaction(f)
    }

    /// Subscribe a callback fired when a committed transaction finished its
    /// cleanup passes.
    pub fn observe_transaction_cleanup<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &TransactionCleanupEvent) -> () + 'static,
    {
        let mut store = self
            .store
            .try_borrow_mut()
            .expect("document store is locked by an active transaction");
        store.events_mut().observe_transaction_cleanup(f)
    }
}

impl Default for Doc {
    fn default() -> Self {
        Doc::new()
    }
}

impl Clone for Doc {
    fn clone(&self) -> Self {
        Doc {
            store: self.store.clone(),
        }
    }
}

impl PartialEq for Doc {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.store.0, &other.store.0)
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.store.try_borrow() {
            Ok(store) => std::fmt::Debug::fmt(&*store, f),
            Err(_) => write!(f, "Doc(client_id: {})", self.client_id()),
        }
    }
}
