use crate::id_set::DeleteSet;
use crate::struct_store::StateVector;
use crate::transaction::TransactionMut;

/// Payload of the update stream: the binary update produced by a committed
/// transaction, ready to be shipped to remote peers.
pub struct UpdateEvent {
    pub update: Vec<u8>,
}

impl UpdateEvent {
    pub(crate) fn new(txn: &TransactionMut) -> Self {
        UpdateEvent {
            update: txn.encode_update(),
        }
    }
}

/// Summary of a committed transaction, emitted both right after observer
/// dispatch and once the cleanup passes finished.
pub struct TransactionCleanupEvent {
    pub before_state: StateVector,
    pub after_state: StateVector,
    pub delete_set: DeleteSet,
}

impl TransactionCleanupEvent {
    pub(crate) fn new(txn: &TransactionMut) -> Self {
        TransactionCleanupEvent {
            before_state: txn.before_state.clone(),
            after_state: txn.after_state.clone(),
            delete_set: txn.delete_set.clone(),
        }
    }
}
