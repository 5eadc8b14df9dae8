//! Skein is a CRDT engine for collaborative editing of structured documents.
//!
//! Multiple peers concurrently mutate a shared [Doc]; each peer produces
//! compact binary updates which can be applied in any order by any other
//! peer, and all replicas converge to the same state without central
//! coordination.
//!
//! A document exposes four shared data types, all built atop the same
//! linked-list core:
//!
//! - [ArrayRef]: an ordered sequence of values,
//! - [MapRef]: a keyed mapping where the last write (in the deterministic
//!   conflict order) wins,
//! - [TextRef]: a rich text with inline formatting and embedded objects,
//! - [XmlFragmentRef]: an XML-shaped tree of elements, attributes and text
//!   nodes.
//!
//! All mutations run inside a [TransactionMut]. When the transaction is
//! committed (automatically on drop), observers fire and the binary update
//! of the change is emitted on the document's update stream:
//!
//! ```no_run
//! use skein::{Doc, StateVector, Text};
//!
//! let local = Doc::new();
//! let text = local.get_text("article");
//!
//! {
//!     let mut txn = local.transact_mut();
//!     text.insert(&mut txn, 0, "hello world");
//! }
//!
//! // a remote peer can be brought in sync with a differential update
//! let remote = Doc::new();
//! let missing = local.encode_state_as_update(&StateVector::default());
//! remote.apply_update(&missing).unwrap();
//!
//! let remote_text = remote.get_text("article");
//! assert_eq!(remote_text.get_string(&remote.transact()), "hello world");
//! ```

mod block;
mod doc;
mod error;
mod event;
mod id_set;
mod observer;
mod store;
mod struct_store;
mod transaction;
pub mod sync;
pub mod types;
mod update;
pub mod undo;
pub mod updates;
mod utils;

mod sticky_index;

#[cfg(test)]
mod tests;

/// Process-unique random identifier of a single peer.
pub type ClientID = u32;

pub use crate::block::{Prelim, ID};
pub use crate::doc::{uuid_v4, Doc, Options};
pub use crate::error::Error;
pub use crate::event::{TransactionCleanupEvent, UpdateEvent};
pub use crate::id_set::DeleteSet;
pub use crate::observer::{Observer, Subscription};
pub use crate::sticky_index::{Assoc, IndexScope, StickyIndex};
pub use crate::struct_store::StateVector;
pub use crate::transaction::{Origin, ReadTxn, Transaction, TransactionMut};
pub use crate::types::{
    Array, ArrayPrelim, ArrayRef, Attrs, Change, DeepObservable, Delta, EntryChange, GetString,
    Map, MapPrelim, MapRef, Observable, Text, TextPrelim, TextRef, ToJson, Value, XmlElementPrelim,
    XmlElementRef, XmlFragmentRef, XmlHookRef, XmlNode, XmlTextPrelim, XmlTextRef,
};
pub use crate::undo::UndoManager;
pub use crate::update::{PendingUpdate, Update};
pub use bin0::any::Any;
