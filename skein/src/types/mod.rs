pub mod array;
pub mod map;
pub mod text;
pub mod xml;

pub use array::{Array, ArrayPrelim, ArrayRef};
pub use map::{Map, MapPrelim, MapRef};
pub use text::{Text, TextPrelim, TextRef};
pub use xml::{XmlElementPrelim, XmlElementRef, XmlFragmentRef, XmlHookRef, XmlNode, XmlTextPrelim, XmlTextRef};

use crate::block::{Content, ItemPosition, ItemPtr, Prelim, ID};
use crate::observer::{Observer, Subscription};
use crate::transaction::{Origin, ReadTxn, TransactionMut};
use crate::types::array::ArrayEvent;
use crate::types::map::MapEvent;
use crate::types::text::TextEvent;
use crate::types::xml::{XmlEvent, XmlTextEvent};
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use bin0::any::Any;
use bin0::error::Error;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::{TryFrom, TryInto};
use std::fmt::Formatter;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// Type ref identifier for an [ArrayRef] type.
pub const TYPE_REFS_ARRAY: u8 = 0;

/// Type ref identifier for a [MapRef] type.
pub const TYPE_REFS_MAP: u8 = 1;

/// Type ref identifier for a [TextRef] type.
pub const TYPE_REFS_TEXT: u8 = 2;

/// Type ref identifier for an [XmlElementRef] type.
pub const TYPE_REFS_XML_ELEMENT: u8 = 3;

/// Type ref identifier for an [XmlFragmentRef] type.
pub const TYPE_REFS_XML_FRAGMENT: u8 = 4;

/// Type ref identifier for an [XmlHookRef] type.
pub const TYPE_REFS_XML_HOOK: u8 = 5;

/// Type ref identifier for an [XmlTextRef] type.
pub const TYPE_REFS_XML_TEXT: u8 = 6;

/// Placeholder type ref identifier for root-level types which have been
/// integrated from remote peers before they were defined locally.
pub const TYPE_REFS_UNDEFINED: u8 = 15;

/// An identifier of a shared-type constructor. Registered once per document
/// and referenced from the wire format whenever a nested type is carried
/// inside item content.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TypeRef {
    Array,
    Map,
    Text,
    XmlElement(Arc<str>),
    XmlFragment,
    XmlHook,
    XmlText,
    Undefined,
}

impl TypeRef {
    pub fn kind(&self) -> u8 {
        match self {
            TypeRef::Array => TYPE_REFS_ARRAY,
            TypeRef::Map => TYPE_REFS_MAP,
            TypeRef::Text => TYPE_REFS_TEXT,
            TypeRef::XmlElement(_) => TYPE_REFS_XML_ELEMENT,
            TypeRef::XmlFragment => TYPE_REFS_XML_FRAGMENT,
            TypeRef::XmlHook => TYPE_REFS_XML_HOOK,
            TypeRef::XmlText => TYPE_REFS_XML_TEXT,
            TypeRef::Undefined => TYPE_REFS_UNDEFINED,
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeRef::Array => write!(f, "Array"),
            TypeRef::Map => write!(f, "Map"),
            TypeRef::Text => write!(f, "Text"),
            TypeRef::XmlElement(name) => write!(f, "XmlElement({})", name),
            TypeRef::XmlFragment => write!(f, "XmlFragment"),
            TypeRef::XmlHook => write!(f, "XmlHook"),
            TypeRef::XmlText => write!(f, "XmlText"),
            TypeRef::Undefined => write!(f, "(undefined)"),
        }
    }
}

impl Encode for TypeRef {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_type_ref(self.kind());
        if let TypeRef::XmlElement(name) = self {
            encoder.write_key(name);
        }
    }
}

impl Decode for TypeRef {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error> {
        match decoder.read_type_ref()? {
            TYPE_REFS_ARRAY => Ok(TypeRef::Array),
            TYPE_REFS_MAP => Ok(TypeRef::Map),
            TYPE_REFS_TEXT => Ok(TypeRef::Text),
            TYPE_REFS_XML_ELEMENT => Ok(TypeRef::XmlElement(decoder.read_key()?)),
            TYPE_REFS_XML_FRAGMENT => Ok(TypeRef::XmlFragment),
            TYPE_REFS_XML_HOOK => Ok(TypeRef::XmlHook),
            TYPE_REFS_XML_TEXT => Ok(TypeRef::XmlText),
            TYPE_REFS_UNDEFINED => Ok(TypeRef::Undefined),
            other => Err(Error::UnexpectedValue(other)),
        }
    }
}

/// Trait implemented by all shared-type references which can be observed for
/// changes scoped to that type alone.
pub trait Observable: AsRef<Branch> {
    type Event;

    /// Subscribes a callback triggered whenever this shared type is changed
    /// by a committed transaction. Changes observed by nested collections do
    /// not trigger this callback.
    ///
    /// Returns a [Subscription] which, when dropped, unsubscribes the
    /// callback.
    fn observe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &Self::Event) -> () + 'static,
        Event: AsRef<Self::Event>,
    {
        let branch = self.as_ref();
        branch.observe(move |txn, e| {
            let mapped = e.as_ref();
            f(txn, mapped)
        })
    }
}

/// Trait implemented by shared types to display their contents as a string.
pub trait GetString {
    fn get_string<T: ReadTxn>(&self, txn: &T) -> String;
}

/// Marker trait for references to shared types stored in a document.
pub trait SharedRef: From<BranchPtr> + AsRef<Branch> {}

/// Trait implemented by all shared types, allowing to observe events emitted
/// by this and any of the nested collaborative types.
pub trait DeepObservable: AsRef<Branch> {
    /// Subscribe a callback `f` for all events emitted by this and nested
    /// collaborative types. The callback receives the transaction which
    /// triggered the events and the events themselves, ordered top-down.
    fn observe_deep<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &Events) -> () + 'static,
    {
        self.as_ref().observe_deep(f)
    }
}

impl<T> DeepObservable for T where T: AsRef<Branch> {}

/// A wrapper around a [Branch] cell with a bunch of convenience methods to
/// operate on both map-like and sequence components of a shared type.
#[repr(transparent)]
#[derive(Clone, Copy, Hash)]
pub struct BranchPtr(NonNull<Branch>);

impl BranchPtr {
    pub(crate) fn trigger(
        &self,
        txn: &TransactionMut,
        subs: HashSet<Option<Arc<str>>>,
    ) -> Option<Event> {
        let event = self.make_event(subs)?;
        if let Some(callbacks) = self.observers.callbacks() {
            for f in callbacks {
                f(txn, &event);
            }
        }
        Some(event)
    }

    pub(crate) fn trigger_deep(&self, txn: &TransactionMut, events: &Events) {
        if let Some(callbacks) = self.deep_observers.callbacks() {
            for f in callbacks {
                f(txn, events);
            }
        }
    }
}

impl Into<TypePtr> for BranchPtr {
    fn into(self) -> TypePtr {
        TypePtr::Branch(self)
    }
}

impl Into<Origin> for BranchPtr {
    fn into(self) -> Origin {
        let addr = self.0.as_ptr() as usize;
        let bytes = addr.to_be_bytes();
        Origin::from(bytes.as_ref())
    }
}

impl AsRef<Branch> for BranchPtr {
    fn as_ref(&self) -> &Branch {
        self.deref()
    }
}

impl Deref for BranchPtr {
    type Target = Branch;

    fn deref(&self) -> &Branch {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for BranchPtr {
    fn deref_mut(&mut self) -> &mut Branch {
        unsafe { self.0.as_mut() }
    }
}

impl<'a> From<&'a Arc<Branch>> for BranchPtr {
    fn from(branch: &'a Arc<Branch>) -> Self {
        let branch_ref: &Branch = branch;
        BranchPtr(unsafe { NonNull::new_unchecked(branch_ref as *const Branch as *mut Branch) })
    }
}

impl<'a> From<&'a Branch> for BranchPtr {
    fn from(branch: &'a Branch) -> Self {
        BranchPtr(unsafe { NonNull::new_unchecked(branch as *const Branch as *mut Branch) })
    }
}

impl Into<Value> for BranchPtr {
    /// Resolves the concrete shared-type reference for this branch based on
    /// its registered constructor.
    fn into(self) -> Value {
        match self.type_ref() {
            TypeRef::Array => Value::Array(ArrayRef::from(self)),
            TypeRef::Map => Value::Map(MapRef::from(self)),
            TypeRef::Text => Value::Text(TextRef::from(self)),
            TypeRef::XmlElement(_) => Value::XmlElement(XmlElementRef::from(self)),
            TypeRef::XmlFragment => Value::XmlFragment(XmlFragmentRef::from(self)),
            TypeRef::XmlText => Value::XmlText(XmlTextRef::from(self)),
            TypeRef::XmlHook => Value::XmlHook(XmlHookRef::from(self)),
            TypeRef::Undefined => Value::UndefinedRef(self),
        }
    }
}

impl Eq for BranchPtr {}

impl PartialEq for BranchPtr {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl std::fmt::Debug for BranchPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let branch: &Branch = self;
        write!(f, "{}", branch)
    }
}

/// Branch describes the content of a complex shared data structure, covering
/// both its sequence component (a linked list of items, used by arrays, text
/// and XML children) and its map component (a key to rightmost-item mapping,
/// used by maps and XML attributes).
pub struct Branch {
    /// Head of the sequence component: the first item of a doubly-linked
    /// list, or `None` when the sequence is empty or unused.
    pub(crate) start: Option<ItemPtr>,

    /// Map component: every key points at the *rightmost* item inserted under
    /// that key; the current value is the rightmost undeleted one.
    pub(crate) map: HashMap<Arc<str>, ItemPtr>,

    /// Back pointer to the item which carries this branch as content. `None`
    /// for root-level types.
    pub(crate) item: Option<ItemPtr>,

    /// Name under which this branch was registered as a root type.
    pub(crate) name: Option<Arc<str>>,

    /// Number of countable, undeleted positions in the sequence component.
    pub(crate) block_len: u32,

    pub(crate) type_ref: TypeRef,

    pub(crate) observers: Observer<Event>,

    pub(crate) deep_observers: Observer<Events>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl Eq for Branch {}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item
            && self.start == other.start
            && self.map == other.map
            && self.block_len == other.block_len
            && self.type_ref == other.type_ref
    }
}

impl Branch {
    pub fn new(type_ref: TypeRef) -> Arc<Self> {
        Arc::new(Self {
            start: None,
            map: HashMap::default(),
            item: None,
            name: None,
            block_len: 0,
            type_ref,
            observers: Observer::default(),
            deep_observers: Observer::default(),
        })
    }

    /// Constructor identifier of this branch.
    pub fn type_ref(&self) -> &TypeRef {
        &self.type_ref
    }

    pub(crate) fn repair_type_ref(&mut self, type_ref: TypeRef) {
        if self.type_ref == TypeRef::Undefined {
            self.type_ref = type_ref;
        }
    }

    /// Length of the sequence component. Map component sizes are computed on
    /// demand.
    pub fn len(&self) -> u32 {
        self.block_len
    }

    /// Iterator over `(key, item)` entries of the map component, skipping
    /// tombstones.
    pub(crate) fn entries(&self) -> Entries {
        Entries::new(&self.map)
    }

    /// Materialized value of the undeleted entry under `key`.
    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        let item = self.map.get(key)?;
        if item.is_deleted() {
            None
        } else {
            item.content.get_last()
        }
    }

    /// Returns the content containing the sequence position `index` together
    /// with an offset into that content.
    pub(crate) fn get_at(&self, mut index: u32) -> Option<(&Content, usize)> {
        let mut ptr = self.start.as_ref();
        while let Some(item) = ptr.map(ItemPtr::deref) {
            let len = item.len();
            if !item.is_deleted() && item.is_countable() {
                if index < len {
                    return Some((&item.content, index as usize));
                }
                index -= len;
            }
            ptr = item.right.as_ref();
        }
        None
    }

    /// Removes the entry under `key` from the map component, returning the
    /// replaced value if one existed.
    pub(crate) fn remove(&self, txn: &mut TransactionMut, key: &str) -> Option<Value> {
        let item = *self.map.get(key)?;
        let prev = if item.is_deleted() {
            None
        } else {
            item.content.get_last()
        };
        txn.delete(item);
        prev
    }

    /// First undeleted item of the sequence component.
    pub(crate) fn first(&self) -> Option<ItemPtr> {
        let mut ptr = self.start;
        while let Some(item) = ptr {
            if item.is_deleted() {
                ptr = item.right;
            } else {
                return Some(item);
            }
        }
        None
    }

    /// Given a sequence `index`, returns the pair of items surrounding that
    /// position, splitting an item when the position falls inside one.
    pub(crate) fn index_to_ptr(
        txn: &mut TransactionMut,
        mut ptr: Option<ItemPtr>,
        mut index: u32,
    ) -> (Option<ItemPtr>, Option<ItemPtr>) {
        while let Some(item) = ptr {
            let content_len = item.len();
            if !item.is_deleted() && item.is_countable() {
                if index == content_len {
                    return (Some(item), item.right);
                } else if index < content_len {
                    let right = txn.split(item, index);
                    return (Some(item), right);
                }
                index -= content_len;
            }
            ptr = item.right;
        }
        (None, None)
    }

    /// Removes up to `len` countable elements starting at `index` from the
    /// sequence component. Returns the number of removed elements.
    pub(crate) fn remove_at(&self, txn: &mut TransactionMut, index: u32, len: u32) -> u32 {
        let mut remaining = len;
        let start = self.start;
        let mut ptr = if index == 0 {
            start
        } else {
            Branch::index_to_ptr(txn, start, index).1
        };
        while remaining > 0 {
            if let Some(item) = ptr {
                if !item.is_deleted() {
                    let content_len = item.len();
                    let (del, next) = if remaining < content_len {
                        let right = txn.split(item, remaining);
                        remaining = 0;
                        (item, right)
                    } else {
                        remaining -= content_len;
                        (item, item.right)
                    };
                    txn.delete(del);
                    ptr = next;
                } else {
                    ptr = item.right;
                }
            } else {
                break;
            }
        }
        len - remaining
    }

    /// Inserts a preliminary `value` into the sequence component at `index`.
    /// Returns the item created as a result of this operation.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the current sequence length.
    pub(crate) fn insert_at<V: Prelim>(
        &self,
        txn: &mut TransactionMut,
        index: u32,
        value: V,
    ) -> ItemPtr {
        if index > self.len() {
            panic!("cannot insert item at index over the length of the sequence");
        }
        let parent = BranchPtr::from(self);
        let (left, right) = if index == 0 {
            (None, None)
        } else {
            Branch::index_to_ptr(txn, self.start, index)
        };
        let pos = ItemPosition {
            parent: parent.into(),
            left,
            right,
            index: 0,
            current_attrs: None,
        };
        txn.create_item(&pos, value, None)
    }

    /// Path from `from` (an ancestor) down to `to`, expressed as a sequence
    /// of keys and indexes.
    pub(crate) fn path(from: BranchPtr, to: BranchPtr) -> Path {
        let parent = from;
        let mut child = to;
        let mut path = VecDeque::default();
        while let Some(item) = &child.item {
            if parent.item == child.item {
                break;
            }
            let item_id = item.id.clone();
            let parent_sub = item.parent_sub.clone();
            child = match item.parent.as_branch() {
                Some(branch) => *branch,
                None => break,
            };
            if let Some(parent_sub) = parent_sub {
                // parent is map-ish
                path.push_front(PathSegment::Key(parent_sub));
            } else {
                // parent is array-ish
                let mut i = 0;
                let mut c = child.start;
                while let Some(ptr) = c {
                    if *ptr.id() == item_id {
                        break;
                    }
                    if !ptr.is_deleted() && ptr.is_countable() {
                        i += ptr.len();
                    }
                    c = ptr.right;
                }
                path.push_front(PathSegment::Index(i));
            }
        }
        path
    }

    pub fn observe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &Event) -> () + 'static,
    {
        self.observers.subscribe(f)
    }

    pub fn observe_deep<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &Events) -> () + 'static,
    {
        self.deep_observers.subscribe(f)
    }

    /// True when this branch is an ancestor of the item behind `ptr`.
    pub(crate) fn is_parent_of(&self, mut ptr: Option<ItemPtr>) -> bool {
        while let Some(item) = ptr.as_deref() {
            if let Some(parent) = item.parent.as_branch() {
                if parent.deref() == self {
                    return true;
                }
                ptr = parent.item;
            } else {
                break;
            }
        }
        false
    }

    pub(crate) fn make_event(&self, keys: HashSet<Option<Arc<str>>>) -> Option<Event> {
        let self_ptr = BranchPtr::from(self);
        let event = match self.type_ref() {
            TypeRef::Array => Event::Array(ArrayEvent::new(self_ptr)),
            TypeRef::Map => Event::Map(MapEvent::new(self_ptr, keys)),
            TypeRef::Text => Event::Text(TextEvent::new(self_ptr)),
            TypeRef::XmlElement(_) | TypeRef::XmlFragment => {
                Event::XmlFragment(XmlEvent::new(self_ptr, keys))
            }
            TypeRef::XmlText => Event::XmlText(XmlTextEvent::new(self_ptr, keys)),
            _ => return None,
        };
        Some(event)
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_ref)?;
        if let Some(name) = self.name.as_deref() {
            write!(f, " '{}'", name)?;
        }
        if let Some(start) = self.start.as_ref() {
            write!(f, "(start: {})", start.id())?;
        }
        if !self.map.is_empty() {
            write!(f, " {{")?;
            let mut iter = self.map.iter();
            if let Some((k, v)) = iter.next() {
                write!(f, "'{}': {}", k, v.id())?;
            }
            for (k, v) in iter {
                write!(f, ", '{}': {}", k, v.id())?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

/// Value that can be returned by shared data types. This includes [Any],
/// which is an extended representation of JSON, as well as nested complex
/// collaborative structures.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A primitive value, treated as a single element in its entirety.
    Any(Any),
    Array(ArrayRef),
    Map(MapRef),
    Text(TextRef),
    XmlElement(XmlElementRef),
    XmlFragment(XmlFragmentRef),
    XmlText(XmlTextRef),
    XmlHook(XmlHookRef),
    /// A shared collection of a type that has not been defined locally yet.
    UndefinedRef(BranchPtr),
}

impl Default for Value {
    fn default() -> Self {
        Value::Any(Any::Null)
    }
}

impl Value {
    #[inline]
    pub fn cast<T>(self) -> Result<T, Self>
    where
        T: TryFrom<Self, Error = Self>,
    {
        T::try_from(self)
    }

    /// Converts the current value into its string representation.
    pub fn to_string<T: ReadTxn>(self, txn: &T) -> String {
        match self {
            Value::Any(any) => any.to_string(),
            Value::Text(v) => v.get_string(txn),
            Value::Array(v) => v.to_json(txn).to_string(),
            Value::Map(v) => v.to_json(txn).to_string(),
            Value::XmlElement(v) => v.get_string(txn),
            Value::XmlFragment(v) => v.get_string(txn),
            Value::XmlText(v) => v.get_string(txn),
            Value::XmlHook(v) => v.to_json(txn).to_string(),
            Value::UndefinedRef(_) => String::new(),
        }
    }
}

impl<T> From<T> for Value
where
    T: Into<Any>,
{
    fn from(v: T) -> Self {
        Value::Any(v.into())
    }
}

macro_rules! impl_try_from {
    ($t:ty) => {
        impl TryFrom<Value> for $t {
            type Error = Value;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    Value::Any(any) => any.try_into().map_err(Value::Any),
                    other => Err(other),
                }
            }
        }
    };
}

impl_try_from!(bool);
impl_try_from!(f64);
impl_try_from!(i64);
impl_try_from!(u32);
impl_try_from!(String);
impl_try_from!(Vec<u8>);

impl ToJson for Value {
    /// Converts the current value into an [Any] JSON-like representation.
    /// Text and XML types are stringified.
    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        match self {
            Value::Any(any) => any.clone(),
            Value::Text(v) => Any::from(v.get_string(txn)),
            Value::Array(v) => v.to_json(txn),
            Value::Map(v) => v.to_json(txn),
            Value::XmlElement(v) => Any::from(v.get_string(txn)),
            Value::XmlFragment(v) => Any::from(v.get_string(txn)),
            Value::XmlText(v) => Any::from(v.get_string(txn)),
            Value::XmlHook(v) => v.to_json(txn),
            Value::UndefinedRef(_) => Any::Undefined,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Any(v) => std::fmt::Display::fmt(v, f),
            Value::Array(_) => write!(f, "ArrayRef"),
            Value::Map(_) => write!(f, "MapRef"),
            Value::Text(_) => write!(f, "TextRef"),
            Value::XmlElement(_) => write!(f, "XmlElementRef"),
            Value::XmlFragment(_) => write!(f, "XmlFragmentRef"),
            Value::XmlText(_) => write!(f, "XmlTextRef"),
            Value::XmlHook(_) => write!(f, "XmlHookRef"),
            Value::UndefinedRef(_) => write!(f, "UndefinedRef"),
        }
    }
}

/// Iterator over non-deleted `(key, item)` entries of a map component.
pub(crate) struct Entries<'a> {
    iter: std::collections::hash_map::Iter<'a, Arc<str>, ItemPtr>,
}

impl<'a> Entries<'a> {
    pub fn new(source: &'a HashMap<Arc<str>, ItemPtr>) -> Self {
        Entries {
            iter: source.iter(),
        }
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a Arc<str>, ItemPtr);

    fn next(&mut self) -> Option<Self::Item> {
        let (mut key, mut ptr) = self.iter.next().map(|(k, v)| (k, *v))?;
        while ptr.is_deleted() {
            let (k, v) = self.iter.next()?;
            key = k;
            ptr = *v;
        }
        Some((key, ptr))
    }
}

/// Type pointer - used to localize a complex [Branch] node within the scope
/// of a document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TypePtr {
    /// Temporary value - used only when a block has been deserialized but not
    /// yet integrated. Fields are rewired during integration.
    Unknown,

    /// Pointer to another branch node. Used by nested data types.
    Branch(BranchPtr),

    /// Temporary state referencing a top-level type by name.
    Named(Arc<str>),

    /// Temporary state referencing a nested type by the id of its item.
    ID(ID),
}

impl TypePtr {
    pub(crate) fn as_branch(&self) -> Option<&BranchPtr> {
        if let TypePtr::Branch(ptr) = self {
            Some(ptr)
        } else {
            None
        }
    }
}

impl std::fmt::Display for TypePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypePtr::Unknown => write!(f, "unknown"),
            TypePtr::Branch(ptr) => {
                if let Some(item) = ptr.item {
                    write!(f, "{}", item.id())
                } else {
                    write!(f, "null")
                }
            }
            TypePtr::ID(id) => write!(f, "{}", id),
            TypePtr::Named(name) => write!(f, "{}", name),
        }
    }
}

/// A path describing the nesting structure between shared collections: a
/// sequence of keys (for map parents) and indexes (for sequence parents).
pub type Path = VecDeque<PathSegment>;

/// A single segment of a [Path].
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// Key of a child shared collection within a map-like type.
    Key(Arc<str>),

    /// Index of a child shared collection within a sequence-like type.
    Index(u32),
}

pub(crate) struct ChangeSet<D> {
    pub added: HashSet<ID>,
    pub deleted: HashSet<ID>,
    pub delta: Vec<D>,
}

impl<D> ChangeSet<D> {
    pub fn new(added: HashSet<ID>, deleted: HashSet<ID>, delta: Vec<D>) -> Self {
        ChangeSet {
            added,
            deleted,
            delta,
        }
    }
}

/// A single change over the sequence component of a shared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A consecutive run of newly inserted elements.
    Added(Vec<Value>),

    /// A consecutive run of removed elements.
    Removed(u32),

    /// A number of consecutive unchanged elements, used to recognize
    /// non-edited spaces between [Change::Added] and/or [Change::Removed].
    Retain(u32),
}

/// A single change over the map component of a shared type.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryChange {
    /// A new value inserted under the entry.
    Inserted(Value),

    /// A change of an old value (1st field) into a new one (2nd field).
    Updated(Value, Value),

    /// A removal of the entry - contains the removed value.
    Removed(Value),
}

/// A single change over a text-like type.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Insertion of a piece of text or an embed, optionally formatted with
    /// the given attributes.
    Inserted(Value, Option<Box<Attrs>>),

    /// Removal of a consecutive range of characters.
    Deleted(u32),

    /// A number of consecutive unchanged characters, optionally annotated
    /// with the attributes applied over the retained range.
    Retain(u32, Option<Box<Attrs>>),
}

/// Map of formatting attributes used by [TextRef] and [XmlTextRef].
pub type Attrs = HashMap<Arc<str>, Any>;

pub(crate) fn event_keys(
    txn: &TransactionMut,
    target: BranchPtr,
    keys_changed: &HashSet<Option<Arc<str>>>,
) -> HashMap<Arc<str>, EntryChange> {
    let mut keys = HashMap::new();
    for opt in keys_changed.iter() {
        if let Some(key) = opt {
            let item = target.map.get(key.as_ref()).cloned();
            if let Some(item) = item.as_deref() {
                if item.id.clock >= txn.before_state.get(&item.id.client) {
                    let mut prev = item.left;
                    while let Some(p) = prev.as_deref() {
                        if !txn.has_added(&p.id) {
                            break;
                        }
                        prev = p.left;
                    }

                    if txn.has_deleted(&item.id) {
                        if let Some(prev) = prev.as_deref() {
                            if txn.has_deleted(&prev.id) {
                                let old_value = prev.content.get_last().unwrap_or_default();
                                keys.insert(key.clone(), EntryChange::Removed(old_value));
                            }
                        }
                    } else {
                        let new_value = item.content.get_last().unwrap_or_default();
                        if let Some(prev) = prev.as_deref() {
                            if txn.has_deleted(&prev.id) {
                                let old_value = prev.content.get_last().unwrap_or_default();
                                keys.insert(key.clone(), EntryChange::Updated(old_value, new_value));
                                continue;
                            }
                        }
                        keys.insert(key.clone(), EntryChange::Inserted(new_value));
                    }
                } else if txn.has_deleted(&item.id) {
                    let old_value = item.content.get_last().unwrap_or_default();
                    keys.insert(key.clone(), EntryChange::Removed(old_value));
                }
            }
        }
    }
    keys
}

pub(crate) fn event_change_set(txn: &TransactionMut, start: Option<ItemPtr>) -> ChangeSet<Change> {
    let mut added = HashSet::new();
    let mut deleted = HashSet::new();
    let mut delta = Vec::new();
    let mut last_op: Option<Change> = None;

    let mut current = start;
    while let Some(item) = current {
        if item.is_deleted() {
            if txn.has_deleted(&item.id) && !txn.has_added(&item.id) {
                let removed = match last_op.take() {
                    None => 0,
                    Some(Change::Removed(c)) => c,
                    Some(other) => {
                        delta.push(other);
                        0
                    }
                };
                last_op = Some(Change::Removed(removed + item.len()));
                deleted.insert(item.id);
            }
        } else if item.is_countable() {
            if txn.has_added(&item.id) {
                let mut inserts = match last_op.take() {
                    None => Vec::with_capacity(item.len() as usize),
                    Some(Change::Added(values)) => values,
                    Some(other) => {
                        delta.push(other);
                        Vec::with_capacity(item.len() as usize)
                    }
                };
                inserts.append(&mut item.content.get_content());
                last_op = Some(Change::Added(inserts));
                added.insert(item.id);
            } else {
                let retain = match last_op.take() {
                    None => 0,
                    Some(Change::Retain(c)) => c,
                    Some(other) => {
                        delta.push(other);
                        0
                    }
                };
                last_op = Some(Change::Retain(retain + item.len()));
            }
        }
        current = item.right;
    }

    match last_op.take() {
        None | Some(Change::Retain(_)) => { /* trailing retains are dropped */ }
        Some(change) => delta.push(change),
    }

    ChangeSet::new(added, deleted, delta)
}

/// A collection of events bubbled up to a common ancestor during deep
/// observer dispatch, ordered root-first.
pub struct Events(Vec<NonNull<Event>>);

impl Events {
    pub(crate) fn new(events: &mut Vec<&Event>) -> Self {
        events.sort_by(|&a, &b| {
            let path1 = a.path();
            let path2 = b.path();
            path1.len().cmp(&path2.len())
        });
        let mut inner = Vec::with_capacity(events.len());
        for &e in events.iter() {
            inner.push(unsafe { NonNull::new_unchecked(e as *const Event as *mut Event) });
        }
        Events(inner)
    }

    pub fn iter(&self) -> EventsIter {
        EventsIter(self.0.iter())
    }
}

pub struct EventsIter<'a>(std::slice::Iter<'a, NonNull<Event>>);

impl<'a> Iterator for EventsIter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        let e = self.0.next()?;
        Some(unsafe { e.as_ref() })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<'a> ExactSizeIterator for EventsIter<'a> {
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Generalized wrapper around events fired by specialized shared data types.
pub enum Event {
    Array(ArrayEvent),
    Map(MapEvent),
    Text(TextEvent),
    XmlFragment(XmlEvent),
    XmlText(XmlTextEvent),
}

impl AsRef<ArrayEvent> for Event {
    fn as_ref(&self) -> &ArrayEvent {
        if let Event::Array(e) = self {
            e
        } else {
            panic!("subscribed callback expected an ArrayRef collection");
        }
    }
}

impl AsRef<MapEvent> for Event {
    fn as_ref(&self) -> &MapEvent {
        if let Event::Map(e) = self {
            e
        } else {
            panic!("subscribed callback expected a MapRef collection");
        }
    }
}

impl AsRef<TextEvent> for Event {
    fn as_ref(&self) -> &TextEvent {
        if let Event::Text(e) = self {
            e
        } else {
            panic!("subscribed callback expected a TextRef collection");
        }
    }
}

impl AsRef<XmlEvent> for Event {
    fn as_ref(&self) -> &XmlEvent {
        if let Event::XmlFragment(e) = self {
            e
        } else {
            panic!("subscribed callback expected an XML node");
        }
    }
}

impl AsRef<XmlTextEvent> for Event {
    fn as_ref(&self) -> &XmlTextEvent {
        if let Event::XmlText(e) = self {
            e
        } else {
            panic!("subscribed callback expected an XmlTextRef collection");
        }
    }
}

impl Event {
    pub(crate) fn set_current_target(&mut self, target: BranchPtr) {
        match self {
            Event::Array(e) => e.current_target = target,
            Event::Map(e) => e.current_target = target,
            Event::Text(e) => e.current_target = target,
            Event::XmlFragment(e) => e.current_target = target,
            Event::XmlText(e) => e.current_target = target,
        }
    }

    pub(crate) fn target_ptr(&self) -> BranchPtr {
        match self {
            Event::Array(e) => e.target,
            Event::Map(e) => e.target,
            Event::Text(e) => e.target,
            Event::XmlFragment(e) => e.target,
            Event::XmlText(e) => e.target,
        }
    }

    /// Path from the root type down to the shared type which triggered this
    /// event.
    pub fn path(&self) -> Path {
        match self {
            Event::Array(e) => e.path(),
            Event::Map(e) => e.path(),
            Event::Text(e) => e.path(),
            Event::XmlFragment(e) => e.path(),
            Event::XmlText(e) => e.path(),
        }
    }

    /// The shared data type which triggered this event.
    pub fn target(&self) -> Value {
        self.target_ptr().into()
    }
}

pub trait ToJson {
    /// Converts the contents of the current type into a JSON-like
    /// representation.
    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any;
}
