use crate::block::{Content, ItemPtr, Prelim};
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::map::Map;
use crate::types::text::{Text, TextEvent};
use crate::types::{
    event_change_set, event_keys, Branch, BranchPtr, Change, ChangeSet, Delta, Entries,
    EntryChange, GetString, Observable, Path, SharedRef, ToJson, TypeRef, Value,
};
use bin0::any::Any;
use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;

/// Marker trait for preliminary values which may become XML children.
pub trait XmlPrelim: Prelim {}

/// A node of an XML-shaped tree: either an element with a tag name, a
/// tagless fragment or a text node.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElementRef),
    Fragment(XmlFragmentRef),
    Text(XmlTextRef),
}

impl XmlNode {
    pub(crate) fn try_from_branch(branch: BranchPtr) -> Option<XmlNode> {
        match branch.type_ref() {
            TypeRef::XmlElement(_) => Some(XmlNode::Element(XmlElementRef::from(branch))),
            TypeRef::XmlFragment => Some(XmlNode::Fragment(XmlFragmentRef::from(branch))),
            TypeRef::XmlText => Some(XmlNode::Text(XmlTextRef::from(branch))),
            _ => None,
        }
    }
}

impl GetString for XmlNode {
    fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        match self {
            XmlNode::Element(node) => node.get_string(txn),
            XmlNode::Fragment(node) => node.get_string(txn),
            XmlNode::Text(node) => node.get_string(txn),
        }
    }
}

/// Attribute operations shared by XML elements and XML texts, backed by the
/// map component of the underlying branch.
pub trait Xml: SharedRef {
    /// Set the `value` of the attribute `key`, overwriting a previous value.
    fn insert_attribute<K, V>(&self, txn: &mut TransactionMut, key: K, value: V)
    where
        K: Into<Arc<str>>,
        V: Into<String>,
    {
        let key = key.into();
        let value: String = value.into();
        let branch = BranchPtr::from(self.as_ref());
        let pos = crate::block::ItemPosition {
            parent: branch.into(),
            left: branch.map.get(&key).cloned(),
            right: None,
            index: 0,
            current_attrs: None,
        };
        txn.create_item(&pos, value, Some(key));
    }

    /// The current value of the attribute `key`.
    fn get_attribute<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<String> {
        let value = self.as_ref().get(key)?;
        Some(value.to_string(txn))
    }

    /// Remove the attribute `key`.
    fn remove_attribute(&self, txn: &mut TransactionMut, key: &str) {
        self.as_ref().remove(txn, key);
    }

    /// Iterator over the `(name, value)` attribute pairs.
    fn attributes<'a, T: ReadTxn>(&'a self, txn: &'a T) -> Attributes<'a, T> {
        Attributes {
            entries: self.as_ref().entries(),
            txn,
        }
    }
}

pub struct Attributes<'a, T> {
    entries: Entries<'a>,
    txn: &'a T,
}

impl<'a, T: ReadTxn> Iterator for Attributes<'a, T> {
    type Item = (&'a str, String);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, item) = self.entries.next()?;
        let value = item
            .content
            .get_last()
            .unwrap_or_default()
            .to_string(self.txn);
        Some((key.as_ref(), value))
    }
}

/// Child-list operations shared by XML fragments and elements.
pub trait XmlFragment: SharedRef {
    /// Number of child nodes.
    fn len<T: ReadTxn>(&self, _txn: &T) -> u32 {
        self.as_ref().len()
    }

    /// Insert an XML node at the given `index` among the children.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the number of children.
    fn insert<V: XmlPrelim>(&self, txn: &mut TransactionMut, index: u32, xml: V) -> XmlNode {
        let ptr = self.as_ref().insert_at(txn, index, xml);
        node_of(ptr).expect("unexpected case: integrated XML child is not a node")
    }

    /// Append an XML node at the end of the children.
    fn push_back<V: XmlPrelim>(&self, txn: &mut TransactionMut, xml: V) -> XmlNode {
        let len = self.len(txn);
        self.insert(txn, len, xml)
    }

    /// Remove `len` consecutive children starting at `index`.
    fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        let removed = self.as_ref().remove_at(txn, index, len);
        if removed != len {
            panic!("range {}..{} out of bounds", index, index + len);
        }
    }

    /// The child node stored under `index`.
    fn get<T: ReadTxn>(&self, _txn: &T, index: u32) -> Option<XmlNode> {
        let (content, _) = self.as_ref().get_at(index)?;
        if let Content::Type(branch) = content {
            XmlNode::try_from_branch(BranchPtr::from(branch))
        } else {
            None
        }
    }

    /// Iterator over the child nodes.
    fn children<'a, T: ReadTxn>(&self, txn: &'a T) -> XmlNodes<'a, T> {
        XmlNodes {
            current: self.as_ref().start,
            _txn: txn,
        }
    }
}

pub struct XmlNodes<'a, T> {
    current: Option<ItemPtr>,
    _txn: &'a T,
}

impl<'a, T: ReadTxn> Iterator for XmlNodes<'a, T> {
    type Item = XmlNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(item) = self.current {
            self.current = item.right;
            if !item.is_deleted() {
                if let Content::Type(branch) = &item.content {
                    if let Some(node) = XmlNode::try_from_branch(BranchPtr::from(branch)) {
                        return Some(node);
                    }
                }
            }
        }
        None
    }
}

fn node_of(ptr: ItemPtr) -> Option<XmlNode> {
    if let Content::Type(branch) = &ptr.content {
        XmlNode::try_from_branch(BranchPtr::from(branch))
    } else {
        None
    }
}

/// A tagless sequence of XML nodes, commonly used as the root of an XML
/// document structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlFragmentRef(BranchPtr);

impl XmlFragment for XmlFragmentRef {}

impl SharedRef for XmlFragmentRef {}

impl AsRef<Branch> for XmlFragmentRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for XmlFragmentRef {
    fn from(branch: BranchPtr) -> Self {
        XmlFragmentRef(branch)
    }
}

impl Observable for XmlFragmentRef {
    type Event = XmlEvent;
}

impl GetString for XmlFragmentRef {
    fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        let mut out = String::new();
        for child in self.children(txn) {
            out.push_str(&child.get_string(txn));
        }
        out
    }
}

impl TryFrom<Value> for XmlFragmentRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::XmlFragment(node) = value {
            Ok(node)
        } else {
            Err(value)
        }
    }
}

/// A named XML element with attributes and child nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlElementRef(BranchPtr);

impl XmlElementRef {
    /// Tag name of this element.
    pub fn tag(&self) -> Arc<str> {
        match self.0.type_ref() {
            TypeRef::XmlElement(name) => name.clone(),
            _ => panic!("unexpected case: XML element without a tag name"),
        }
    }
}

impl Xml for XmlElementRef {}

impl XmlFragment for XmlElementRef {}

impl SharedRef for XmlElementRef {}

impl AsRef<Branch> for XmlElementRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for XmlElementRef {
    fn from(branch: BranchPtr) -> Self {
        XmlElementRef(branch)
    }
}

impl Observable for XmlElementRef {
    type Event = XmlEvent;
}

impl GetString for XmlElementRef {
    fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        let tag = self.tag();
        let mut out = String::new();
        out.push('<');
        out.push_str(&tag);
        let mut attributes: Vec<(&str, String)> = self.attributes(txn).collect();
        attributes.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&value);
            out.push('"');
        }
        out.push('>');
        for child in self.children(txn) {
            out.push_str(&child.get_string(txn));
        }
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
        out
    }
}

impl TryFrom<Value> for XmlElementRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::XmlElement(node) = value {
            Ok(node)
        } else {
            Err(value)
        }
    }
}

/// A text node of an XML tree: a rich text which additionally carries
/// attributes of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlTextRef(BranchPtr);

impl Text for XmlTextRef {}

impl Xml for XmlTextRef {}

impl SharedRef for XmlTextRef {}

impl AsRef<Branch> for XmlTextRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for XmlTextRef {
    fn from(branch: BranchPtr) -> Self {
        XmlTextRef(branch)
    }
}

impl Observable for XmlTextRef {
    type Event = XmlTextEvent;
}

impl GetString for XmlTextRef {
    /// The text content with its inline formatting rendered as XML tags,
    /// sorted alphabetically for runs carrying multiple attributes.
    fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        let mut out = String::new();
        for diff in self.diff(txn) {
            let mut keys: Vec<Arc<str>> = diff
                .attributes
                .as_deref()
                .map(|attrs| attrs.keys().cloned().collect())
                .unwrap_or_default();
            keys.sort();
            for key in keys.iter() {
                out.push('<');
                out.push_str(key);
                out.push('>');
            }
            if let Value::Any(Any::String(chunk)) = &diff.insert {
                out.push_str(chunk);
            }
            for key in keys.iter().rev() {
                out.push_str("</");
                out.push_str(key);
                out.push('>');
            }
        }
        out
    }
}

impl TryFrom<Value> for XmlTextRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::XmlText(node) = value {
            Ok(node)
        } else {
            Err(value)
        }
    }
}

/// A map-shaped hook node kept for wire compatibility with documents using
/// editor-specific embedded components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlHookRef(BranchPtr);

impl Map for XmlHookRef {}

impl SharedRef for XmlHookRef {}

impl AsRef<Branch> for XmlHookRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for XmlHookRef {
    fn from(branch: BranchPtr) -> Self {
        XmlHookRef(branch)
    }
}

impl ToJson for XmlHookRef {
    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let mut entries = HashMap::new();
        for (key, value) in Map::iter(self, txn) {
            entries.insert(key.to_string(), value.to_json(txn));
        }
        Any::Map(Box::new(entries))
    }
}

/// A preliminary XML element, integrated as a nested [XmlElementRef].
#[derive(Debug, Clone)]
pub struct XmlElementPrelim {
    pub tag: Arc<str>,
    pub attributes: Vec<(Arc<str>, String)>,
}

impl XmlElementPrelim {
    pub fn empty<S: Into<Arc<str>>>(tag: S) -> Self {
        XmlElementPrelim {
            tag: tag.into(),
            attributes: Vec::new(),
        }
    }
}

impl XmlPrelim for XmlElementPrelim {}

impl Prelim for XmlElementPrelim {
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        (
            Content::Type(Branch::new(TypeRef::XmlElement(self.tag.clone()))),
            Some(self),
        )
    }

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr) {
        let element = XmlElementRef::from(inner_ref);
        for (key, value) in self.attributes {
            element.insert_attribute(txn, key, value);
        }
    }
}

/// A preliminary XML text node, integrated as a nested [XmlTextRef].
#[derive(Debug, Clone, Default)]
pub struct XmlTextPrelim(pub String);

impl XmlPrelim for XmlTextPrelim {}

impl Prelim for XmlTextPrelim {
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        (Content::Type(Branch::new(TypeRef::XmlText)), Some(self))
    }

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr) {
        if !self.0.is_empty() {
            let text = XmlTextRef::from(inner_ref);
            text.insert(txn, 0, &self.0);
        }
    }
}

/// Event generated by [XmlFragmentRef::observe] and [XmlElementRef::observe]
/// subscriptions.
pub struct XmlEvent {
    pub(crate) target: BranchPtr,
    pub(crate) current_target: BranchPtr,
    keys_changed: HashSet<Option<Arc<str>>>,
    keys: OnceCell<HashMap<Arc<str>, EntryChange>>,
    change_set: OnceCell<Box<ChangeSet<Change>>>,
}

impl XmlEvent {
    pub(crate) fn new(target: BranchPtr, keys_changed: HashSet<Option<Arc<str>>>) -> Self {
        XmlEvent {
            target,
            current_target: target,
            keys_changed,
            keys: OnceCell::new(),
            change_set: OnceCell::new(),
        }
    }

    /// The XML node this event refers to.
    pub fn target(&self) -> Option<XmlNode> {
        XmlNode::try_from_branch(self.target)
    }

    /// Path from the root of the document to the changed node.
    pub fn path(&self) -> Path {
        Branch::path(self.current_target, self.target)
    }

    /// A run-length delta describing the changes among the child nodes.
    pub fn delta(&self, txn: &TransactionMut) -> &[Change] {
        &self
            .change_set
            .get_or_init(|| Box::new(event_change_set(txn, self.target.start)))
            .delta
    }

    /// Summary of the attributes changed within the committing transaction.
    pub fn keys(&self, txn: &TransactionMut) -> &HashMap<Arc<str>, EntryChange> {
        self.keys
            .get_or_init(|| event_keys(txn, self.target, &self.keys_changed))
    }
}

/// Event generated by [XmlTextRef::observe] subscriptions.
pub struct XmlTextEvent {
    pub(crate) target: BranchPtr,
    pub(crate) current_target: BranchPtr,
    keys_changed: HashSet<Option<Arc<str>>>,
    keys: OnceCell<HashMap<Arc<str>, EntryChange>>,
    delta: OnceCell<Vec<Delta>>,
}

impl XmlTextEvent {
    pub(crate) fn new(target: BranchPtr, keys_changed: HashSet<Option<Arc<str>>>) -> Self {
        XmlTextEvent {
            target,
            current_target: target,
            keys_changed,
            keys: OnceCell::new(),
            delta: OnceCell::new(),
        }
    }

    /// The shared XML text this event refers to.
    pub fn target(&self) -> XmlTextRef {
        XmlTextRef::from(self.target)
    }

    /// Path from the root of the document to the changed text.
    pub fn path(&self) -> Path {
        Branch::path(self.current_target, self.target)
    }

    /// Text changes made within the committing transaction.
    pub fn delta(&self, txn: &TransactionMut) -> &[Delta] {
        self.delta
            .get_or_init(|| TextEvent::compute_delta(self.target, txn))
    }

    /// Summary of the attributes changed within the committing transaction.
    pub fn keys(&self, txn: &TransactionMut) -> &HashMap<Arc<str>, EntryChange> {
        self.keys
            .get_or_init(|| event_keys(txn, self.target, &self.keys_changed))
    }
}
