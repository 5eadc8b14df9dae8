use crate::block::{update_current_attributes, Content, ItemPosition, ItemPtr, Prelim};
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{
    Attrs, Branch, BranchPtr, Delta, GetString, Observable, Path, SharedRef, TypeRef, Value,
};
use bin0::any::Any;
use std::cell::OnceCell;
use std::convert::TryFrom;
use std::sync::Arc;

/// Operations of a shared rich text: a sequence of characters interleaved
/// with embedded objects and zero-width formatting markers. The formatting of
/// any position is the cumulative effect of the markers to its left.
pub trait Text: SharedRef {
    /// Number of characters (and embeds) visible in this text.
    fn len<T: ReadTxn>(&self, _txn: &T) -> u32 {
        self.as_ref().len()
    }

    /// Insert `chunk` at the given character `index`, inheriting the
    /// formatting attributes present at that position.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the text length.
    fn insert(&self, txn: &mut TransactionMut, index: u32, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let branch = BranchPtr::from(self.as_ref());
        let mut pos = find_position(branch, txn, index);
        let attributes = match pos.current_attrs.as_deref() {
            Some(attrs) => attrs.clone(),
            None => Attrs::new(),
        };
        insert_content(branch, txn, &mut pos, Content::String(chunk.into()), attributes);
    }

    /// Insert `chunk` at `index`, formatted with `attributes`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the text length.
    fn insert_with_attributes(
        &self,
        txn: &mut TransactionMut,
        index: u32,
        chunk: &str,
        attributes: Attrs,
    ) {
        if chunk.is_empty() {
            return;
        }
        let branch = BranchPtr::from(self.as_ref());
        let mut pos = find_position(branch, txn, index);
        insert_content(branch, txn, &mut pos, Content::String(chunk.into()), attributes);
    }

    /// Insert an embedded object at the given character `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is greater than the text length.
    fn insert_embed(&self, txn: &mut TransactionMut, index: u32, embed: Any) {
        let branch = BranchPtr::from(self.as_ref());
        let mut pos = find_position(branch, txn, index);
        let attributes = match pos.current_attrs.as_deref() {
            Some(attrs) => attrs.clone(),
            None => Attrs::new(),
        };
        insert_content(branch, txn, &mut pos, Content::Embed(Box::new(embed)), attributes);
    }

    /// Insert an embedded object at `index`, formatted with `attributes`.
    fn insert_embed_with_attributes(
        &self,
        txn: &mut TransactionMut,
        index: u32,
        embed: Any,
        attributes: Attrs,
    ) {
        let branch = BranchPtr::from(self.as_ref());
        let mut pos = find_position(branch, txn, index);
        insert_content(branch, txn, &mut pos, Content::Embed(Box::new(embed)), attributes);
    }

    /// Append `chunk` at the end of the text.
    fn push(&self, txn: &mut TransactionMut, chunk: &str) {
        let len = self.len(txn);
        self.insert(txn, len, chunk)
    }

    /// Apply `attributes` over `len` visible positions starting at `index`.
    /// An attribute mapped to a null value removes that formatting.
    fn format(&self, txn: &mut TransactionMut, index: u32, len: u32, attributes: Attrs) {
        let branch = BranchPtr::from(self.as_ref());
        let pos = find_position(branch, txn, index);
        format_text(branch, txn, pos, len, attributes);
    }

    /// Remove `len` visible positions starting at `index`. Formatting
    /// markers within the range are kept - they still describe the
    /// surrounding content.
    fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        let branch = BranchPtr::from(self.as_ref());
        let pos = find_position(branch, txn, index);
        delete_text(txn, pos, len);
    }

    /// The formatted content of this text as a run-length sequence of
    /// inserts annotated with their formatting attributes.
    fn diff<T: ReadTxn>(&self, _txn: &T) -> Vec<Diff> {
        let mut ops = Vec::new();
        let mut buf = String::new();
        let mut attrs = Attrs::new();
        let mut current = self.as_ref().start;
        fn flush(ops: &mut Vec<Diff>, buf: &mut String, attrs: &Attrs) {
            if !buf.is_empty() {
                ops.push(Diff::new(
                    Value::Any(Any::String(std::mem::take(buf).into_boxed_str())),
                    boxed_attrs(attrs),
                ));
            }
        }
        while let Some(item) = current {
            if !item.is_deleted() {
                match &item.content {
                    Content::String(str) => buf.push_str(str.as_str()),
                    Content::Embed(embed) => {
                        flush(&mut ops, &mut buf, &attrs);
                        ops.push(Diff::new(
                            Value::Any(embed.as_ref().clone()),
                            boxed_attrs(&attrs),
                        ));
                    }
                    Content::Type(branch) => {
                        flush(&mut ops, &mut buf, &attrs);
                        ops.push(Diff::new(BranchPtr::from(branch).into(), boxed_attrs(&attrs)));
                    }
                    Content::Format { key, value } => {
                        flush(&mut ops, &mut buf, &attrs);
                        update_current_attributes(&mut attrs, key, value);
                    }
                    _ => {}
                }
            }
            current = item.right;
        }
        flush(&mut ops, &mut buf, &attrs);
        ops
    }
}

/// A reference to a shared rich text of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRef(BranchPtr);

impl Text for TextRef {}

impl SharedRef for TextRef {}

impl AsRef<Branch> for TextRef {
    fn as_ref(&self) -> &Branch {
        &self.0
    }
}

impl From<BranchPtr> for TextRef {
    fn from(branch: BranchPtr) -> Self {
        TextRef(branch)
    }
}

impl Observable for TextRef {
    type Event = TextEvent;
}

impl GetString for TextRef {
    /// The visible characters of this text. Embedded objects are not part of
    /// the string representation.
    fn get_string<T: ReadTxn>(&self, _txn: &T) -> String {
        let mut out = String::new();
        let mut current = self.as_ref().start;
        while let Some(item) = current {
            if !item.is_deleted() {
                if let Content::String(str) = &item.content {
                    out.push_str(str.as_str());
                }
            }
            current = item.right;
        }
        out
    }
}

impl TryFrom<Value> for TextRef {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Text(text) = value {
            Ok(text)
        } else {
            Err(value)
        }
    }
}

/// A preliminary text, integrated as a nested [TextRef].
#[derive(Debug, Clone, Default)]
pub struct TextPrelim(pub String);

impl Prelim for TextPrelim {
    fn into_content(self, _txn: &mut TransactionMut) -> (Content, Option<Self>) {
        (Content::Type(Branch::new(TypeRef::Text)), Some(self))
    }

    fn integrate(self, txn: &mut TransactionMut, inner_ref: BranchPtr) {
        if !self.0.is_empty() {
            let text = TextRef::from(inner_ref);
            text.insert(txn, 0, &self.0);
        }
    }
}

/// A single run of a text diff.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    pub insert: Value,
    pub attributes: Option<Box<Attrs>>,
}

impl Diff {
    pub fn new(insert: Value, attributes: Option<Box<Attrs>>) -> Self {
        Diff { insert, attributes }
    }
}

fn boxed_attrs(attrs: &Attrs) -> Option<Box<Attrs>> {
    if attrs.is_empty() {
        None
    } else {
        Some(Box::new(attrs.clone()))
    }
}

fn eq_attr(current: Option<&Any>, value: &Any) -> bool {
    match current {
        Some(current) => current == value,
        None => *value == Any::Null,
    }
}

/// Walks `index` countable positions into the sequence, accumulating the
/// formatting attributes seen on the way and splitting the item the position
/// falls into.
///
/// # Panics
///
/// Panics when `index` exceeds the number of visible positions.
pub(crate) fn find_position(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    index: u32,
) -> ItemPosition {
    let mut pos = ItemPosition {
        parent: branch.into(),
        left: None,
        right: branch.start,
        index: 0,
        current_attrs: None,
    };
    let mut count = index;
    while let Some(right) = pos.right {
        if count == 0 {
            break;
        }
        if !right.is_deleted() {
            match &right.content {
                Content::Format { key, value } => {
                    let attrs = pos
                        .current_attrs
                        .get_or_insert_with(|| Box::new(Attrs::new()));
                    update_current_attributes(attrs, key, value);
                }
                _ => {
                    if right.is_countable() {
                        if count < right.len() {
                            txn.split(right, count);
                        }
                        pos.index += right.len();
                        count -= right.len();
                    }
                }
            }
        }
        pos.left = Some(right);
        pos.right = right.right;
    }
    if count > 0 {
        panic!("index {} is beyond the length of the text", index);
    }
    pos
}

/// Advance the cursor past formatting markers which already match the
/// desired attributes, so that no redundant markers are produced.
fn minimize_attribute_changes(pos: &mut ItemPosition, attributes: &Attrs) {
    loop {
        match pos.right {
            None => break,
            Some(right) if right.is_deleted() => {}
            Some(right) => match &right.content {
                Content::Format { key, value } => {
                    if !eq_attr(attributes.get(key), value) {
                        break;
                    }
                }
                _ => break,
            },
        }
        pos.forward();
    }
}

/// Insert the formatting markers which switch the current attributes over to
/// the desired ones. Returns the negation set: the attribute values to
/// restore once the formatted run ends.
fn insert_attributes(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    pos: &mut ItemPosition,
    attributes: &Attrs,
) -> Attrs {
    let mut negated = Attrs::new();
    let mut keys: Vec<&Arc<str>> = attributes.keys().collect();
    keys.sort();
    for key in keys {
        let value = &attributes[key];
        let current = pos.current_attrs.as_deref().and_then(|attrs| attrs.get(key));
        if !eq_attr(current, value) {
            negated.insert(key.clone(), current.cloned().unwrap_or(Any::Null));
            let format = Content::Format {
                key: key.clone(),
                value: Box::new(value.clone()),
            };
            let item = insert_at_position(branch, txn, pos, format);
            pos.right = Some(item);
            pos.forward();
        }
    }
    negated
}

/// Terminate a formatted run: skip markers which already negate correctly,
/// then write the remaining negations.
fn insert_negated_attributes(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    pos: &mut ItemPosition,
    mut negated: Attrs,
) {
    loop {
        let matched = match pos.right {
            None => break,
            Some(right) if right.is_deleted() => true,
            Some(right) => match &right.content {
                Content::Format { key, value } => {
                    if eq_attr(negated.get(key), value) {
                        negated.remove(key);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            },
        };
        if !matched {
            break;
        }
        pos.forward();
    }
    let mut keys: Vec<Arc<str>> = negated.keys().cloned().collect();
    keys.sort();
    for key in keys {
        let value = negated.remove(&key).unwrap();
        let format = Content::Format {
            key,
            value: Box::new(value),
        };
        let item = insert_at_position(branch, txn, pos, format);
        pos.right = Some(item);
        pos.forward();
    }
}

fn insert_at_position(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    pos: &ItemPosition,
    content: Content,
) -> ItemPtr {
    let insert_pos = ItemPosition {
        parent: branch.into(),
        left: pos.left,
        right: pos.right,
        index: 0,
        current_attrs: None,
    };
    txn.create_item_with_content(&insert_pos, content, None)
}

fn insert_content(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    pos: &mut ItemPosition,
    content: Content,
    mut attributes: Attrs,
) {
    // attributes present at the cursor but not requested must be negated
    if let Some(current) = pos.current_attrs.as_deref() {
        for key in current.keys() {
            if !attributes.contains_key(key) {
                attributes.insert(key.clone(), Any::Null);
            }
        }
    }
    minimize_attribute_changes(pos, &attributes);
    let negated = insert_attributes(branch, txn, pos, &attributes);

    let index = pos.index;
    let item = insert_at_position(branch, txn, pos, content);
    pos.right = Some(item);
    pos.index = index;
    pos.forward();

    insert_negated_attributes(branch, txn, pos, negated);
}

fn format_text(
    branch: BranchPtr,
    txn: &mut TransactionMut,
    mut pos: ItemPosition,
    mut len: u32,
    attributes: Attrs,
) {
    minimize_attribute_changes(&mut pos, &attributes);
    let mut negated = insert_attributes(branch, txn, &mut pos, &attributes);

    while len > 0 {
        let right = match pos.right {
            Some(right) => right,
            None => break,
        };
        if !right.is_deleted() {
            match &right.content {
                Content::Format { key, value } => {
                    if let Some(wanted) = attributes.get(key) {
                        if eq_attr(Some(wanted), value) {
                            negated.remove(key);
                        } else {
                            negated.insert(key.clone(), value.as_ref().clone());
                        }
                        txn.delete(right);
                    }
                }
                _ => {
                    if right.is_countable() {
                        if len < right.len() {
                            txn.split(right, len);
                        }
                        len -= right.len();
                    }
                }
            }
        }
        pos.forward();
    }
    // the editor convention: formatting past the end pads with new lines
    if len > 0 {
        let mut newlines = String::with_capacity(len as usize);
        for _ in 0..len {
            newlines.push('\n');
        }
        let item = insert_at_position(branch, txn, &pos, Content::String(newlines.into()));
        pos.right = Some(item);
        pos.forward();
    }
    insert_negated_attributes(branch, txn, &mut pos, negated);
}

fn delete_text(txn: &mut TransactionMut, mut pos: ItemPosition, mut len: u32) {
    while len > 0 {
        let right = match pos.right {
            Some(right) => right,
            None => break,
        };
        if !right.is_deleted() {
            match &right.content {
                Content::Format { .. } => {
                    // markers are kept: they still format the remainder
                }
                _ => {
                    if right.is_countable() {
                        if len < right.len() {
                            txn.split(right, len);
                        }
                        len -= right.len();
                        txn.delete(right);
                        // the deleted item no longer advances the index
                        pos.left = Some(right);
                        pos.right = right.right;
                        continue;
                    }
                }
            }
        }
        pos.forward();
    }
}

/// Event generated by [TextRef::observe] subscriptions.
pub struct TextEvent {
    pub(crate) target: BranchPtr,
    pub(crate) current_target: BranchPtr,
    delta: OnceCell<Vec<Delta>>,
}

impl TextEvent {
    pub(crate) fn new(target: BranchPtr) -> Self {
        TextEvent {
            target,
            current_target: target,
            delta: OnceCell::new(),
        }
    }

    /// The shared text this event refers to.
    pub fn target(&self) -> TextRef {
        TextRef::from(self.target)
    }

    /// Path from the root of the document to the changed text.
    pub fn path(&self) -> Path {
        Branch::path(self.current_target, self.target)
    }

    /// A run-length stream of `insert` / `retain` / `delete` operations with
    /// attribute changes, relative to the attribute state before the
    /// committing transaction.
    pub fn delta(&self, txn: &TransactionMut) -> &[Delta] {
        self.delta
            .get_or_init(|| Self::compute_delta(self.target, txn))
    }

    pub(crate) fn compute_delta(target: BranchPtr, txn: &TransactionMut) -> Vec<Delta> {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Action {
            Insert,
            Retain,
            Delete,
        }

        struct DeltaBuilder {
            delta: Vec<Delta>,
            action: Option<Action>,
            insert: String,
            embed: Option<Value>,
            insert_attrs: Option<Box<Attrs>>,
            retain: u32,
            delete_len: u32,
        }

        impl DeltaBuilder {
            fn add_op(&mut self, attributes: &Attrs) {
                match self.action.take() {
                    None => {}
                    Some(Action::Delete) => {
                        if self.delete_len > 0 {
                            self.delta.push(Delta::Deleted(self.delete_len));
                        }
                        self.delete_len = 0;
                    }
                    Some(Action::Insert) => {
                        if self.embed.is_some() || !self.insert.is_empty() {
                            let value = match self.embed.take() {
                                Some(embed) => embed,
                                None => Value::Any(Any::String(
                                    std::mem::take(&mut self.insert).into_boxed_str(),
                                )),
                            };
                            self.delta.push(Delta::Inserted(value, self.insert_attrs.take()));
                        }
                        self.insert.clear();
                        self.insert_attrs = None;
                    }
                    Some(Action::Retain) => {
                        if self.retain > 0 {
                            let attrs = if attributes.is_empty() {
                                None
                            } else {
                                Some(Box::new(attributes.clone()))
                            };
                            self.delta.push(Delta::Retain(self.retain, attrs));
                        }
                        self.retain = 0;
                    }
                }
            }

            fn switch(&mut self, action: Action, attributes: &Attrs, current: &Attrs) {
                if self.action != Some(action) {
                    self.add_op(attributes);
                    self.action = Some(action);
                    if action == Action::Insert {
                        let live: Attrs = current
                            .iter()
                            .filter(|(_, value)| **value != Any::Null)
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect();
                        self.insert_attrs = if live.is_empty() {
                            None
                        } else {
                            Some(Box::new(live))
                        };
                    }
                }
            }
        }

        let mut builder = DeltaBuilder {
            delta: Vec::new(),
            action: None,
            insert: String::new(),
            embed: None,
            insert_attrs: None,
            retain: 0,
            delete_len: 0,
        };
        let mut current_attrs = Attrs::new();
        let mut old_attrs = Attrs::new();
        // attribute changes accumulated over the current retained run
        let mut attributes = Attrs::new();

        let mut item_ptr = target.start;
        while let Some(item) = item_ptr {
            match &item.content {
                Content::Embed(embed) => {
                    if txn.has_added(&item.id) {
                        if !txn.has_deleted(&item.id) {
                            builder.add_op(&attributes);
                            builder.switch(Action::Insert, &attributes, &current_attrs);
                            builder.embed = Some(Value::Any(embed.as_ref().clone()));
                            builder.add_op(&attributes);
                        }
                    } else if txn.has_deleted(&item.id) {
                        builder.switch(Action::Delete, &attributes, &current_attrs);
                        builder.delete_len += 1;
                    } else if !item.is_deleted() {
                        builder.switch(Action::Retain, &attributes, &current_attrs);
                        builder.retain += 1;
                    }
                }
                Content::String(str) => {
                    if txn.has_added(&item.id) {
                        if !txn.has_deleted(&item.id) {
                            builder.switch(Action::Insert, &attributes, &current_attrs);
                            builder.insert.push_str(str.as_str());
                        }
                    } else if txn.has_deleted(&item.id) {
                        builder.switch(Action::Delete, &attributes, &current_attrs);
                        builder.delete_len += item.len();
                    } else if !item.is_deleted() {
                        builder.switch(Action::Retain, &attributes, &current_attrs);
                        builder.retain += item.len();
                    }
                }
                Content::Format { key, value } => {
                    if txn.has_added(&item.id) {
                        if !txn.has_deleted(&item.id) {
                            let current = current_attrs.get(key);
                            if !eq_attr(current, value) {
                                if builder.action == Some(Action::Retain) {
                                    builder.add_op(&attributes);
                                }
                                if eq_attr(old_attrs.get(key), value) {
                                    attributes.remove(key);
                                } else {
                                    attributes.insert(key.clone(), value.as_ref().clone());
                                }
                            }
                        }
                    } else if txn.has_deleted(&item.id) {
                        old_attrs.insert(key.clone(), value.as_ref().clone());
                        let current = current_attrs.get(key).cloned().unwrap_or(Any::Null);
                        if !eq_attr(Some(&current), value) {
                            if builder.action == Some(Action::Retain) {
                                builder.add_op(&attributes);
                            }
                            attributes.insert(key.clone(), current);
                        }
                    } else if !item.is_deleted() {
                        old_attrs.insert(key.clone(), value.as_ref().clone());
                        if let Some(attr) = attributes.get(key).cloned() {
                            if !eq_attr(Some(&attr), value) {
                                if builder.action == Some(Action::Retain) {
                                    builder.add_op(&attributes);
                                }
                                if **value == Any::Null {
                                    attributes.remove(key);
                                } else {
                                    attributes.insert(key.clone(), value.as_ref().clone());
                                }
                            }
                        }
                    }
                    if !item.is_deleted() {
                        if builder.action == Some(Action::Insert) {
                            builder.add_op(&attributes);
                        }
                        update_current_attributes(&mut current_attrs, key, value);
                    }
                }
                _ => {}
            }
            item_ptr = item.right;
        }
        builder.add_op(&attributes);
        let mut delta = builder.delta;
        while let Some(Delta::Retain(_, None)) = delta.last() {
            delta.pop();
        }
        delta
    }
}
