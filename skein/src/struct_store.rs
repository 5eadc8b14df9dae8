use crate::block::{BlockCell, Item, ItemPtr, GC, ID};
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use crate::utils::client_hasher::ClientHasher;
use crate::ClientID;
use bin0::error::Error;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

/// Map from client id to the next clock value expected from that client.
/// Derived from the struct store as `last.id.clock + last.length` per client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector(HashMap<ClientID, u32, BuildHasherDefault<ClientHasher>>);

impl StateVector {
    /// The next clock expected from `client`; 0 for unknown clients.
    pub fn get(&self, client: &ClientID) -> u32 {
        self.0.get(client).cloned().unwrap_or_default()
    }

    pub fn contains_client(&self, client: &ClientID) -> bool {
        self.0.contains_key(client)
    }

    /// True when `id` has already been observed according to this vector.
    pub fn contains(&self, id: &ID) -> bool {
        id.clock < self.get(&id.client)
    }

    pub fn set_min(&mut self, client: ClientID, clock: u32) {
        match self.0.entry(client) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let value = e.get_mut();
                *value = (*value).min(clock);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(clock);
            }
        }
    }

    pub fn set_max(&mut self, client: ClientID, clock: u32) {
        let value = self.0.entry(client).or_default();
        *value = (*value).max(clock);
    }

    pub fn inc_by(&mut self, client: ClientID, delta: u32) {
        *self.0.entry(client).or_default() += delta;
    }

    pub fn iter(&self) -> std::collections::hash_map::Iter<ClientID, u32> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Encode for StateVector {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_var(self.0.len());
        // sorted so that equal vectors produce equal bytes
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_by_key(|(client, _)| **client);
        for (&client, &clock) in entries {
            encoder.write_client(client);
            encoder.write_var(clock);
        }
    }
}

impl Decode for StateVector {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error> {
        let len: u32 = decoder.read_var()?;
        let mut vector = StateVector::default();
        for _ in 0..len {
            let client = decoder.read_client()?;
            let clock = decoder.read_var()?;
            if clock > 0 {
                vector.0.insert(client, clock);
            }
        }
        Ok(vector)
    }
}

/// A single client's structs, sorted by clock and gap-free: the struct at
/// index `i + 1` begins exactly at `structs[i].clock_end()`.
#[derive(Debug, Default)]
pub(crate) struct ClientStructList {
    list: Vec<BlockCell>,
}

impl ClientStructList {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BlockCell> {
        self.list.get(index)
    }

    /// Next clock value to be produced by this client.
    pub fn clock(&self) -> u32 {
        self.list.last().map(BlockCell::clock_end).unwrap_or(0)
    }

    pub fn first_clock(&self) -> u32 {
        self.list.first().map(BlockCell::clock_start).unwrap_or(0)
    }

    /// Binary search for the index of the struct covering `clock`.
    pub fn find_pivot(&self, clock: u32) -> Option<usize> {
        if self.list.is_empty() {
            return None;
        }
        let mut left = 0usize;
        let mut right = self.list.len() - 1;
        if clock >= self.list[right].clock_end() {
            return None;
        }
        while left <= right {
            let mid = (left + right) / 2;
            let cell = &self.list[mid];
            if clock < cell.clock_start() {
                right = mid.checked_sub(1)?;
            } else if clock >= cell.clock_end() {
                left = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    pub fn push(&mut self, cell: BlockCell) {
        debug_assert!(cell.clock_start() == self.clock());
        self.list.push(cell);
    }

    pub fn insert(&mut self, index: usize, cell: BlockCell) {
        self.list.insert(index, cell);
    }

    pub fn remove(&mut self, index: usize) -> BlockCell {
        self.list.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<BlockCell> {
        self.list.iter()
    }
}

impl std::ops::Index<usize> for ClientStructList {
    type Output = BlockCell;

    fn index(&self, index: usize) -> &BlockCell {
        &self.list[index]
    }
}

impl std::ops::IndexMut<usize> for ClientStructList {
    fn index_mut(&mut self, index: usize) -> &mut BlockCell {
        &mut self.list[index]
    }
}

/// Append-only per-client struct vectors of everything integrated into a
/// document: live items, tombstones and garbage-collected ranges.
#[derive(Debug, Default)]
pub(crate) struct StructStore {
    clients: HashMap<ClientID, ClientStructList, BuildHasherDefault<ClientHasher>>,
}

impl StructStore {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(
        &self,
    ) -> std::collections::hash_map::Iter<ClientID, ClientStructList> {
        self.clients.iter()
    }

    pub fn get_client(&self, client: &ClientID) -> Option<&ClientStructList> {
        self.clients.get(client)
    }

    pub fn get_client_mut(&mut self, client: &ClientID) -> Option<&mut ClientStructList> {
        self.clients.get_mut(client)
    }

    pub fn get_state_vector(&self) -> StateVector {
        let mut vector = StateVector::default();
        for (&client, list) in self.clients.iter() {
            vector.set_max(client, list.clock());
        }
        vector
    }

    /// Next clock value expected from `client`.
    pub fn get_clock(&self, client: &ClientID) -> u32 {
        self.clients
            .get(client)
            .map(ClientStructList::clock)
            .unwrap_or(0)
    }

    /// The struct covering `id`, if integrated.
    pub fn get(&self, id: &ID) -> Option<&BlockCell> {
        let list = self.clients.get(&id.client)?;
        let index = list.find_pivot(id.clock)?;
        list.get(index)
    }

    /// The item covering `id`. Returns `None` both for unknown ids and for
    /// ids covered by garbage-collected ranges.
    pub fn get_item(&self, id: &ID) -> Option<ItemPtr> {
        match self.get(id)? {
            BlockCell::Item(item) => Some(ItemPtr::from(item)),
            BlockCell::GC(_) => None,
        }
    }

    /// Append a freshly integrated item. The item graph is append-only per
    /// client: a gap or overlap means the engine state is corrupted.
    pub fn push_item(&mut self, item: Box<Item>) {
        let client = item.id.client;
        let list = self.clients.entry(client).or_default();
        if item.id.clock != list.clock() {
            panic!(
                "unexpected case: struct store gap (client {} expected clock {}, got {})",
                client,
                list.clock(),
                item.id.clock
            );
        }
        list.push(BlockCell::Item(item));
    }

    /// Append a garbage-collected range decoded from a remote update.
    pub fn push_gc(&mut self, client: ClientID, gc: GC) {
        let list = self.clients.entry(client).or_default();
        if gc.start != list.clock() {
            panic!(
                "unexpected case: struct store gap (client {} expected clock {}, got {})",
                client,
                list.clock(),
                gc.start
            );
        }
        list.push(BlockCell::GC(gc));
    }

    /// Split the item behind `ptr` at `offset` clock values from its start,
    /// inserting the right twin into the struct vector. Returns the twin.
    pub fn split_block(&mut self, mut ptr: ItemPtr, offset: u32) -> Option<ItemPtr> {
        if offset == 0 || offset >= ptr.len() {
            return None;
        }
        let id = *ptr.id();
        let list = self.clients.get_mut(&id.client)?;
        let index = list.find_pivot(id.clock)?;
        let right = ptr.splice(offset)?;
        let right_ptr = ItemPtr::from(&right);
        list.insert(index + 1, BlockCell::Item(right));
        Some(right_ptr)
    }

    /// Replace the item starting at `id` with a garbage-collected range of
    /// the same span, dropping its payload.
    pub fn replace_with_gc(&mut self, id: &ID) {
        let list = self
            .clients
            .get_mut(&id.client)
            .expect("unexpected case: gc of an unknown client");
        let index = list
            .find_pivot(id.clock)
            .expect("unexpected case: gc of an unknown struct");
        let cell = &mut list[index];
        *cell = BlockCell::GC(GC {
            start: cell.clock_start(),
            end: cell.clock_end(),
        });
    }
}

impl std::fmt::Display for StructStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        for (client, list) in self.clients.iter() {
            writeln!(f, "  {} ->", client)?;
            for cell in list.iter() {
                match cell {
                    BlockCell::GC(gc) => writeln!(f, "    gc({}..{})", gc.start, gc.end)?,
                    BlockCell::Item(item) => writeln!(f, "    {}", item)?,
                }
            }
        }
        write!(f, "}}")
    }
}
