use crate::block::ID;
use crate::struct_store::StructStore;
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use crate::utils::client_hasher::ClientHasher;
use crate::ClientID;
use bin0::error::Error;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::ops::Range;

/// Per-client set of deleted clock ranges. Within a client the ranges are
/// kept sorted and maximally merged - after [DeleteSet::squash] no two
/// neighbouring ranges can be joined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteSet {
    clients: HashMap<ClientID, Vec<Range<u32>>, BuildHasherDefault<ClientHasher>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        DeleteSet::default()
    }

    /// Collect all tombstoned ranges of a struct store. Used when encoding
    /// the full document state.
    pub(crate) fn from_store(store: &StructStore) -> Self {
        let mut result = DeleteSet::new();
        for (client, blocks) in store.clients() {
            let mut ranges = Vec::new();
            for cell in blocks.iter() {
                if cell.is_deleted() {
                    let start = cell.clock_start();
                    let end = cell.clock_end();
                    if let Some(last) = ranges.last_mut() {
                        let last: &mut Range<u32> = last;
                        if last.end == start {
                            last.end = end;
                            continue;
                        }
                    }
                    ranges.push(start..end);
                }
            }
            if !ranges.is_empty() {
                result.clients.insert(*client, ranges);
            }
        }
        result
    }

    /// Add a deleted range of `len` clock values starting at `id`.
    pub fn insert(&mut self, id: ID, len: u32) {
        if len == 0 {
            return;
        }
        let ranges = self.clients.entry(id.client).or_default();
        let range = id.clock..id.clock + len;
        match ranges.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => ranges.push(range),
        }
    }

    /// Check if given id is covered by this set.
    pub fn is_deleted(&self, id: &ID) -> bool {
        if let Some(ranges) = self.clients.get(&id.client) {
            ranges
                .iter()
                .any(|range| id.clock >= range.start && id.clock < range.end)
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> std::collections::hash_map::Iter<ClientID, Vec<Range<u32>>> {
        self.clients.iter()
    }

    /// Sort ranges of every client and merge every pair of adjacent or
    /// overlapping ones. Afterwards `range[i].end < range[i+1].start` holds
    /// for every client.
    pub fn squash(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_by_key(|range| range.start);
            let mut write = 0;
            for read in 1..ranges.len() {
                let current = ranges[read].clone();
                let last = &mut ranges[write];
                if last.end >= current.start {
                    last.end = last.end.max(current.end);
                } else {
                    write += 1;
                    ranges[write] = current;
                }
            }
            ranges.truncate(write + 1);
        }
        self.clients.retain(|_, ranges| !ranges.is_empty());
    }

    /// Fold `other` into self, re-establishing the squash invariant.
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, mut ranges) in other.clients {
            self.clients
                .entry(client)
                .or_default()
                .append(&mut ranges);
        }
        self.squash();
    }
}

impl Encode for DeleteSet {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_var(self.clients.len());
        // sort by client to keep the output independent from hash order
        let mut clients: Vec<_> = self.clients.iter().collect();
        clients.sort_by(|a, b| b.0.cmp(a.0));
        for (&client, ranges) in clients {
            encoder.write_client(client);
            encoder.write_var(ranges.len());
            for range in ranges.iter() {
                encoder.write_ds_clock(range.start);
                encoder.write_ds_len(range.end - range.start);
            }
        }
    }
}

impl Decode for DeleteSet {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error> {
        let mut set = DeleteSet::new();
        let clients_len: u32 = decoder.read_var()?;
        for _ in 0..clients_len {
            let client = decoder.read_client()?;
            let ranges_len: u32 = decoder.read_var()?;
            let ranges = set.clients.entry(client).or_default();
            ranges.reserve(ranges_len.min(1024) as usize);
            for _ in 0..ranges_len {
                let clock = decoder.read_ds_clock()?;
                let len = decoder.read_ds_len()?;
                ranges.push(clock..clock + len);
            }
        }
        set.squash();
        Ok(set)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_merges_adjacent_runs() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 0), 2);
        ds.insert(ID::new(1, 2), 3);
        ds.insert(ID::new(1, 10), 1);
        let ranges = ds.clients.get(&1).unwrap();
        assert_eq!(ranges.as_slice(), &[0..5, 10..11]);
    }

    #[test]
    fn squash_sorts_and_merges() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 10), 2);
        ds.insert(ID::new(1, 0), 2);
        ds.insert(ID::new(1, 2), 3);
        ds.insert(ID::new(1, 12), 4);
        ds.squash();
        let ranges = ds.clients.get(&1).unwrap();
        assert_eq!(ranges.as_slice(), &[0..5, 10..16]);
        // strict gap between neighbouring runs
        for window in ranges.windows(2) {
            assert!(window[0].end < window[1].start);
        }
    }

    #[test]
    fn roundtrip() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 0), 5);
        ds.insert(ID::new(2, 7), 3);
        ds.squash();
        let decoded = DeleteSet::decode_from(&ds.encode_to_vec()).unwrap();
        assert_eq!(decoded, ds);
    }

    #[test]
    fn is_deleted_lookup() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 5), 3);
        assert!(!ds.is_deleted(&ID::new(1, 4)));
        assert!(ds.is_deleted(&ID::new(1, 5)));
        assert!(ds.is_deleted(&ID::new(1, 7)));
        assert!(!ds.is_deleted(&ID::new(1, 8)));
        assert!(!ds.is_deleted(&ID::new(2, 5)));
    }
}
