use crate::block::{Content, Item, ItemPtr, GC, ID, BLOCK_GC_REF};
use crate::id_set::DeleteSet;
use crate::struct_store::StateVector;
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::TypePtr;
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};
use crate::utils::client_hasher::ClientHasher;
use crate::ClientID;
use bin0::binary;
use bin0::error::Error;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;

/// A decoded but not yet integrated struct.
#[derive(Debug)]
pub(crate) enum UpdateBlock {
    GC(GC),
    Item(Box<Item>),
}

impl UpdateBlock {
    fn clock_start(&self) -> u32 {
        match self {
            UpdateBlock::GC(gc) => gc.start,
            UpdateBlock::Item(item) => item.id.clock,
        }
    }

    fn len(&self) -> u32 {
        match self {
            UpdateBlock::GC(gc) => gc.len(),
            UpdateBlock::Item(item) => item.len(),
        }
    }
}

type ClientBlocks = HashMap<ClientID, VecDeque<UpdateBlock>, BuildHasherDefault<ClientHasher>>;

/// A decoded binary update: per-client queues of structs (in ascending clock
/// order) plus a delete set. Updates are integrated into a document within a
/// transaction; structs with unresolved dependencies are handed back as a
/// [PendingUpdate].
#[derive(Debug, Default)]
pub struct Update {
    pub(crate) blocks: ClientBlocks,
    pub(crate) delete_set: DeleteSet,
}

/// An update (or a remainder of one) whose structs reference ids that are
/// not present locally yet, together with the state vector describing what
/// is missing.
#[derive(Debug)]
pub struct PendingUpdate {
    pub update: Update,
    /// For every blocked client, the clock up to which its updates are
    /// required before the parked structs can resolve.
    pub missing: StateVector,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.delete_set.is_empty()
    }

    /// State vector describing the upper bound of every client's structs
    /// carried by this update.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::default();
        for (&client, queue) in self.blocks.iter() {
            if let Some(last) = queue.back() {
                sv.set_max(client, last.clock_start() + last.len());
            }
        }
        sv
    }

    /// Fold `other` into this update, keeping per-client queues sorted by
    /// clock. Overlapping ranges are tolerated - integration skips the
    /// already known prefix of every struct.
    pub(crate) fn merge(&mut self, other: Update) {
        for (client, queue) in other.blocks {
            match self.blocks.get_mut(&client) {
                None => {
                    self.blocks.insert(client, queue);
                }
                Some(existing) => {
                    let mut merged = VecDeque::with_capacity(existing.len() + queue.len());
                    let mut left = std::mem::take(existing);
                    let mut right = queue;
                    loop {
                        match (left.front(), right.front()) {
                            (Some(a), Some(b)) => {
                                if a.clock_start() <= b.clock_start() {
                                    merged.push_back(left.pop_front().unwrap());
                                } else {
                                    merged.push_back(right.pop_front().unwrap());
                                }
                            }
                            (Some(_), None) => merged.push_back(left.pop_front().unwrap()),
                            (None, Some(_)) => merged.push_back(right.pop_front().unwrap()),
                            (None, None) => break,
                        }
                    }
                    *existing = merged;
                }
            }
        }
        self.delete_set.merge(other.delete_set);
    }

    /// Integrate all structs of this update whose dependencies (origins,
    /// right origins, parents, and same-client predecessors) are present,
    /// parking the rest. The delete set is applied afterwards; the part of it
    /// that refers to unknown ranges is returned for the pending-deletes
    /// queue.
    pub(crate) fn integrate(
        mut self,
        txn: &mut TransactionMut,
    ) -> (Option<PendingUpdate>, Option<DeleteSet>) {
        let remaining = self.integrate_blocks(txn);
        let remaining_ds = txn.apply_delete(&self.delete_set);
        (remaining, remaining_ds)
    }

    fn integrate_blocks(&mut self, txn: &mut TransactionMut) -> Option<PendingUpdate> {
        if self.blocks.is_empty() {
            return None;
        }
        let mut client_ids: Vec<ClientID> = self.blocks.keys().cloned().collect();
        client_ids.sort();

        let mut stack: Vec<(ClientID, UpdateBlock)> = Vec::new();
        let mut rest: ClientBlocks = HashMap::default();
        let mut missing_sv = StateVector::default();

        // structs of higher client ids go first, mirroring the encoder order
        let mut stack_head = Self::next_target(&mut self.blocks, &mut client_ids);
        while let Some((client, block)) = stack_head.take() {
            let local_clock = txn.store().blocks.get_clock(&client);
            match block {
                UpdateBlock::GC(gc) => {
                    if gc.start > local_clock {
                        // a gap within this client's own sequence
                        missing_sv.set_min(client, gc.start - 1);
                        stack.push((client, UpdateBlock::GC(gc)));
                        Self::add_stack_to_rest(
                            &mut stack,
                            &mut self.blocks,
                            &mut client_ids,
                            &mut rest,
                        );
                    } else if gc.end > local_clock {
                        let offset = local_clock - gc.start;
                        txn.store_mut()
                            .blocks
                            .push_gc(client, GC::new(gc.start + offset, gc.len() - offset));
                    }
                    // otherwise the whole range is already known
                }
                UpdateBlock::Item(mut item) => {
                    if item.id.clock > local_clock {
                        // an update of the same client is missing
                        missing_sv.set_min(client, item.id.clock - 1);
                        stack.push((client, UpdateBlock::Item(item)));
                        Self::add_stack_to_rest(
                            &mut stack,
                            &mut self.blocks,
                            &mut client_ids,
                            &mut rest,
                        );
                    } else if let Some(missing_client) = Self::missing_client(&item, txn) {
                        stack.push((client, UpdateBlock::Item(item)));
                        // jump over to the queue of the missing client
                        let dep = self
                            .blocks
                            .get_mut(&missing_client)
                            .and_then(|queue| queue.pop_front());
                        match dep {
                            Some(dep_block) => {
                                stack_head = Some((missing_client, dep_block));
                                continue;
                            }
                            None => {
                                // this update causally depends on an update
                                // message that has not arrived yet
                                missing_sv.set_min(
                                    missing_client,
                                    txn.store().blocks.get_clock(&missing_client),
                                );
                                Self::add_stack_to_rest(
                                    &mut stack,
                                    &mut self.blocks,
                                    &mut client_ids,
                                    &mut rest,
                                );
                            }
                        }
                    } else {
                        let offset = local_clock - item.id.clock;
                        if offset == 0 || offset < item.len() {
                            item.repair(txn);
                            if let TypePtr::Unknown = item.parent {
                                // contents are unreachable: keep the clock
                                // range as a bare tombstone
                                let start = item.id.clock + offset;
                                let len = item.len() - offset;
                                txn.store_mut().blocks.push_gc(client, GC::new(start, len));
                            } else {
                                let mut ptr = ItemPtr::from(&item);
                                ptr.integrate(txn, offset);
                                txn.store_mut().blocks.push_item(item);
                            }
                        }
                        // otherwise the whole struct is already known
                    }
                }
            }
            stack_head = match stack.pop() {
                Some(entry) => Some(entry),
                None => Self::next_target(&mut self.blocks, &mut client_ids),
            };
        }

        if rest.is_empty() {
            None
        } else {
            Some(PendingUpdate {
                update: Update {
                    blocks: rest,
                    delete_set: DeleteSet::new(),
                },
                missing: missing_sv,
            })
        }
    }

    /// Pop the next struct from the nonempty queue with the highest client
    /// id, dropping exhausted queues along the way.
    fn next_target(
        blocks: &mut ClientBlocks,
        client_ids: &mut Vec<ClientID>,
    ) -> Option<(ClientID, UpdateBlock)> {
        while let Some(&client) = client_ids.last() {
            match blocks.get_mut(&client) {
                Some(queue) => {
                    if let Some(block) = queue.pop_front() {
                        return Some((client, block));
                    }
                    blocks.remove(&client);
                    client_ids.pop();
                }
                None => {
                    client_ids.pop();
                }
            }
        }
        None
    }

    /// Move the whole dependency stack - and everything still queued for the
    /// involved clients - into the parked remainder. Applying any prefix of
    /// a client's queue without the blocked struct would create a gap.
    fn add_stack_to_rest(
        stack: &mut Vec<(ClientID, UpdateBlock)>,
        blocks: &mut ClientBlocks,
        client_ids: &mut Vec<ClientID>,
        rest: &mut ClientBlocks,
    ) {
        // drain newest first, so that prepending keeps clock order
        while let Some((client, block)) = stack.pop() {
            match blocks.remove(&client) {
                Some(remaining_queue) => {
                    let mut queue = VecDeque::with_capacity(remaining_queue.len() + 1);
                    queue.push_back(block);
                    queue.extend(remaining_queue);
                    rest.insert(client, queue);
                }
                None => {
                    let queue = rest.entry(client).or_default();
                    queue.push_front(block);
                }
            }
            client_ids.retain(|entry| *entry != client);
        }
    }

    /// The client this item causally depends on but whose state is not yet
    /// sufficient, if any. Same-client dependencies are implied by the queue
    /// order and never reported.
    fn missing_client(item: &Item, txn: &TransactionMut) -> Option<ClientID> {
        let store = txn.store();
        if let Some(origin) = &item.origin {
            if origin.client != item.id.client
                && origin.clock >= store.blocks.get_clock(&origin.client)
            {
                return Some(origin.client);
            }
        }
        if let Some(right_origin) = &item.right_origin {
            if right_origin.client != item.id.client
                && right_origin.clock >= store.blocks.get_clock(&right_origin.client)
            {
                return Some(right_origin.client);
            }
        }
        if let TypePtr::ID(parent) = &item.parent {
            if parent.client != item.id.client
                && parent.clock >= store.blocks.get_clock(&parent.client)
            {
                return Some(parent.client);
            }
        }
        None
    }
}

impl Decode for Update {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error> {
        let mut blocks: ClientBlocks = HashMap::default();
        let clients_len: u32 = decoder.read_var()?;
        for _ in 0..clients_len {
            let blocks_len: u32 = decoder.read_var()?;
            let client = decoder.read_client()?;
            let mut clock: u32 = decoder.read_var()?;
            let queue = blocks.entry(client).or_insert_with(VecDeque::new);
            queue.reserve(blocks_len.min(4096) as usize);
            for _ in 0..blocks_len {
                let info = decoder.read_info()?;
                match info & binary::BITS5 {
                    BLOCK_GC_REF => {
                        let len = decoder.read_len()?;
                        queue.push_back(UpdateBlock::GC(GC::new(clock, len)));
                        clock += len;
                    }
                    ref_number => {
                        let origin = if info & binary::BIT8 != 0 {
                            Some(decoder.read_left_id()?)
                        } else {
                            None
                        };
                        let right_origin = if info & binary::BIT7 != 0 {
                            Some(decoder.read_right_id()?)
                        } else {
                            None
                        };
                        let cant_copy_parent_info = origin.is_none() && right_origin.is_none();
                        let (parent, parent_sub) = if cant_copy_parent_info {
                            let parent = if decoder.read_parent_info()? {
                                TypePtr::Named(decoder.read_key()?)
                            } else {
                                TypePtr::ID(decoder.read_left_id()?)
                            };
                            let parent_sub = if info & binary::BIT6 != 0 {
                                Some(decoder.read_key()?)
                            } else {
                                None
                            };
                            (parent, parent_sub)
                        } else {
                            (TypePtr::Unknown, None)
                        };
                        let content = Content::decode(decoder, ref_number)?;
                        let item = Item::new(
                            ID::new(client, clock),
                            None,
                            origin,
                            None,
                            right_origin,
                            parent,
                            parent_sub,
                            content,
                        );
                        clock += item.len();
                        queue.push_back(UpdateBlock::Item(item));
                    }
                }
            }
        }
        let delete_set = DeleteSet::decode(decoder)?;
        Ok(Update { blocks, delete_set })
    }
}

impl Encode for Update {
    /// Encode the not-yet-integrated structs back into the update format.
    /// Used mostly for diagnostics and tests; a document's own state is
    /// encoded through its store.
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let mut clients: Vec<(&ClientID, &VecDeque<UpdateBlock>)> = self.blocks.iter().collect();
        clients.sort_by(|a, b| b.0.cmp(a.0));
        encoder.write_var(clients.len());
        for (&client, queue) in clients {
            encoder.write_var(queue.len());
            encoder.write_client(client);
            let first_clock = queue.front().map(UpdateBlock::clock_start).unwrap_or(0);
            encoder.write_var(first_clock);
            for block in queue.iter() {
                match block {
                    UpdateBlock::GC(gc) => {
                        encoder.write_info(BLOCK_GC_REF);
                        encoder.write_len(gc.len());
                    }
                    UpdateBlock::Item(item) => item.encode(encoder, 0),
                }
            }
        }
        self.delete_set.encode(encoder);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::updates::decoder::Decode;

    #[test]
    fn empty_update_roundtrip() {
        let update = Update::default();
        let encoded = update.encode_to_vec();
        let decoded = Update::decode_from(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn truncated_update_is_rejected() {
        let update = Update::default();
        let mut encoded = update.encode_to_vec();
        encoded.pop();
        assert!(Update::decode_from(&encoded).is_err());
    }
}
