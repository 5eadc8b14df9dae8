//! The three-message synchronization protocol used to bring two peers in
//! sync and keep them there:
//!
//! * `sync-step-1` carries a state vector; the recipient answers with
//!   `sync-step-2` carrying everything the sender has not seen yet.
//! * `update` carries incremental changes produced after the handshake.
//!
//! In a bidirectional handshake both sides send a step-1 and answer the
//! other's with a step-2.

use crate::doc::Doc;
use crate::error::Error;
use crate::struct_store::StateVector;
use crate::transaction::ReadTxn;
use crate::updates::decoder::{Decode, Decoder};
use crate::updates::encoder::{Encode, Encoder};

pub const MSG_SYNC_STEP_1: u8 = 0;
pub const MSG_SYNC_STEP_2: u8 = 1;
pub const MSG_UPDATE: u8 = 2;

/// A single message of the synchronization protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request for everything the sender is missing, described by its state
    /// vector.
    SyncStep1(StateVector),
    /// The diff answering a [Message::SyncStep1].
    SyncStep2(Vec<u8>),
    /// An incremental update, commonly relayed straight from the update
    /// stream of a document.
    Update(Vec<u8>),
}

impl Message {
    /// The opening message of a handshake initiated by `doc`.
    pub fn sync_step_1(doc: &Doc) -> Message {
        Message::SyncStep1(doc.transact().state_vector())
    }
}

impl Encode for Message {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Message::SyncStep1(sv) => {
                encoder.write_var(MSG_SYNC_STEP_1 as u32);
                sv.encode(encoder);
            }
            Message::SyncStep2(update) => {
                encoder.write_var(MSG_SYNC_STEP_2 as u32);
                encoder.write_buf(update);
            }
            Message::Update(update) => {
                encoder.write_var(MSG_UPDATE as u32);
                encoder.write_buf(update);
            }
        }
    }
}

impl Decode for Message {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, bin0::error::Error> {
        let tag: u32 = decoder.read_var()?;
        match tag as u8 {
            MSG_SYNC_STEP_1 => Ok(Message::SyncStep1(StateVector::decode(decoder)?)),
            MSG_SYNC_STEP_2 => Ok(Message::SyncStep2(decoder.read_buf()?.to_vec())),
            MSG_UPDATE => Ok(Message::Update(decoder.read_buf()?.to_vec())),
            other => Err(bin0::error::Error::UnexpectedValue(other)),
        }
    }
}

/// Process an incoming protocol message against `doc`, returning the reply
/// which should be sent back, if the protocol requires one.
pub fn handle_message(doc: &Doc, message: Message) -> Result<Option<Message>, Error> {
    match message {
        Message::SyncStep1(sv) => Ok(Some(Message::SyncStep2(doc.encode_state_as_update(&sv)))),
        Message::SyncStep2(update) | Message::Update(update) => {
            doc.apply_update(&update)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{Array, Map};

    #[test]
    fn message_roundtrip() {
        let doc = Doc::with_client_id(1);
        {
            let array = doc.get_array("values");
            let mut txn = doc.transact_mut();
            array.push_back(&mut txn, 42i64);
        }
        let messages = vec![
            Message::sync_step_1(&doc),
            Message::SyncStep2(doc.encode_state_as_update(&StateVector::default())),
            Message::Update(vec![1, 2, 3]),
        ];
        for message in messages {
            let decoded = Message::decode_from(&message.encode_to_vec()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn handshake_converges_both_peers() {
        let doc_a = Doc::with_client_id(1);
        let doc_b = Doc::with_client_id(2);
        {
            let map = doc_a.get_map("root");
            let mut txn = doc_a.transact_mut();
            map.insert(&mut txn, "a", 1i64);
        }
        {
            let map = doc_b.get_map("root");
            let mut txn = doc_b.transact_mut();
            map.insert(&mut txn, "b", 2i64);
        }
        // A initiates, B answers, then the mirror direction
        let reply = handle_message(&doc_b, Message::sync_step_1(&doc_a)).unwrap();
        if let Some(step2) = reply {
            handle_message(&doc_a, step2).unwrap();
        }
        let reply = handle_message(&doc_a, Message::sync_step_1(&doc_b)).unwrap();
        if let Some(step2) = reply {
            handle_message(&doc_b, step2).unwrap();
        }
        let map_a = doc_a.get_map("root");
        let map_b = doc_b.get_map("root");
        let txn_a = doc_a.transact();
        let txn_b = doc_b.transact();
        assert_eq!(map_a.len(&txn_a), 2);
        assert_eq!(
            map_a.get(&txn_a, "b").map(|value| value.to_string(&txn_a)),
            map_b.get(&txn_b, "b").map(|value| value.to_string(&txn_b))
        );
        assert_eq!(
            map_a.get(&txn_a, "a").map(|value| value.to_string(&txn_a)),
            map_b.get(&txn_b, "a").map(|value| value.to_string(&txn_b))
        );
    }
}
