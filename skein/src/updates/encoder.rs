use crate::block::ID;
use crate::ClientID;
use bin0::any::Any;
use bin0::encoding::Write;

/// Values which can be serialized into the update wire format.
pub trait Encode {
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Serialize into a standalone byte buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut encoder = EncoderV1::new();
        self.encode(&mut encoder);
        encoder.to_vec()
    }
}

/// Writer interface of the update wire format. The individual methods mirror
/// the places where the format distinguishes between kinds of values; in the
/// v1 format all of them boil down to var ints, strings and raw bytes.
pub trait Encoder: Write {
    fn to_vec(self) -> Vec<u8>
    where
        Self: Sized;

    /// Write a clock value of a delete-set run.
    fn write_ds_clock(&mut self, clock: u32) {
        self.write_var(clock)
    }

    /// Write a length of a delete-set run.
    fn write_ds_len(&mut self, len: u32) {
        self.write_var(len)
    }

    /// Write a left origin identifier.
    fn write_left_id(&mut self, id: &ID) {
        self.write_var(id.client);
        self.write_var(id.clock);
    }

    /// Write a right origin identifier.
    fn write_right_id(&mut self, id: &ID) {
        self.write_var(id.client);
        self.write_var(id.clock);
    }

    /// Write a client identifier.
    fn write_client(&mut self, client: ClientID) {
        self.write_var(client)
    }

    /// Write the info byte of a struct entry.
    fn write_info(&mut self, info: u8) {
        self.write_u8(info)
    }

    /// Write the discriminator preceding a parent reference: `true` for a
    /// root type addressed by name, `false` for a nested type addressed by
    /// the id of its holding item.
    fn write_parent_info(&mut self, is_root: bool) {
        self.write_var(if is_root { 1u32 } else { 0u32 })
    }

    /// Write the tag of a nested shared-type constructor.
    fn write_type_ref(&mut self, type_ref: u8) {
        self.write_var(type_ref as u32)
    }

    /// Write a content length.
    fn write_len(&mut self, len: u32) {
        self.write_var(len)
    }

    /// Write an [Any] value in its tagged binary form.
    fn write_any(&mut self, any: &Any) {
        any.encode(self)
    }

    /// Write a map key or type name.
    fn write_key(&mut self, key: &str) {
        self.write_string(key)
    }

    /// Write an [Any] value as a JSON text string.
    fn write_json(&mut self, any: &Any) {
        let mut buf = String::new();
        any.to_json(&mut buf);
        self.write_string(&buf);
    }
}

/// The default (and only) encoder of the update wire format.
pub struct EncoderV1 {
    buf: Vec<u8>,
}

impl EncoderV1 {
    pub fn new() -> Self {
        EncoderV1 { buf: Vec::new() }
    }
}

impl Default for EncoderV1 {
    fn default() -> Self {
        EncoderV1::new()
    }
}

impl Write for EncoderV1 {
    fn write_u8(&mut self, value: u8) {
        self.buf.push(value)
    }

    fn write_all(&mut self, buf: &[u8]) {
        self.buf.extend_from_slice(buf)
    }
}

impl Encoder for EncoderV1 {
    fn to_vec(self) -> Vec<u8> {
        self.buf
    }
}
