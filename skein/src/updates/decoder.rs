use crate::block::ID;
use crate::ClientID;
use bin0::any::Any;
use bin0::decoding::{Cursor, Read};
use bin0::error::Error;
use std::sync::Arc;

/// Values which can be deserialized from the update wire format.
pub trait Decode: Sized {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, Error>;

    /// Deserialize from a standalone byte buffer.
    fn decode_from(data: &[u8]) -> Result<Self, Error> {
        let mut decoder = DecoderV1::new(Cursor::new(data));
        Self::decode(&mut decoder)
    }
}

/// Reader interface of the update wire format, mirroring [super::encoder::Encoder].
pub trait Decoder: Read {
    /// Read a clock value of a delete-set run.
    fn read_ds_clock(&mut self) -> Result<u32, Error> {
        self.read_var()
    }

    /// Read a length of a delete-set run.
    fn read_ds_len(&mut self) -> Result<u32, Error> {
        self.read_var()
    }

    /// Read a left origin identifier.
    fn read_left_id(&mut self) -> Result<ID, Error> {
        Ok(ID::new(self.read_var()?, self.read_var()?))
    }

    /// Read a right origin identifier.
    fn read_right_id(&mut self) -> Result<ID, Error> {
        Ok(ID::new(self.read_var()?, self.read_var()?))
    }

    /// Read a client identifier.
    fn read_client(&mut self) -> Result<ClientID, Error> {
        self.read_var()
    }

    /// Read the info byte of a struct entry.
    fn read_info(&mut self) -> Result<u8, Error> {
        self.read_u8()
    }

    /// Read the discriminator preceding a parent reference; see
    /// [super::encoder::Encoder::write_parent_info].
    fn read_parent_info(&mut self) -> Result<bool, Error> {
        let info: u32 = self.read_var()?;
        Ok(info == 1)
    }

    /// Read the tag of a nested shared-type constructor.
    fn read_type_ref(&mut self) -> Result<u8, Error> {
        let type_ref: u32 = self.read_var()?;
        Ok(type_ref as u8)
    }

    /// Read a content length.
    fn read_len(&mut self) -> Result<u32, Error> {
        self.read_var()
    }

    /// Read an [Any] value in its tagged binary form.
    fn read_any(&mut self) -> Result<Any, Error> {
        Any::decode(self)
    }

    /// Read a map key or type name.
    fn read_key(&mut self) -> Result<Arc<str>, Error> {
        Ok(Arc::from(self.read_string()?))
    }

    /// Read an [Any] value from its JSON text string form.
    fn read_json(&mut self) -> Result<Any, Error> {
        let str = self.read_string()?;
        Any::from_json(str)
    }
}

/// The default (and only) decoder of the update wire format.
pub struct DecoderV1<'a> {
    cursor: Cursor<'a>,
}

impl<'a> DecoderV1<'a> {
    pub fn new(cursor: Cursor<'a>) -> Self {
        DecoderV1 { cursor }
    }

    pub fn has_content(&self) -> bool {
        self.cursor.has_content()
    }
}

impl<'a> From<&'a [u8]> for DecoderV1<'a> {
    fn from(buf: &'a [u8]) -> Self {
        DecoderV1::new(Cursor::new(buf))
    }
}

impl<'a> Read for DecoderV1<'a> {
    fn read_u8(&mut self) -> Result<u8, Error> {
        self.cursor.read_u8()
    }

    fn read_exact(&mut self, len: usize) -> Result<&[u8], Error> {
        self.cursor.read_exact(len)
    }
}

impl<'a> Decoder for DecoderV1<'a> {}
