use crate::number::VarInt;

/// Sequential writer of binary-encoded data, mirroring [crate::decoding::Read].
pub trait Write {
    /// Append a single byte.
    fn write_u8(&mut self, value: u8);

    /// Append a raw byte sequence without a length prefix.
    fn write_all(&mut self, buf: &[u8]);

    /// Write a variable-length integer.
    fn write_var<T: VarInt>(&mut self, value: T) {
        value.write(self)
    }

    /// Write a length-prefixed byte buffer.
    fn write_buf<B: AsRef<[u8]>>(&mut self, buf: B) {
        let buf = buf.as_ref();
        self.write_var(buf.len());
        self.write_all(buf);
    }

    /// Write a length-prefixed UTF-8 string.
    fn write_string(&mut self, value: &str) {
        self.write_buf(value.as_bytes());
    }

    /// Write a big-endian 32-bit float.
    fn write_f32(&mut self, value: f32) {
        self.write_all(&value.to_be_bytes());
    }

    /// Write a big-endian 64-bit float.
    fn write_f64(&mut self, value: f64) {
        self.write_all(&value.to_be_bytes());
    }

    /// Write a big-endian 64-bit signed integer.
    fn write_i64(&mut self, value: i64) {
        self.write_all(&value.to_be_bytes());
    }
}

impl Write for Vec<u8> {
    fn write_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn write_all(&mut self, buf: &[u8]) {
        self.extend_from_slice(buf);
    }
}
