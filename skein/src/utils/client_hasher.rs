use std::convert::TryFrom;
use std::hash::Hasher;

// A minimalistic hasher for client ids. Client ids are already random 32-bit
// values, so there is no reason to spin up a real hash function every time a
// client is queried.
#[derive(Default)]
pub struct ClientHasher {
    prefix: u64,
}

impl Hasher for ClientHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.prefix
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() == 4);
        // we only expect a single u32 to be written
        debug_assert!(self.prefix == 0);
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(<&[u8; 4]>::try_from(bytes).unwrap());
        self.prefix = u64::from_ne_bytes(buf);
    }
}
