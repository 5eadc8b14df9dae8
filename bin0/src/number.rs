use crate::binary;
use crate::decoding::Read;
use crate::encoding::Write;
use crate::error::Error;
use std::convert::TryFrom;

/// Unsigned integers with a 7-bits-per-byte variable-length representation.
/// The lowest 7 bits of every byte carry payload, the highest bit marks
/// continuation.
pub trait VarInt: Sized + Copy {
    fn write<W: Write + ?Sized>(self, writer: &mut W);
    fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

fn write_var_u64<W: Write + ?Sized>(mut num: u64, writer: &mut W) {
    while num >= 0x80 {
        writer.write_u8(binary::BIT8 | (num as u8 & binary::BITS7));
        num >>= 7;
    }
    writer.write_u8(num as u8);
}

fn read_var_u64<R: Read + ?Sized>(reader: &mut R, max_bits: u32) -> Result<u64, Error> {
    let mut num: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = reader.read_u8()?;
        num |= ((byte & binary::BITS7) as u64) << shift;
        if byte < binary::BIT8 {
            return Ok(num);
        }
        shift += 7;
        if shift > max_bits {
            return Err(Error::IntegerOutOfRange);
        }
    }
}

impl VarInt for u32 {
    fn write<W: Write + ?Sized>(self, writer: &mut W) {
        write_var_u64(self as u64, writer)
    }

    fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let num = read_var_u64(reader, 35)?;
        u32::try_from(num).map_err(|_| Error::IntegerOutOfRange)
    }
}

impl VarInt for u64 {
    fn write<W: Write + ?Sized>(self, writer: &mut W) {
        write_var_u64(self, writer)
    }

    fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        read_var_u64(reader, 63)
    }
}

impl VarInt for usize {
    fn write<W: Write + ?Sized>(self, writer: &mut W) {
        write_var_u64(self as u64, writer)
    }

    fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let num = read_var_u64(reader, 63)?;
        usize::try_from(num).map_err(|_| Error::IntegerOutOfRange)
    }
}

/// Signed integers use the 6 lowest bits of the first byte for payload, with
/// a sign flag on the 7th bit, then continue with unsigned 7-bit groups.
impl VarInt for i64 {
    fn write<W: Write + ?Sized>(self, writer: &mut W) {
        let is_negative = self < 0;
        // go through i128 so that i64::MIN does not overflow on negation
        let mut num = if is_negative {
            (-(self as i128)) as u64
        } else {
            self as u64
        };
        let mut first = (num as u8) & binary::BITS6;
        if is_negative {
            first |= binary::BIT7;
        }
        num >>= 6;
        if num > 0 {
            first |= binary::BIT8;
        }
        writer.write_u8(first);
        while num > 0 {
            let mut byte = (num as u8) & binary::BITS7;
            num >>= 7;
            if num > 0 {
                byte |= binary::BIT8;
            }
            writer.write_u8(byte);
        }
    }

    fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let first = reader.read_u8()?;
        let is_negative = first & binary::BIT7 != 0;
        let mut num = (first & binary::BITS6) as u64;
        if first & binary::BIT8 != 0 {
            let mut shift: u32 = 6;
            loop {
                let byte = reader.read_u8()?;
                num |= ((byte & binary::BITS7) as u64) << shift;
                if byte < binary::BIT8 {
                    break;
                }
                shift += 7;
                if shift > 69 {
                    return Err(Error::IntegerOutOfRange);
                }
            }
        }
        if is_negative {
            Ok(-(num as i64))
        } else {
            Ok(num as i64)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoding::Cursor;
    use proptest::prelude::*;

    fn roundtrip<T: VarInt + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.write(&mut buf);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(T::read(&mut cursor).unwrap(), value);
    }

    #[test]
    fn var_uint_boundaries() {
        for &v in &[0u32, 1, 127, 128, 16383, 16384, u32::max_value()] {
            roundtrip(v);
        }
    }

    #[test]
    fn var_int_boundaries() {
        for &v in &[0i64, -1, 1, 63, -63, 64, -64, i64::max_value(), i64::min_value() + 1] {
            roundtrip(v);
        }
    }

    #[test]
    fn var_uint_overflow_is_rejected() {
        // six continuation bytes push a u32 past its 35 bit budget
        let buf = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut cursor = Cursor::new(&buf);
        assert_eq!(u32::read(&mut cursor), Err(Error::IntegerOutOfRange));
    }

    proptest! {
        #[test]
        fn var_u32_roundtrip(value in any::<u32>()) {
            roundtrip(value);
        }

        #[test]
        fn var_u64_roundtrip(value in any::<u64>()) {
            roundtrip(value);
        }

        #[test]
        fn var_i64_roundtrip(value in (i64::min_value() + 1)..i64::max_value()) {
            roundtrip(value);
        }
    }
}
