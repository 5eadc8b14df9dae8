//! Bit masks used by the struct-entry info byte and the var int codecs.

/// Highest bit of a byte.
pub const BIT8: u8 = 0b1000_0000;
/// Second highest bit of a byte.
pub const BIT7: u8 = 0b0100_0000;
/// Third highest bit of a byte.
pub const BIT6: u8 = 0b0010_0000;

/// Lowest 5 bits of a byte.
pub const BITS5: u8 = 0b0001_1111;
/// Lowest 6 bits of a byte.
pub const BITS6: u8 = 0b0011_1111;
/// Lowest 7 bits of a byte.
pub const BITS7: u8 = 0b0111_1111;
