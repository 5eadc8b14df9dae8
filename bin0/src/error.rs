use thiserror::Error;

/// Errors produced while reading binary-encoded payloads. All of them mean
/// that the input could not be interpreted and the containing message must be
/// rejected as a whole.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// A variable-length unsigned integer did not terminate within the 35
    /// bits allowed for a 32-bit value.
    #[error("while reading a var int, the maximum allowed size of 35 bits was exceeded")]
    IntegerOutOfRange,

    /// The reader ran past the end of the underlying buffer.
    #[error("end of buffer reached while more bytes were expected")]
    EndOfBuffer,

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("decoded data is not a valid utf-8 string")]
    InvalidString,

    /// A JSON payload could not be parsed; carries the byte offset of the
    /// first offending character.
    #[error("malformed JSON payload at offset {0}")]
    InvalidJson(usize),

    /// An unknown tag byte was found where a type marker was expected.
    #[error("unexpected value tag: {0}")]
    UnexpectedValue(u8),
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidString
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Error::InvalidString
    }
}
