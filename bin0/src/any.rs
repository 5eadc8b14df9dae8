use crate::decoding::Read;
use crate::encoding::Write;
use crate::error::Error;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Write as _;

/// A JSON-superset value. Every user-supplied cell stored inside a shared
/// document is represented as an [Any]. `Undefined` and `Null` are distinct:
/// the wire format preserves the difference.
#[derive(Debug, Clone, PartialEq)]
pub enum Any {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(Box<str>),
    Buffer(Box<[u8]>),
    Array(Box<[Any]>),
    Map(Box<HashMap<String, Any>>),
}

/// Binary type tags, counting down from 127 so that future variants can be
/// appended without clashing with the struct-entry info byte space.
const TAG_UNDEFINED: u8 = 127;
const TAG_NULL: u8 = 126;
const TAG_INTEGER: u8 = 125;
const TAG_FLOAT32: u8 = 124;
const TAG_FLOAT64: u8 = 123;
const TAG_BIGINT: u8 = 122;
const TAG_FALSE: u8 = 121;
const TAG_TRUE: u8 = 120;
const TAG_STRING: u8 = 119;
const TAG_MAP: u8 = 118;
const TAG_ARRAY: u8 = 117;
const TAG_BUFFER: u8 = 116;

impl Any {
    /// Encode this value using the tagged binary representation.
    pub fn encode<W: Write + ?Sized>(&self, writer: &mut W) {
        match self {
            Any::Undefined => writer.write_u8(TAG_UNDEFINED),
            Any::Null => writer.write_u8(TAG_NULL),
            Any::Bool(true) => writer.write_u8(TAG_TRUE),
            Any::Bool(false) => writer.write_u8(TAG_FALSE),
            Any::Number(num) => {
                if num.fract() == 0.0 && num.abs() <= (1u64 << 30) as f64 {
                    writer.write_u8(TAG_INTEGER);
                    writer.write_var(*num as i64);
                } else if (*num as f32) as f64 == *num {
                    writer.write_u8(TAG_FLOAT32);
                    writer.write_f32(*num as f32);
                } else {
                    writer.write_u8(TAG_FLOAT64);
                    writer.write_f64(*num);
                }
            }
            Any::BigInt(num) => {
                writer.write_u8(TAG_BIGINT);
                writer.write_i64(*num);
            }
            Any::String(str) => {
                writer.write_u8(TAG_STRING);
                writer.write_string(str);
            }
            Any::Buffer(buf) => {
                writer.write_u8(TAG_BUFFER);
                writer.write_buf(buf);
            }
            Any::Array(values) => {
                writer.write_u8(TAG_ARRAY);
                writer.write_var(values.len());
                for value in values.iter() {
                    value.encode(writer);
                }
            }
            Any::Map(entries) => {
                writer.write_u8(TAG_MAP);
                writer.write_var(entries.len());
                for (key, value) in entries.iter() {
                    writer.write_string(key);
                    value.encode(writer);
                }
            }
        }
    }

    /// Decode a value written by [Any::encode].
    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match reader.read_u8()? {
            TAG_UNDEFINED => Ok(Any::Undefined),
            TAG_NULL => Ok(Any::Null),
            TAG_TRUE => Ok(Any::Bool(true)),
            TAG_FALSE => Ok(Any::Bool(false)),
            TAG_INTEGER => {
                let num: i64 = reader.read_var()?;
                Ok(Any::Number(num as f64))
            }
            TAG_FLOAT32 => Ok(Any::Number(reader.read_f32()? as f64)),
            TAG_FLOAT64 => Ok(Any::Number(reader.read_f64()?)),
            TAG_BIGINT => Ok(Any::BigInt(reader.read_i64()?)),
            TAG_STRING => Ok(Any::String(reader.read_string()?.into())),
            TAG_BUFFER => Ok(Any::Buffer(reader.read_buf()?.into())),
            TAG_ARRAY => {
                let len: usize = reader.read_var()?;
                let mut values = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    values.push(Any::decode(reader)?);
                }
                Ok(Any::Array(values.into_boxed_slice()))
            }
            TAG_MAP => {
                let len: usize = reader.read_var()?;
                let mut entries = HashMap::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = reader.read_string()?.to_string();
                    entries.insert(key, Any::decode(reader)?);
                }
                Ok(Any::Map(Box::new(entries)))
            }
            tag => Err(Error::UnexpectedValue(tag)),
        }
    }

    /// Serialize into JSON text. `Undefined` renders as the bare literal
    /// `undefined` the same way the original wire format does.
    pub fn to_json(&self, buf: &mut String) {
        match self {
            Any::Undefined => buf.push_str("undefined"),
            Any::Null => buf.push_str("null"),
            Any::Bool(true) => buf.push_str("true"),
            Any::Bool(false) => buf.push_str("false"),
            Any::Number(num) => {
                if num.fract() == 0.0 && num.abs() < 1e15 {
                    let _ = write!(buf, "{}", *num as i64);
                } else {
                    let _ = write!(buf, "{}", num);
                }
            }
            Any::BigInt(num) => {
                let _ = write!(buf, "{}", num);
            }
            Any::String(str) => write_json_string(str, buf),
            Any::Buffer(bytes) => {
                // buffers have no JSON mapping; render as an array of numbers
                buf.push('[');
                let mut first = true;
                for byte in bytes.iter() {
                    if !first {
                        buf.push(',');
                    }
                    first = false;
                    let _ = write!(buf, "{}", byte);
                }
                buf.push(']');
            }
            Any::Array(values) => {
                buf.push('[');
                let mut first = true;
                for value in values.iter() {
                    if !first {
                        buf.push(',');
                    }
                    first = false;
                    value.to_json(buf);
                }
                buf.push(']');
            }
            Any::Map(entries) => {
                buf.push('{');
                // keep key order stable so that equal maps serialize equally
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                let mut first = true;
                for key in keys {
                    if !first {
                        buf.push(',');
                    }
                    first = false;
                    write_json_string(key, buf);
                    buf.push(':');
                    entries[key].to_json(buf);
                }
                buf.push('}');
            }
        }
    }

    /// Parse JSON text. The bare literal `undefined` is accepted and maps to
    /// [Any::Undefined].
    pub fn from_json(src: &str) -> Result<Self, Error> {
        let mut parser = JsonParser {
            bytes: src.as_bytes(),
            pos: 0,
        };
        parser.skip_whitespace();
        let value = parser.parse_value()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            Err(Error::InvalidJson(parser.pos))
        } else {
            Ok(value)
        }
    }
}

impl std::fmt::Display for Any {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = String::new();
        self.to_json(&mut buf);
        f.write_str(&buf)
    }
}

fn write_json_string(str: &str, buf: &mut String) {
    buf.push('"');
    for c in str.chars() {
        match c {
            '"' => buf.push_str("\\\""),
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(buf, "\\u{:04x}", c as u32);
            }
            c => buf.push(c),
        }
    }
    buf.push('"');
}

struct JsonParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> JsonParser<'a> {
    fn error<T>(&self) -> Result<T, Error> {
        Err(Error::InvalidJson(self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, expected: u8) -> Result<(), Error> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            self.error()
        }
    }

    fn eat_literal(&mut self, literal: &str) -> Result<(), Error> {
        let end = self.pos + literal.len();
        if self.bytes.len() >= end && &self.bytes[self.pos..end] == literal.as_bytes() {
            self.pos = end;
            Ok(())
        } else {
            self.error()
        }
    }

    fn parse_value(&mut self) -> Result<Any, Error> {
        match self.peek() {
            Some(b'n') => {
                self.eat_literal("null")?;
                Ok(Any::Null)
            }
            Some(b'u') => {
                self.eat_literal("undefined")?;
                Ok(Any::Undefined)
            }
            Some(b't') => {
                self.eat_literal("true")?;
                Ok(Any::Bool(true))
            }
            Some(b'f') => {
                self.eat_literal("false")?;
                Ok(Any::Bool(false))
            }
            Some(b'"') => Ok(Any::String(self.parse_string()?.into())),
            Some(b'[') => self.parse_array(),
            Some(b'{') => self.parse_map(),
            Some(b) if b == b'-' || b.is_ascii_digit() => self.parse_number(),
            _ => self.error(),
        }
    }

    fn parse_number(&mut self) -> Result<Any, Error> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' | b'+' | b'-' => {
                    is_float = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])?;
        if !is_float {
            if let Ok(num) = text.parse::<i64>() {
                return if num.abs() <= 1i64 << 52 {
                    Ok(Any::Number(num as f64))
                } else {
                    Ok(Any::BigInt(num))
                };
            }
        }
        match text.parse::<f64>() {
            Ok(num) => Ok(Any::Number(num)),
            Err(_) => self.error(),
        }
    }

    fn parse_string(&mut self) -> Result<String, Error> {
        self.eat(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return self.error(),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'"') => out.push('"'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'/') => out.push('/'),
                        Some(b'n') => out.push('\n'),
                        Some(b'r') => out.push('\r'),
                        Some(b't') => out.push('\t'),
                        Some(b'b') => out.push('\u{0008}'),
                        Some(b'f') => out.push('\u{000c}'),
                        Some(b'u') => {
                            if self.pos + 5 > self.bytes.len() {
                                return self.error();
                            }
                            let hex = std::str::from_utf8(&self.bytes[self.pos + 1..self.pos + 5])?;
                            let code = u32::from_str_radix(hex, 16).or_else(|_| self.error())?;
                            // surrogate pairs are not reassembled; map them to
                            // the replacement character
                            out.push(char::try_from(code).unwrap_or('\u{fffd}'));
                            self.pos += 4;
                        }
                        _ => return self.error(),
                    }
                    self.pos += 1;
                }
                Some(b) if b < 0x80 => {
                    out.push(b as char);
                    self.pos += 1;
                }
                Some(_) => {
                    // multi-byte UTF-8 sequence; take the whole char
                    let rest = std::str::from_utf8(&self.bytes[self.pos..])?;
                    let c = rest.chars().next().ok_or(Error::InvalidJson(self.pos))?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn parse_array(&mut self) -> Result<Any, Error> {
        self.eat(b'[')?;
        let mut values = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Any::Array(values.into_boxed_slice()));
        }
        loop {
            self.skip_whitespace();
            values.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Any::Array(values.into_boxed_slice()));
                }
                _ => return self.error(),
            }
        }
    }

    fn parse_map(&mut self) -> Result<Any, Error> {
        self.eat(b'{')?;
        let mut entries = HashMap::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Any::Map(Box::new(entries)));
        }
        loop {
            self.skip_whitespace();
            let key = self.parse_string()?;
            self.skip_whitespace();
            self.eat(b':')?;
            self.skip_whitespace();
            entries.insert(key, self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Any::Map(Box::new(entries)));
                }
                _ => return self.error(),
            }
        }
    }
}

impl From<bool> for Any {
    fn from(value: bool) -> Self {
        Any::Bool(value)
    }
}

impl From<f64> for Any {
    fn from(value: f64) -> Self {
        Any::Number(value)
    }
}

impl From<f32> for Any {
    fn from(value: f32) -> Self {
        Any::Number(value as f64)
    }
}

impl From<i64> for Any {
    fn from(value: i64) -> Self {
        if value.abs() <= 1i64 << 52 {
            Any::Number(value as f64)
        } else {
            Any::BigInt(value)
        }
    }
}

impl From<i32> for Any {
    fn from(value: i32) -> Self {
        Any::Number(value as f64)
    }
}

impl From<u32> for Any {
    fn from(value: u32) -> Self {
        Any::Number(value as f64)
    }
}

impl From<&str> for Any {
    fn from(value: &str) -> Self {
        Any::String(value.into())
    }
}

impl From<String> for Any {
    fn from(value: String) -> Self {
        Any::String(value.into_boxed_str())
    }
}

impl From<Vec<u8>> for Any {
    fn from(value: Vec<u8>) -> Self {
        Any::Buffer(value.into_boxed_slice())
    }
}

impl From<Vec<Any>> for Any {
    fn from(value: Vec<Any>) -> Self {
        Any::Array(value.into_boxed_slice())
    }
}

impl From<HashMap<String, Any>> for Any {
    fn from(value: HashMap<String, Any>) -> Self {
        Any::Map(Box::new(value))
    }
}

impl<T> From<Option<T>> for Any
where
    T: Into<Any>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            None => Any::Null,
            Some(value) => value.into(),
        }
    }
}

macro_rules! impl_try_from_any {
    ($t:ty, $variant:path) => {
        impl TryFrom<Any> for $t {
            type Error = Any;

            fn try_from(value: Any) -> Result<Self, Self::Error> {
                match value {
                    $variant(inner) => Ok(inner.into()),
                    other => Err(other),
                }
            }
        }
    };
}

impl_try_from_any!(bool, Any::Bool);
impl_try_from_any!(f64, Any::Number);
impl_try_from_any!(String, Any::String);

impl TryFrom<Any> for i64 {
    type Error = Any;

    fn try_from(value: Any) -> Result<Self, Self::Error> {
        match value {
            Any::BigInt(num) => Ok(num),
            Any::Number(num) if num.fract() == 0.0 => Ok(num as i64),
            other => Err(other),
        }
    }
}

impl TryFrom<Any> for u32 {
    type Error = Any;

    fn try_from(value: Any) -> Result<Self, Self::Error> {
        match value {
            Any::Number(num) if num.fract() == 0.0 && num >= 0.0 && num <= u32::max_value() as f64 => {
                Ok(num as u32)
            }
            other => Err(other),
        }
    }
}

impl TryFrom<Any> for Vec<u8> {
    type Error = Any;

    fn try_from(value: Any) -> Result<Self, Self::Error> {
        match value {
            Any::Buffer(buf) => Ok(buf.into_vec()),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoding::Cursor;

    fn roundtrip(value: Any) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(Any::decode(&mut cursor).unwrap(), value);
    }

    #[test]
    fn binary_roundtrip() {
        roundtrip(Any::Null);
        roundtrip(Any::Undefined);
        roundtrip(Any::Bool(true));
        roundtrip(Any::Number(2.5));
        roundtrip(Any::Number(-3.0));
        roundtrip(Any::BigInt(1 << 60));
        roundtrip(Any::String("hello".into()));
        roundtrip(Any::Buffer(vec![0, 1, 2].into_boxed_slice()));
        roundtrip(Any::Array(
            vec![Any::Number(1.0), Any::String("x".into())].into_boxed_slice(),
        ));
        let mut map = HashMap::new();
        map.insert("key".to_string(), Any::Bool(false));
        roundtrip(Any::Map(Box::new(map)));
    }

    #[test]
    fn json_roundtrip() {
        let source = r#"{"a":[1,2.5,null,"x\n"],"b":{"nested":true}}"#;
        let value = Any::from_json(source).unwrap();
        let mut out = String::new();
        value.to_json(&mut out);
        assert_eq!(Any::from_json(&out).unwrap(), value);
    }

    #[test]
    fn undefined_literal() {
        assert_eq!(Any::from_json("undefined").unwrap(), Any::Undefined);
        let mut out = String::new();
        Any::Undefined.to_json(&mut out);
        assert_eq!(out, "undefined");
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(Any::from_json("{\"a\":").is_err());
        assert!(Any::from_json("[1,]").is_err());
        assert!(Any::from_json("tru").is_err());
    }
}
