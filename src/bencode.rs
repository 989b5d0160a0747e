//! Bencode codec: the canonical byte-level encoding used for every KRPC
//! message and for on-wire compound fields such as compact contact lists.
//!
//! The decoder is a small hand-rolled scanner over a byte slice. Canonical
//! dict-key ordering and exact failure modes (truncation, malformed
//! integers, oversized length prefixes) need to be byte-exact, which is
//! easiest to guarantee by controlling the scan loop directly.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::ParseError;

/// A decoded (or to-be-encoded) Bencode value.
///
/// Dict keys sort by raw byte comparison on `Bytes`'s `Ord` impl, which is
/// exactly the canonical ordering rule, so `BTreeMap` gives us sorted output
/// for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn bytes<B: Into<Bytes>>(b: B) -> Self {
        Value::Bytes(b.into())
    }

    pub fn str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_bytes(&self) -> Result<&Bytes, ParseError> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(ParseError::NonStringKey),
        }
    }

    pub fn as_int(&self) -> Result<i64, ParseError> {
        match self {
            Value::Int(n) => Ok(*n),
            _ => Err(ParseError::MalformedInteger),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ParseError> {
        match self {
            Value::List(items) => Ok(items),
            _ => Err(ParseError::UnknownTypeByte(0)),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Bytes, Value>, ParseError> {
        match self {
            Value::Dict(map) => Ok(map),
            _ => Err(ParseError::UnknownTypeByte(0)),
        }
    }

    /// Encodes this value into `out`, appending canonical Bencode bytes.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_to(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap already iterates keys in ascending byte order.
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_to(out);
                    v.encode_to(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Encodes this value to a fresh byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }

    /// Decodes a single value from the start of `input`, returning the value
    /// and the number of bytes consumed. The remainder of `input` is left
    /// unexamined; callers that expect the whole buffer to be one value
    /// should check the returned length themselves.
    pub fn decode(input: &[u8]) -> Result<(Value, usize), ParseError> {
        let mut scanner = Scanner::new(input);
        let value = scanner.value()?;
        Ok((value, scanner.pos))
    }
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Scanner { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        match self.next() {
            Some(b) if b == byte => Ok(()),
            _ => Err(ParseError::Truncated),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let remaining = self.input.len() - self.pos.min(self.input.len());
        if len > remaining {
            return Err(ParseError::LengthExceedsInput {
                len: len as i64,
                remaining,
            });
        }
        let slice = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Parses the decimal digit run (with optional leading sign) used by
    /// both integers and byte-string length prefixes.
    fn signed_integer(&mut self) -> Result<i64, ParseError> {
        let negative = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                // Accepted by the decoder, never emitted by the encoder.
                self.pos += 1;
                false
            }
            _ => false,
        };

        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        if digits.is_empty() {
            return Err(ParseError::EmptyInteger);
        }

        let text = std::str::from_utf8(digits).map_err(|_| ParseError::MalformedInteger)?;
        let magnitude: i64 = text.parse().map_err(|_| ParseError::MalformedInteger)?;
        Ok(if negative { -magnitude } else { magnitude })
    }

    fn integer(&mut self) -> Result<Value, ParseError> {
        self.expect(b'i')?;
        let n = self.signed_integer()?;
        self.expect(b'e')?;
        Ok(Value::Int(n))
    }

    fn byte_string(&mut self) -> Result<Value, ParseError> {
        let len = self.signed_integer()?;
        if len < 0 {
            return Err(ParseError::NegativeLength);
        }
        self.expect(b':')?;
        let bytes = self.take(len as usize)?;
        Ok(Value::Bytes(Bytes::copy_from_slice(bytes)))
    }

    fn list(&mut self) -> Result<Value, ParseError> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::Truncated),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value()?),
            }
        }
    }

    fn dict(&mut self) -> Result<Value, ParseError> {
        self.expect(b'd')?;
        let mut map = BTreeMap::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::Truncated),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::Dict(map));
                }
                Some(b'0'..=b'9') => {
                    let key = match self.byte_string()? {
                        Value::Bytes(b) => b,
                        _ => unreachable!(),
                    };
                    let value = self.value()?;
                    map.insert(key, value);
                }
                Some(_) => return Err(ParseError::NonStringKey),
            }
        }
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            None => Err(ParseError::Truncated),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(),
            Some(b'd') => self.dict(),
            Some(b'0'..=b'9') => self.byte_string(),
            Some(other) => Err(ParseError::UnknownTypeByte(other)),
        }
    }
}
