//! # Bencode Codec
//!
//! This module implements encoding and decoding of bencode, the
//! self-describing format used by `.torrent` files and tracker responses.
//!
//! ## Grammar
//!
//! | Type | Encoding | Example |
//! |------|----------|---------|
//! | Integer | `i<digits>e` | `i42e` |
//! | Byte string | `<length>:<bytes>` | `4:spam` |
//! | List | `l<value>*e` | `li1ei2ee` |
//! | Dictionary | `d(<string><value>)*e` | `d3:cow3:mooe` |
//!
//! ## Canonical Form
//!
//! The decoder only accepts canonical input:
//!
//! - Integers have no leading zeros and `-0` is rejected
//! - String lengths have no leading zeros
//! - Dictionary keys are strictly ascending in byte order (duplicates rejected)
//! - The whole input must be consumed by a single top-level value
//!
//! Because every accepted input is canonical, re-encoding a decoded value
//! reproduces the input byte-for-byte.
//!
//! ## Dictionary Spans
//!
//! The info-hash of a torrent is the SHA-1 of the exact bytes that encode the
//! `info` dictionary inside the original file. To support this, the parser
//! records the byte range of every dictionary it decodes, together with its
//! nesting depth and the key under which it appears in its parent. Callers
//! retrieve the range with [`Parser::dict_span`] and hash the original slice
//! directly, without re-encoding.

use std::collections::BTreeMap;

use thiserror::Error;

/// A decoded bencode value.
///
/// Dictionaries are backed by a `BTreeMap`, so key iteration is always in
/// ascending byte order and the encoder emits canonical output for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Signed 64-bit integer
    Integer(i64),
    /// Raw bytes, not assumed to be UTF-8
    ByteString(Vec<u8>),
    /// Ordered sequence of values
    List(Vec<BencodeValue>),
    /// Mapping from byte-string keys to values, keys ascending
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Returns the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(int) => Some(*int),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the string value, if this is a byte string holding UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            BencodeValue::ByteString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Returns the items, if this is a list.
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries, if this is a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Errors produced while decoding bencode data.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BencodeError {
    /// Empty input, an unrecognized prefix byte, or bytes left over after the
    /// top-level value
    #[error("invalid bencode string")]
    InvalidString,
    /// Integer missing digits or its closing `e`
    #[error("malformed integer")]
    IntFormat,
    /// Integer with a non-canonical or unrepresentable value
    #[error("invalid integer value")]
    IntValue,
    /// Byte string with a malformed length prefix
    #[error("malformed byte string")]
    StringFormat,
    /// Byte string shorter than its declared length
    #[error("byte string length mismatch")]
    StringLength,
    /// Unterminated list
    #[error("unterminated list")]
    ListFormat,
    /// Unterminated dictionary
    #[error("unterminated dictionary")]
    DictFormat,
    /// Dictionary key that is not a byte string
    #[error("dictionary key is not a byte string")]
    DictKey,
    /// Dictionary keys not strictly ascending in byte order
    #[error("dictionary keys out of order")]
    DictKeyOrder,
}

/// Byte range of one decoded dictionary within the input.
#[derive(Debug, Clone)]
pub struct DictSpan {
    /// Nesting depth: 0 for the top-level value, 1 for a value stored
    /// directly inside the top-level dictionary, and so on
    pub depth: usize,
    /// Key under which the dictionary appears in its parent dictionary,
    /// `None` for the top-level value or list elements
    pub key: Option<Vec<u8>>,
    /// Offset of the opening `d`
    pub start: usize,
    /// Offset one past the closing `e`
    pub end: usize,
}

/// Bencode decoder.
///
/// Decoding is driven by [`Parser::decode`]; the dictionary spans recorded
/// during the last call remain available until the next one.
#[derive(Default)]
pub struct Parser {
    spans: Vec<DictSpan>,
}

impl Parser {
    /// Build a new parser.
    pub fn new() -> Parser {
        Parser { spans: Vec::new() }
    }

    /// Decode a complete bencode value from `input`.
    ///
    /// The whole input must encode exactly one value; trailing bytes are an
    /// error.
    pub fn decode(&mut self, input: &[u8]) -> Result<BencodeValue, BencodeError> {
        let mut decoder = Decoder {
            buf: input,
            pos: 0,
            spans: Vec::new(),
        };

        let value = decoder.decode_value(0, None)?;

        // The string was not fully parsed
        if decoder.pos != input.len() {
            return Err(BencodeError::InvalidString);
        }

        self.spans = decoder.spans;

        Ok(value)
    }

    /// Returns the byte range of the dictionary stored under `key` in the
    /// top-level dictionary of the last decoded input.
    ///
    /// The range covers the opening `d` through the closing `e` inclusive, so
    /// slicing the original input with it yields the exact encoded bytes.
    pub fn dict_span(&self, key: &[u8]) -> Option<(usize, usize)> {
        self.spans
            .iter()
            .find(|span| span.depth == 1 && span.key.as_deref() == Some(key))
            .map(|span| (span.start, span.end))
    }

    /// All dictionary spans recorded during the last decode, in completion
    /// order.
    pub fn dict_spans(&self) -> &[DictSpan] {
        &self.spans
    }
}

/// Cursor over the input buffer, shared by the per-type decoders.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    spans: Vec<DictSpan>,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Decode the next value, dispatching on its prefix byte.
    fn decode_value(
        &mut self,
        depth: usize,
        key: Option<&[u8]>,
    ) -> Result<BencodeValue, BencodeError> {
        match self.peek() {
            Some(b'i') => self.decode_int(),
            Some(b'0'..=b'9') => Ok(BencodeValue::ByteString(self.decode_string()?)),
            Some(b'l') => self.decode_list(depth),
            Some(b'd') => self.decode_dict(depth, key),
            _ => Err(BencodeError::InvalidString),
        }
    }

    /// Decode `i<digits>e` into a signed 64-bit integer.
    fn decode_int(&mut self) -> Result<BencodeValue, BencodeError> {
        // Skip the 'i' already checked by the dispatcher
        self.pos += 1;

        // Collect digits until the closing 'e'
        let digits_start = self.pos;
        while self.peek().is_some_and(|b| b != b'e') {
            self.pos += 1;
        }
        if self.peek() != Some(b'e') {
            return Err(BencodeError::IntFormat);
        }
        let digits = &self.buf[digits_start..self.pos];
        self.pos += 1;

        if digits.is_empty() {
            return Err(BencodeError::IntFormat);
        }

        // Strip an optional sign, the rest must be plain digits
        let unsigned = match digits[0] {
            b'-' => &digits[1..],
            _ => digits,
        };
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::IntValue);
        }

        // "-0" and leading zeros are not canonical
        if digits == b"-0" || (unsigned.len() > 1 && unsigned[0] == b'0') {
            return Err(BencodeError::IntValue);
        }

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::IntValue)?;
        let int = text.parse::<i64>().map_err(|_| BencodeError::IntValue)?;

        Ok(BencodeValue::Integer(int))
    }

    /// Decode `<length>:<bytes>` into raw bytes.
    fn decode_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        // Collect the length digits until the ':'
        let len_start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() != Some(b':') {
            return Err(BencodeError::StringFormat);
        }
        let len_digits = &self.buf[len_start..self.pos];
        self.pos += 1;

        // A leading zero is only canonical for the single length "0"
        if len_digits.len() > 1 && len_digits[0] == b'0' {
            return Err(BencodeError::StringFormat);
        }

        let text = std::str::from_utf8(len_digits).map_err(|_| BencodeError::StringFormat)?;
        let len = text.parse::<usize>().map_err(|_| BencodeError::StringLength)?;

        // Exactly `len` raw bytes must follow
        if self.buf.len() - self.pos < len {
            return Err(BencodeError::StringLength);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;

        Ok(bytes)
    }

    /// Decode `l<value>*e` into a list.
    fn decode_list(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        // Skip the 'l' already checked by the dispatcher
        self.pos += 1;

        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(BencodeError::ListFormat),
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.decode_value(depth + 1, None)?),
            }
        }

        Ok(BencodeValue::List(items))
    }

    /// Decode `d(<string><value>)*e` into a dictionary, checking key order.
    fn decode_dict(
        &mut self,
        depth: usize,
        key: Option<&[u8]>,
    ) -> Result<BencodeValue, BencodeError> {
        let start = self.pos;

        // Skip the 'd' already checked by the dispatcher
        self.pos += 1;

        let mut entries = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                None => return Err(BencodeError::DictFormat),
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(b'0'..=b'9') => {
                    let entry_key = self.decode_string()?;

                    // Keys must be strictly ascending, duplicates included
                    if last_key.as_deref().is_some_and(|prev| prev >= &entry_key[..]) {
                        return Err(BencodeError::DictKeyOrder);
                    }

                    let value = self.decode_value(depth + 1, Some(&entry_key))?;
                    entries.insert(entry_key.clone(), value);
                    last_key = Some(entry_key);
                }
                Some(_) => return Err(BencodeError::DictKey),
            }
        }

        self.spans.push(DictSpan {
            depth,
            key: key.map(|k| k.to_vec()),
            start,
            end: self.pos,
        });

        Ok(BencodeValue::Dict(entries))
    }
}

/// Encode a value into bencode bytes.
///
/// Dictionary keys are emitted in ascending byte order, so the output is
/// always canonical.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Encode a value into an existing buffer.
pub fn encode_into(value: &BencodeValue, buf: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(int) => {
            buf.push(b'i');
            buf.extend_from_slice(int.to_string().as_bytes());
            buf.push(b'e');
        }
        BencodeValue::ByteString(bytes) => {
            buf.extend_from_slice(bytes.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(bytes);
        }
        BencodeValue::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            buf.push(b'd');
            // BTreeMap iterates keys in ascending order
            for (key, item) in entries {
                buf.extend_from_slice(key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(key);
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
    }
}
