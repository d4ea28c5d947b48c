//! Bencode codec
//!
//! A strict bencode decoder and deterministic encoder. The decoder is
//! hand-rolled rather than delegated to a serde implementation because
//! info-hash derivation needs the raw byte range of the `info` value,
//! which `info_span` exposes.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB).
/// Prevents malicious torrents from causing memory exhaustion.
const MAX_STRING_LENGTH: u64 = 100 * 1024 * 1024;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys (sorted by key)
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{}", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "{:?}", s),
                _ => write!(f, "<{} bytes>", b.len()),
            },
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Dict(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}

impl BencodeValue {
    /// Decode a complete document, rejecting trailing data
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let value = dec.value()?;
        if dec.pos != data.len() {
            return Err(dec.fail(&format!("{} trailing bytes", data.len() - dec.pos)));
        }
        Ok(value)
    }

    /// Decode one value from the front of `data`.
    ///
    /// Returns the value and the number of bytes it occupied.
    pub fn parse_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let mut dec = Decoder::new(data);
        let value = dec.value()?;
        Ok((value, dec.pos))
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(self, &mut out);
        out
    }

    // Accessor methods

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

fn encode_value(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(bytes) => encode_bytes(bytes, out),
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            // BTreeMap iteration order is ascending by raw key bytes,
            // which is exactly the canonical dictionary encoding
            out.push(b'd');
            for (key, value) in entries {
                encode_bytes(key, out);
                encode_value(value, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decoding cursor over a byte buffer.
///
/// Every error carries the byte offset it was raised at, which makes
/// malformed-torrent reports actionable.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consume `want` if it is the next byte
    fn eat(&mut self, want: u8) -> bool {
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn fail(&self, message: &str) -> ClientError {
        ClientError::protocol(
            ProtocolErrorKind::BencodeParse,
            format!("{} at byte {}", message, self.pos),
        )
    }

    /// Decode one value starting at the cursor
    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek() {
            Some(b'i') => {
                self.pos += 1;
                Ok(BencodeValue::Integer(self.integer()?))
            }
            Some(b'0'..=b'9') => Ok(BencodeValue::Bytes(self.byte_string()?.to_vec())),
            Some(b'l') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(BencodeValue::List(items));
                        }
                        Some(_) => items.push(self.value()?),
                        None => return Err(self.fail("unterminated list")),
                    }
                }
            }
            Some(b'd') => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                let mut last_key: Option<Vec<u8>> = None;
                loop {
                    match self.peek() {
                        Some(b'e') => {
                            self.pos += 1;
                            return Ok(BencodeValue::Dict(entries));
                        }
                        Some(b'0'..=b'9') => {
                            let key = self.byte_string()?.to_vec();
                            // Keys must appear in strictly ascending byte
                            // order on the wire
                            if last_key.as_ref().is_some_and(|prev| key <= *prev) {
                                return Err(self.fail("dictionary keys out of order"));
                            }
                            let value = self.value()?;
                            last_key = Some(key.clone());
                            entries.insert(key, value);
                        }
                        Some(_) => {
                            return Err(self.fail("dictionary key must be a byte string"))
                        }
                        None => return Err(self.fail("unterminated dictionary")),
                    }
                }
            }
            Some(c) => Err(self.fail(&format!("invalid type marker {:?}", c as char))),
            None => Err(self.fail("unexpected end of input")),
        }
    }

    /// Decode the digits and terminator of an integer, the leading `i`
    /// already consumed. Accumulates toward the sign so `i64::MIN` is
    /// representable.
    fn integer(&mut self) -> Result<i64> {
        let negative = self.eat(b'-');
        let digits_start = self.pos;
        let mut value: i64 = 0;

        while let Some(c @ b'0'..=b'9') = self.peek() {
            self.pos += 1;
            let digit = (c - b'0') as i64;
            value = if negative {
                value.checked_mul(10).and_then(|v| v.checked_sub(digit))
            } else {
                value.checked_mul(10).and_then(|v| v.checked_add(digit))
            }
            .ok_or_else(|| self.fail("integer overflows 64 bits"))?;
        }

        let digit_count = self.pos - digits_start;
        if digit_count == 0 {
            return Err(self.fail("integer has no digits"));
        }
        if digit_count > 1 && self.data[digits_start] == b'0' {
            return Err(self.fail("integer has a leading zero"));
        }
        if negative && value == 0 {
            return Err(self.fail("negative zero"));
        }
        if !self.eat(b'e') {
            return Err(self.fail("unterminated integer"));
        }

        Ok(value)
    }

    /// Decode a `<len>:<raw bytes>` string starting at the cursor
    fn byte_string(&mut self) -> Result<&'a [u8]> {
        let mut len: u64 = 0;
        let digits_start = self.pos;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            self.pos += 1;
            len = len
                .checked_mul(10)
                .and_then(|v| v.checked_add((c - b'0') as u64))
                .filter(|&v| v <= MAX_STRING_LENGTH)
                .ok_or_else(|| self.fail("string length over the 100 MiB cap"))?;
        }
        if self.pos == digits_start {
            return Err(self.fail("string length must be a decimal number"));
        }
        if !self.eat(b':') {
            return Err(self.fail("missing ':' after string length"));
        }

        let len = len as usize;
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(self.fail(&format!(
                "string of {} bytes truncated after {}",
                len,
                self.data.len() - self.pos
            )));
        }

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Step over one value without building it
    fn skip_value(&mut self) -> Result<()> {
        match self.peek() {
            Some(b'i') => {
                self.pos += 1;
                self.integer()?;
            }
            Some(b'0'..=b'9') => {
                self.byte_string()?;
            }
            Some(open @ (b'l' | b'd')) => {
                self.pos += 1;
                loop {
                    match self.peek() {
                        Some(b'e') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) if open == b'd' => {
                            self.byte_string()?;
                            self.skip_value()?;
                        }
                        Some(_) => self.skip_value()?,
                        None => return Err(self.fail("unterminated container")),
                    }
                }
            }
            Some(c) => return Err(self.fail(&format!("invalid type marker {:?}", c as char))),
            None => return Err(self.fail("unexpected end of input")),
        }
        Ok(())
    }
}

/// Find the raw bytes of the `info` value in a metainfo document.
///
/// The info-hash is SHA-1 over these exact bytes. Hashing the raw span
/// (instead of re-encoding the parsed tree) keeps the hash correct even
/// for documents whose dictionaries were not canonically ordered.
///
/// The span is found by skipping key/value pairs of the top-level
/// dictionary with the decoding cursor, so a `4:info` substring buried
/// inside another value can never be matched by mistake. Nothing is
/// allocated along the way.
pub fn info_span(data: &[u8]) -> Result<&[u8]> {
    let mut dec = Decoder::new(data);
    if !dec.eat(b'd') {
        return Err(ClientError::protocol(
            ProtocolErrorKind::InvalidTorrent,
            "Metainfo root is not a dictionary",
        ));
    }

    loop {
        match dec.peek() {
            Some(b'e') | None => {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "Missing 'info' key",
                ));
            }
            Some(b'0'..=b'9') => {
                let key = dec.byte_string()?;
                let is_info = key == b"info";
                let start = dec.pos;
                dec.skip_value()?;
                if is_info {
                    return Ok(&data[start..dec.pos]);
                }
            }
            Some(_) => return Err(dec.fail("dictionary key must be a byte string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(data: &[u8]) -> BencodeValue {
        BencodeValue::parse_exact(data).unwrap()
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_one(b"i42e"), BencodeValue::Integer(42));
        assert_eq!(parse_one(b"i-42e"), BencodeValue::Integer(-42));
        assert_eq!(parse_one(b"i0e"), BencodeValue::Integer(0));
        assert_eq!(
            parse_one(b"i-9223372036854775808e"),
            BencodeValue::Integer(i64::MIN)
        );

        // Invalid: leading zero
        assert!(BencodeValue::parse_exact(b"i03e").is_err());

        // Invalid: negative zero
        assert!(BencodeValue::parse_exact(b"i-0e").is_err());

        // Invalid: no digits, unterminated, overflow
        assert!(BencodeValue::parse_exact(b"ie").is_err());
        assert!(BencodeValue::parse_exact(b"i42").is_err());
        assert!(BencodeValue::parse_exact(b"i9223372036854775808e").is_err());
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_one(b"4:spam"), BencodeValue::Bytes(b"spam".to_vec()));
        assert_eq!(parse_one(b"0:"), BencodeValue::Bytes(vec![]));

        // Binary data
        assert_eq!(
            parse_one(b"5:\x00\x01\x02\x03\x04"),
            BencodeValue::Bytes(vec![0, 1, 2, 3, 4])
        );

        // Truncated payload, missing colon
        assert!(BencodeValue::parse_exact(b"10:short").is_err());
        assert!(BencodeValue::parse_exact(b"4spam").is_err());
    }

    #[test]
    fn test_parse_list() {
        let value = parse_one(b"l4:spami42ee");
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::Bytes(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );

        // Empty list
        assert_eq!(parse_one(b"le"), BencodeValue::List(vec![]));

        // Unterminated
        assert!(BencodeValue::parse_exact(b"l4:spam").is_err());
    }

    #[test]
    fn test_parse_dict() {
        let value = parse_one(b"d3:cow3:moo4:spam4:eggse");
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(
            dict.get(b"cow".as_slice()),
            Some(&BencodeValue::Bytes(b"moo".to_vec()))
        );
        assert_eq!(
            dict.get(b"spam".as_slice()),
            Some(&BencodeValue::Bytes(b"eggs".to_vec()))
        );

        // Empty dict
        assert_eq!(parse_one(b"de"), BencodeValue::Dict(BTreeMap::new()));

        // Keys out of order
        assert!(BencodeValue::parse_exact(b"d4:spam4:eggs3:cow3:mooe").is_err());

        // Non-string key
        assert!(BencodeValue::parse_exact(b"di1e3:mooe").is_err());

        // Unterminated
        assert!(BencodeValue::parse_exact(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn test_encode() {
        assert_eq!(BencodeValue::Integer(42).encode(), b"i42e");
        assert_eq!(BencodeValue::Integer(0).encode(), b"i0e");
        assert_eq!(BencodeValue::Integer(-7).encode(), b"i-7e");

        assert_eq!(BencodeValue::Bytes(b"spam".to_vec()).encode(), b"4:spam");

        let value = BencodeValue::List(vec![
            BencodeValue::Bytes(b"spam".to_vec()),
            BencodeValue::Integer(42),
        ]);
        assert_eq!(value.encode(), b"l4:spami42ee");

        let mut dict = BTreeMap::new();
        dict.insert(b"spam".to_vec(), BencodeValue::Bytes(b"eggs".to_vec()));
        dict.insert(b"cow".to_vec(), BencodeValue::Bytes(b"moo".to_vec()));
        // Keys come out sorted regardless of insertion order
        assert_eq!(BencodeValue::Dict(dict).encode(), b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn test_roundtrip() {
        // decode(encode(d)) == d and encode(decode(d)) == d for canonical
        // input
        let original = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";

        let value = parse_one(original);
        let encoded = value.encode();
        assert_eq!(encoded, original.to_vec());
        assert_eq!(parse_one(&encoded), value);

        assert_eq!(value.get("name").and_then(|v| v.as_string()), Some("test"));
        assert_eq!(value.get("value").and_then(|v| v.as_int()), Some(42));
        assert_eq!(
            value
                .get("items")
                .and_then(|v| v.as_list())
                .map(|l| l.len()),
            Some(3)
        );
    }

    #[test]
    fn test_trailing_data_rejected() {
        assert!(BencodeValue::parse_exact(b"i42etrailing").is_err());

        // parse_prefix reports how much it consumed instead
        let (value, consumed) = BencodeValue::parse_prefix(b"i42etrailing").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_info_span() {
        let doc = b"d8:announce9:http://tr4:infod6:lengthi5e4:name1:fee";
        let span = info_span(doc).unwrap();
        assert_eq!(span, b"d6:lengthi5e4:name1:fe");

        // "4:info" appearing inside a value must not fool the scan
        let doc = b"d7:comment6:4:info4:infod6:lengthi5eee";
        let span = info_span(doc).unwrap();
        assert_eq!(span, b"d6:lengthi5ee");

        // No info key
        assert!(info_span(b"d8:announce2:hie").is_err());

        // Root not a dict
        assert!(info_span(b"l4:infoe").is_err());
    }
}
