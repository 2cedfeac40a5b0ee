//! Recursive-descent CBOR value decoder.
//!
//! Firehose frames are two CBOR items written back to back with no outer
//! length. The only way to find where the first item ends is to decode it
//! completely, so this module decodes a full [`Value`] tree and leaves the
//! [`Decoder`] positioned on the first byte after it.
//!
//! Supported: definite and indefinite strings, arrays and maps; unsigned,
//! negative and 65-bit integers; half/single/double floats; simple values;
//! tags, with tag 42 decoded as a [`Cid`] link. Map keys must be text, as
//! DAG-CBOR requires.

use std::collections::BTreeMap;

use base64::Engine as _;
use minicbor::data::Type;
use minicbor::Decoder;

use super::cid::{Cid, CidError};

/// CBOR tag number for content-identifier links.
const TAG_CID_LINK: u64 = 42;

/// The CBOR "break" stop code closing indefinite-length items.
const BREAK: u8 = 0xff;

/// Errors produced while decoding a CBOR item.
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    /// Low-level decode failure (truncation, bad encoding).
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),

    /// Nesting went deeper than [`DecodeLimits::max_depth`].
    #[error("nesting exceeds max depth {0}")]
    DepthExceeded(usize),

    /// A container declared more entries than bytes remain.
    #[error("declared length {declared} exceeds {remaining} remaining bytes")]
    LengthExceedsInput {
        /// Declared number of entries.
        declared: u64,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// A map key was not a text string.
    #[error("map key must be text, found {0:?}")]
    NonTextKey(Type),

    /// A tag-42 link did not wrap a valid CID.
    #[error("invalid cid link: {0}")]
    InvalidLink(#[from] CidError),

    /// A tag-42 link wrapped something other than a byte string.
    #[error("cid link must wrap a byte string, found {0:?}")]
    LinkNotBytes(Type),

    /// A break code appeared outside an indefinite-length item.
    #[error("unexpected break at byte {0}")]
    UnexpectedBreak(usize),

    /// The initial byte is reserved or unassigned.
    #[error("unknown cbor type byte {0:#04x}")]
    UnknownType(u8),
}

/// Resource limits applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum container nesting depth.
    pub max_depth: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_depth: 64 }
    }
}

/// A decoded CBOR data item.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `null`.
    Null,
    /// `undefined`.
    Undefined,
    /// `true` / `false`.
    Bool(bool),
    /// Any integer, including the 65-bit negative range.
    Integer(i128),
    /// Any float width, widened to `f64`.
    Float(f64),
    /// Byte string (indefinite chunks are concatenated).
    Bytes(Vec<u8>),
    /// Text string (indefinite chunks are concatenated).
    Text(String),
    /// Array.
    Array(Vec<Value>),
    /// Map with text keys.
    Map(BTreeMap<String, Value>),
    /// Tag 42: a content-identifier link.
    Link(Cid),
    /// Any other tag and its content.
    Tag(u64, Box<Value>),
    /// Unassigned simple value.
    Simple(u8),
}

impl Value {
    /// Looks up `key` if this is a map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Returns the text if this is a text string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer as `i64` if it fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Returns the integer as `u64` if it fits.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Returns the boolean if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the bytes if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the CID if this is a tag-42 link.
    #[must_use]
    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Value::Link(cid) => Some(cid),
            _ => None,
        }
    }

    /// Returns `true` for `null` and `undefined`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    /// Converts to JSON using the AT data-model conventions.
    ///
    /// Bytes become `{"$bytes": <base64>}` and links `{"$link": <cid>}`.
    /// Non-finite floats and integers outside the JSON number range become
    /// `null` and strings respectively.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null | Value::Undefined => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(n) => {
                if let Ok(v) = i64::try_from(*n) {
                    Json::from(v)
                } else if let Ok(v) = u64::try_from(*n) {
                    Json::from(v)
                } else {
                    Json::String(n.to_string())
                }
            }
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::Bytes(b) => {
                let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(b);
                serde_json::json!({ "$bytes": encoded })
            }
            Value::Text(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Link(cid) => serde_json::json!({ "$link": cid.to_multibase() }),
            Value::Tag(_, inner) => inner.to_json(),
            Value::Simple(n) => Json::from(*n),
        }
    }
}

/// Decodes one complete item from `bytes`, returning it with the number of
/// bytes it occupied. Trailing bytes are left untouched.
///
/// # Errors
///
/// Returns a [`CborError`] if the item is malformed, truncated, or breaks
/// the limits.
pub fn decode_prefix(bytes: &[u8], limits: &DecodeLimits) -> Result<(Value, usize), CborError> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, limits, 0)?;
    Ok((value, dec.position()))
}

/// Decodes the item at the decoder's position, recursing into containers.
///
/// # Errors
///
/// Returns a [`CborError`] if the item is malformed, truncated, or breaks
/// the limits.
pub fn decode_value(
    dec: &mut Decoder<'_>,
    limits: &DecodeLimits,
    depth: usize,
) -> Result<Value, CborError> {
    if depth > limits.max_depth {
        return Err(CborError::DepthExceeded(limits.max_depth));
    }

    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(Value::Null)
        }
        Type::Undefined => {
            dec.undefined()?;
            Ok(Value::Undefined)
        }
        Type::Bool => Ok(Value::Bool(dec.bool()?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            Ok(Value::Integer(i128::from(dec.u64()?)))
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => {
            Ok(Value::Integer(i128::from(dec.i64()?)))
        }
        Type::Int => Ok(Value::Integer(i128::from(dec.int()?))),
        Type::F16 => Ok(Value::Float(f64::from(dec.f16()?))),
        Type::F32 => Ok(Value::Float(f64::from(dec.f32()?))),
        Type::F64 => Ok(Value::Float(dec.f64()?)),
        Type::Simple => Ok(Value::Simple(dec.simple()?)),
        Type::Bytes => Ok(Value::Bytes(dec.bytes()?.to_vec())),
        Type::BytesIndef => {
            let mut out = Vec::new();
            for chunk in dec.bytes_iter()? {
                out.extend_from_slice(chunk?);
            }
            Ok(Value::Bytes(out))
        }
        Type::String => Ok(Value::Text(dec.str()?.to_string())),
        Type::StringIndef => {
            let mut out = String::new();
            for chunk in dec.str_iter()? {
                out.push_str(chunk?);
            }
            Ok(Value::Text(out))
        }
        Type::Array | Type::ArrayIndef => decode_array(dec, limits, depth),
        Type::Map | Type::MapIndef => decode_map(dec, limits, depth),
        Type::Tag => {
            let tag = dec.tag()?.as_u64();
            if tag == TAG_CID_LINK {
                let ty = dec.datatype()?;
                if ty != Type::Bytes {
                    return Err(CborError::LinkNotBytes(ty));
                }
                let cid = Cid::from_link_bytes(dec.bytes()?)?;
                Ok(Value::Link(cid))
            } else {
                let inner = decode_value(dec, limits, depth + 1)?;
                Ok(Value::Tag(tag, Box::new(inner)))
            }
        }
        Type::Break => Err(CborError::UnexpectedBreak(dec.position())),
        Type::Unknown(byte) => Err(CborError::UnknownType(byte)),
    }
}

fn decode_array(
    dec: &mut Decoder<'_>,
    limits: &DecodeLimits,
    depth: usize,
) -> Result<Value, CborError> {
    match dec.array()? {
        Some(len) => {
            let len = checked_len(dec, len, 1)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_value(dec, limits, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        None => {
            let mut items = Vec::new();
            while !at_break(dec)? {
                items.push(decode_value(dec, limits, depth + 1)?);
            }
            consume_break(dec);
            Ok(Value::Array(items))
        }
    }
}

fn decode_map(
    dec: &mut Decoder<'_>,
    limits: &DecodeLimits,
    depth: usize,
) -> Result<Value, CborError> {
    let mut map = BTreeMap::new();
    match dec.map()? {
        Some(len) => {
            let len = checked_len(dec, len, 2)?;
            for _ in 0..len {
                let key = decode_key(dec)?;
                let value = decode_value(dec, limits, depth + 1)?;
                map.insert(key, value);
            }
        }
        None => {
            while !at_break(dec)? {
                let key = decode_key(dec)?;
                let value = decode_value(dec, limits, depth + 1)?;
                map.insert(key, value);
            }
            consume_break(dec);
        }
    }
    Ok(Value::Map(map))
}

fn decode_key(dec: &mut Decoder<'_>) -> Result<String, CborError> {
    match dec.datatype()? {
        Type::String => Ok(dec.str()?.to_string()),
        Type::StringIndef => {
            let mut out = String::new();
            for chunk in dec.str_iter()? {
                out.push_str(chunk?);
            }
            Ok(out)
        }
        other => Err(CborError::NonTextKey(other)),
    }
}

/// Validates a declared container length against the bytes left, so a
/// hostile length cannot trigger a huge allocation. Every entry needs at
/// least `min_bytes_per_entry` bytes.
fn checked_len(
    dec: &Decoder<'_>,
    declared: u64,
    min_bytes_per_entry: u64,
) -> Result<usize, CborError> {
    let remaining = dec.input().len().saturating_sub(dec.position());
    let needed = declared.saturating_mul(min_bytes_per_entry);
    if needed > remaining as u64 {
        return Err(CborError::LengthExceedsInput {
            declared,
            remaining,
        });
    }
    usize::try_from(declared).map_err(|_| CborError::LengthExceedsInput {
        declared,
        remaining,
    })
}

fn at_break(dec: &Decoder<'_>) -> Result<bool, CborError> {
    Ok(dec.datatype()? == Type::Break)
}

fn consume_break(dec: &mut Decoder<'_>) {
    debug_assert_eq!(dec.input().get(dec.position()), Some(&BREAK));
    dec.set_position(dec.position() + 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::data::Tag;
    use minicbor::Encoder;

    fn limits() -> DecodeLimits {
        DecodeLimits::default()
    }

    #[test]
    fn test_scalars() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.array(6)
            .unwrap()
            .u64(u64::MAX)
            .unwrap()
            .i64(-5)
            .unwrap()
            .bool(true)
            .unwrap()
            .null()
            .unwrap()
            .f64(1.5)
            .unwrap()
            .str("hi")
            .unwrap();

        let (value, used) = decode_prefix(&buf, &limits()).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Integer(i128::from(u64::MAX)),
                Value::Integer(-5),
                Value::Bool(true),
                Value::Null,
                Value::Float(1.5),
                Value::Text("hi".into()),
            ])
        );
    }

    #[test]
    fn test_sixty_five_bit_negative() {
        // major type 1 with argument u64::MAX encodes -2^64.
        let bytes = [0x3b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let (value, used) = decode_prefix(&bytes, &limits()).unwrap();
        assert_eq!(used, 9);
        assert_eq!(value, Value::Integer(-(1_i128 << 64)));
    }

    #[test]
    fn test_prefix_leaves_trailing_bytes() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap().str("op").unwrap().i64(1).unwrap();
        let first_len = buf.len();
        Encoder::new(&mut buf).str("second").unwrap();

        let (value, used) = decode_prefix(&buf, &limits()).unwrap();
        assert_eq!(used, first_len);
        assert_eq!(value.get("op").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn test_indefinite_containers() {
        // {_ "a": [_ 1, 2], "b": (_ h'01', h'02') } followed by a trailing 0x00.
        let bytes = [
            0xbf, 0x61, b'a', 0x9f, 0x01, 0x02, 0xff, 0x61, b'b', 0x5f, 0x41, 0x01, 0x41, 0x02,
            0xff, 0xff, 0x00,
        ];
        let (value, used) = decode_prefix(&bytes, &limits()).unwrap();
        assert_eq!(used, bytes.len() - 1);
        assert_eq!(
            value.get("a"),
            Some(&Value::Array(vec![Value::Integer(1), Value::Integer(2)]))
        );
        assert_eq!(value.get("b"), Some(&Value::Bytes(vec![1, 2])));
    }

    #[test]
    fn test_indefinite_text() {
        // (_ "ab", "cd")
        let bytes = [0x7f, 0x62, b'a', b'b', 0x62, b'c', b'd', 0xff];
        let (value, used) = decode_prefix(&bytes, &limits()).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(value, Value::Text("abcd".into()));
    }

    #[test]
    fn test_cid_link_tag() {
        let mut link = vec![0x00];
        link.extend(crate::firehose::cid::tests::sample_cid_bytes(9));

        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .tag(Tag::new(42))
            .unwrap()
            .bytes(&link)
            .unwrap();

        let (value, _) = decode_prefix(&buf, &limits()).unwrap();
        let cid = value.as_link().expect("link");
        assert_eq!(cid.as_bytes(), &link[1..]);
        assert_eq!(value.to_json()["$link"], cid.to_multibase());
        assert!(cid.to_multibase().starts_with("bafyrei"));
    }

    #[test]
    fn test_half_float() {
        let (value, used) = decode_prefix(&[0xf9, 0x3c, 0x00], &limits()).unwrap();
        assert_eq!(used, 3);
        assert_eq!(value, Value::Float(1.0));

        let (value, _) = decode_prefix(&[0xf9, 0xc4, 0x00], &limits()).unwrap();
        assert_eq!(value, Value::Float(-4.0));
    }

    #[test]
    fn test_other_tag_kept() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .tag(Tag::new(1))
            .unwrap()
            .u64(1_700_000_000)
            .unwrap();
        let (value, _) = decode_prefix(&buf, &limits()).unwrap();
        assert_eq!(
            value,
            Value::Tag(1, Box::new(Value::Integer(1_700_000_000)))
        );
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .map(2)
            .unwrap()
            .str("repo")
            .unwrap()
            .str("did:example:1")
            .unwrap()
            .str("seq")
            .unwrap()
            .u64(7)
            .unwrap();
        for cut in 1..buf.len() {
            assert!(
                decode_prefix(&buf[..cut], &limits()).is_err(),
                "prefix of {cut} bytes should not decode"
            );
        }
    }

    #[test]
    fn test_hostile_length_rejected() {
        // array declaring 2^32 elements with no content.
        let bytes = [0x9a, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode_prefix(&bytes, &limits()),
            Err(CborError::LengthExceedsInput { .. })
        ));
    }

    #[test]
    fn test_depth_limit() {
        let bytes = vec![0x81; 10]
            .into_iter()
            .chain(std::iter::once(0x00))
            .collect::<Vec<u8>>();
        let tight = DecodeLimits { max_depth: 4 };
        assert!(matches!(
            decode_prefix(&bytes, &tight),
            Err(CborError::DepthExceeded(4))
        ));
        assert!(decode_prefix(&bytes, &limits()).is_ok());
    }

    #[test]
    fn test_non_text_key_rejected() {
        let bytes = [0xa1, 0x01, 0x02];
        assert!(matches!(
            decode_prefix(&bytes, &limits()),
            Err(CborError::NonTextKey(_))
        ));
    }

    #[test]
    fn test_stray_break_and_reserved_byte() {
        assert!(matches!(
            decode_prefix(&[0xff], &limits()),
            Err(CborError::UnexpectedBreak(0))
        ));
        assert!(decode_prefix(&[0x1c], &limits()).is_err());
    }

    #[test]
    fn test_to_json() {
        let mut map = BTreeMap::new();
        map.insert("text".to_string(), Value::Text("Quercus".into()));
        map.insert("count".to_string(), Value::Integer(3));
        map.insert("blob".to_string(), Value::Bytes(vec![1, 2, 3]));
        let json = Value::Map(map).to_json();

        assert_eq!(json["text"], "Quercus");
        assert_eq!(json["count"], 3);
        assert_eq!(json["blob"]["$bytes"], "AQID");
    }
}
