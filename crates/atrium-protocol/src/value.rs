//! The self-describing payload tree and its binary codec.
//!
//! A [`PayloadValue`] is the unit of data carried by every packet. The tree
//! is deliberately small: the eight shapes below cover everything the world
//! replicates, and keeping the set closed makes the codec total -- any byte
//! sequence either decodes to exactly one tree or fails with a
//! [`ProtocolError`].
//!
//! # Wire format
//!
//! Each node is a tag byte followed by its body:
//!
//! | tag | shape  | body |
//! |-----|--------|------|
//! | 0   | Null   | -- |
//! | 1   | Bool   | 1 byte (0/1) |
//! | 2   | Int    | i64, little-endian |
//! | 3   | Float  | f64, little-endian |
//! | 4   | Str    | u32 length + UTF-8 bytes |
//! | 5   | Bytes  | u32 length + raw bytes |
//! | 6   | Array  | u32 count + elements |
//! | 7   | Object | u32 count + (key string, value) pairs |
//!
//! Object keys are written in sorted order (the map is a `BTreeMap`), so
//! equal trees always encode to equal bytes.

use std::collections::BTreeMap;

use crate::ProtocolError;

/// Maximum nesting depth accepted by the decoder. Hostile input cannot make
/// the recursive decoder exhaust the stack.
pub const MAX_DEPTH: usize = 64;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

// ---------------------------------------------------------------------------
// PayloadValue
// ---------------------------------------------------------------------------

/// A node in the typed payload tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// Absent / cleared value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer. Distinct from `Float` on the wire.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte blob (asset payloads, script bytes).
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<PayloadValue>),
    /// Key-sorted map.
    Object(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    /// Empty object, as a starting point for builders.
    pub fn object() -> Self {
        PayloadValue::Object(BTreeMap::new())
    }

    /// Insert a field into an object value. Panics if `self` is not an
    /// object -- builder misuse is a programming error, not a wire error.
    pub fn set(&mut self, key: &str, value: PayloadValue) {
        match self {
            PayloadValue::Object(map) => {
                map.insert(key.to_owned(), value);
            }
            other => panic!("set() on non-object payload value: {other:?}"),
        }
    }

    /// Look up a field on an object value. Returns `None` for non-objects
    /// and missing keys alike.
    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        match self {
            PayloadValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// `true` if this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, PayloadValue::Null)
    }

    /// Borrow as `&str` if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read as `i64` if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Read as `f64`. Integers widen losslessly enough for pose math, so
    /// both numeric shapes are accepted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Float(f) => Some(*f),
            PayloadValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Read as `bool` if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as a byte slice if this is a bytes blob.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PayloadValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow as an array slice if this is an array.
    pub fn as_array(&self) -> Option<&[PayloadValue]> {
        match self {
            PayloadValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the underlying map if this is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, PayloadValue>> {
        match self {
            PayloadValue::Object(map) => Some(map),
            _ => None,
        }
    }

    // -- binary codec -------------------------------------------------------

    /// Append this value's wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            PayloadValue::Null => buf.push(TAG_NULL),
            PayloadValue::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            PayloadValue::Int(n) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            PayloadValue::Float(f) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            PayloadValue::Str(s) => {
                buf.push(TAG_STR);
                write_len(buf, s.len());
                buf.extend_from_slice(s.as_bytes());
            }
            PayloadValue::Bytes(b) => {
                buf.push(TAG_BYTES);
                write_len(buf, b.len());
                buf.extend_from_slice(b);
            }
            PayloadValue::Array(items) => {
                buf.push(TAG_ARRAY);
                write_len(buf, items.len());
                for item in items {
                    item.encode_into(buf);
                }
            }
            PayloadValue::Object(map) => {
                buf.push(TAG_OBJECT);
                write_len(buf, map.len());
                for (key, value) in map {
                    write_len(buf, key.len());
                    buf.extend_from_slice(key.as_bytes());
                    value.encode_into(buf);
                }
            }
        }
    }

    /// Decode one value from the reader.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Truncated`], [`ProtocolError::UnknownTag`],
    /// [`ProtocolError::InvalidUtf8`] or [`ProtocolError::TooDeep`] on
    /// malformed input.
    pub(crate) fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::TooDeep { limit: MAX_DEPTH });
        }

        let offset = reader.pos;
        let tag = reader.take_u8()?;
        match tag {
            TAG_NULL => Ok(PayloadValue::Null),
            TAG_BOOL => Ok(PayloadValue::Bool(reader.take_u8()? != 0)),
            TAG_INT => Ok(PayloadValue::Int(i64::from_le_bytes(reader.take_array()?))),
            TAG_FLOAT => Ok(PayloadValue::Float(f64::from_le_bytes(
                reader.take_array()?,
            ))),
            TAG_STR => {
                let len = reader.take_len()?;
                reader.take_str(len).map(PayloadValue::Str)
            }
            TAG_BYTES => {
                let len = reader.take_len()?;
                Ok(PayloadValue::Bytes(reader.take_slice(len)?.to_vec()))
            }
            TAG_ARRAY => {
                let count = reader.take_len()?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(PayloadValue::decode_from(reader, depth + 1)?);
                }
                Ok(PayloadValue::Array(items))
            }
            TAG_OBJECT => {
                let count = reader.take_len()?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key_len = reader.take_len()?;
                    let key = reader.take_str(key_len)?;
                    let value = PayloadValue::decode_from(reader, depth + 1)?;
                    map.insert(key, value);
                }
                Ok(PayloadValue::Object(map))
            }
            other => Err(ProtocolError::UnknownTag {
                what: "value",
                tag: other,
                offset,
            }),
        }
    }

    // -- JSON interop -------------------------------------------------------

    /// Convert to a `serde_json::Value` for persistence and the script host
    /// boundary.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BytesInJson`] if the tree contains a `Bytes` node;
    /// raw blobs only ever travel on the wire.
    pub fn to_json(&self) -> Result<serde_json::Value, ProtocolError> {
        Ok(match self {
            PayloadValue::Null => serde_json::Value::Null,
            PayloadValue::Bool(b) => serde_json::Value::Bool(*b),
            PayloadValue::Int(n) => serde_json::Value::from(*n),
            PayloadValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PayloadValue::Str(s) => serde_json::Value::String(s.clone()),
            PayloadValue::Bytes(_) => return Err(ProtocolError::BytesInJson),
            PayloadValue::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(PayloadValue::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            PayloadValue::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Build a payload tree from a `serde_json::Value`.
    ///
    /// Numbers that fit `i64` become `Int`; everything else numeric becomes
    /// `Float`, matching how the tree distinguishes the two on the wire.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PayloadValue::Null,
            serde_json::Value::Bool(b) => PayloadValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PayloadValue::Int(i)
                } else {
                    PayloadValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => PayloadValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                PayloadValue::Array(items.iter().map(PayloadValue::from_json).collect())
            }
            serde_json::Value::Object(map) => PayloadValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), PayloadValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for PayloadValue {
    fn from(b: bool) -> Self {
        PayloadValue::Bool(b)
    }
}

impl From<i64> for PayloadValue {
    fn from(n: i64) -> Self {
        PayloadValue::Int(n)
    }
}

impl From<f64> for PayloadValue {
    fn from(f: f64) -> Self {
        PayloadValue::Float(f)
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::Str(s.to_owned())
    }
}

impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        PayloadValue::Str(s)
    }
}

impl<T: Into<PayloadValue>> From<Vec<T>> for PayloadValue {
    fn from(items: Vec<T>) -> Self {
        PayloadValue::Array(items.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over an inbound byte buffer. All reads are bounds-checked and
/// report the offset at which input ran out.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(ProtocolError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn take_slice(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ProtocolError::Truncated { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_len(&mut self) -> Result<usize, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn take_str(&mut self, len: usize) -> Result<String, ProtocolError> {
        let offset = self.pos;
        let slice = self.take_slice(len)?;
        String::from_utf8(slice.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { offset })
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: PayloadValue) -> PayloadValue {
        let mut buf = Vec::new();
        value.encode_into(&mut buf);
        let mut reader = Reader::new(&buf);
        let decoded = PayloadValue::decode_from(&mut reader, 0).expect("decode");
        assert_eq!(reader.remaining(), 0, "decode should consume the buffer");
        decoded
    }

    #[test]
    fn scalar_roundtrips() {
        for value in [
            PayloadValue::Null,
            PayloadValue::Bool(true),
            PayloadValue::Bool(false),
            PayloadValue::Int(-42),
            PayloadValue::Int(i64::MAX),
            PayloadValue::Float(1.5),
            PayloadValue::Str("héllo".to_owned()),
            PayloadValue::Bytes(vec![0, 255, 7]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn nested_roundtrip() {
        let mut obj = PayloadValue::object();
        obj.set("id", PayloadValue::Int(9));
        obj.set(
            "tags",
            PayloadValue::Array(vec!["a".into(), "b".into(), PayloadValue::Null]),
        );
        let mut inner = PayloadValue::object();
        inner.set("x", PayloadValue::Float(0.25));
        obj.set("pose", inner);

        assert_eq!(roundtrip(obj.clone()), obj);
    }

    #[test]
    fn int_and_float_stay_distinct() {
        // 3 as Int and 3.0 as Float must not collapse into each other.
        assert_eq!(roundtrip(PayloadValue::Int(3)), PayloadValue::Int(3));
        assert_eq!(roundtrip(PayloadValue::Float(3.0)), PayloadValue::Float(3.0));
    }

    #[test]
    fn truncated_input_fails() {
        let mut buf = Vec::new();
        PayloadValue::Str("hello".to_owned()).encode_into(&mut buf);
        buf.truncate(buf.len() - 2);

        let mut reader = Reader::new(&buf);
        let err = PayloadValue::decode_from(&mut reader, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }), "{err:?}");
    }

    #[test]
    fn unknown_tag_fails() {
        let buf = [0x4d];
        let mut reader = Reader::new(&buf);
        let err = PayloadValue::decode_from(&mut reader, 0).unwrap_err();
        assert!(
            matches!(err, ProtocolError::UnknownTag { tag: 0x4d, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut buf = vec![TAG_STR];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xff, 0xfe]);

        let mut reader = Reader::new(&buf);
        let err = PayloadValue::decode_from(&mut reader, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8 { .. }), "{err:?}");
    }

    #[test]
    fn depth_limit_rejects_deep_nesting() {
        // MAX_DEPTH + 2 nested single-element arrays.
        let mut buf = Vec::new();
        for _ in 0..(MAX_DEPTH + 2) {
            buf.push(TAG_ARRAY);
            buf.extend_from_slice(&1u32.to_le_bytes());
        }
        buf.push(TAG_NULL);

        let mut reader = Reader::new(&buf);
        let err = PayloadValue::decode_from(&mut reader, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::TooDeep { .. }), "{err:?}");
    }

    #[test]
    fn hostile_length_does_not_overallocate() {
        // A claimed array length of u32::MAX with no elements behind it must
        // fail on the first element, not reserve gigabytes up front.
        let mut buf = vec![TAG_ARRAY];
        buf.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut reader = Reader::new(&buf);
        let err = PayloadValue::decode_from(&mut reader, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }), "{err:?}");
    }

    #[test]
    fn object_keys_encode_sorted() {
        let mut a = PayloadValue::object();
        a.set("zeta", PayloadValue::Int(1));
        a.set("alpha", PayloadValue::Int(2));

        let mut b = PayloadValue::object();
        b.set("alpha", PayloadValue::Int(2));
        b.set("zeta", PayloadValue::Int(1));

        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        a.encode_into(&mut buf_a);
        b.encode_into(&mut buf_b);
        assert_eq!(buf_a, buf_b, "equal trees must encode to equal bytes");
    }

    #[test]
    fn json_interop_preserves_shape() {
        let json = serde_json::json!({
            "name": "crate",
            "count": 7,
            "ratio": 0.5,
            "flags": [true, null],
        });
        let value = PayloadValue::from_json(&json);
        assert_eq!(value.get("count").unwrap(), &PayloadValue::Int(7));
        assert_eq!(value.get("ratio").unwrap(), &PayloadValue::Float(0.5));
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn bytes_refuse_json_conversion() {
        let value = PayloadValue::Bytes(vec![1, 2, 3]);
        assert!(matches!(
            value.to_json().unwrap_err(),
            ProtocolError::BytesInJson
        ));
    }
}
