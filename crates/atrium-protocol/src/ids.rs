//! Opaque identifier tokens shared across the protocol.
//!
//! Entity and blueprint identifiers are 16-byte tokens rendered as 32
//! lowercase hex characters. They are opaque: nothing is encoded in them,
//! and an identifier is never reused after removal within a session.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value::PayloadValue;
use crate::ProtocolError;

macro_rules! token_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            /// Construct from raw bytes.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// The raw token bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// Parse from the 32-character hex rendering.
            pub fn parse(s: &str) -> Option<Self> {
                if s.len() != 32 {
                    return None;
                }
                let mut bytes = [0u8; 16];
                for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
                    let hex = std::str::from_utf8(chunk).ok()?;
                    bytes[i] = u8::from_str_radix(hex, 16).ok()?;
                }
                Some(Self(bytes))
            }

            /// Wire representation: a 16-byte blob.
            pub fn to_value(&self) -> PayloadValue {
                PayloadValue::Bytes(self.0.to_vec())
            }

            /// Read back from the wire representation.
            pub fn from_value(value: &PayloadValue) -> Result<Self, ProtocolError> {
                let bytes = value
                    .as_bytes()
                    .filter(|b| b.len() == 16)
                    .ok_or_else(|| ProtocolError::SchemaMismatch {
                        message: stringify!($name),
                        detail: "expected a 16-byte token".to_owned(),
                    })?;
                let mut out = [0u8; 16];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        // Persisted form is the hex string, matching the display rendering.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s)
                    .ok_or_else(|| serde::de::Error::custom("expected 32 hex characters"))
            }
        }
    };
}

token_id! {
    /// Identifier of a live entity (player or app).
    EntityId
}

token_id! {
    /// Identifier of a blueprint. Versions share the id; the pair
    /// (id, version) names an immutable record.
    BlueprintId
}

/// Identifier of a connected socket. Assigned by the server at admission
/// and never reused while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Wire representation.
    pub fn to_value(&self) -> PayloadValue {
        PayloadValue::Int(self.0 as i64)
    }

    /// Read back from the wire representation.
    pub fn from_value(value: &PayloadValue) -> Result<Self, ProtocolError> {
        value
            .as_i64()
            .map(|n| SessionId(n as u64))
            .ok_or_else(|| ProtocolError::SchemaMismatch {
                message: "SessionId",
                detail: "expected an integer".to_owned(),
            })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_rendering_roundtrips() {
        let id = EntityId::from_bytes([
            0x00, 0x01, 0xab, 0xcd, 0xef, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x90,
            0xa0, 0xff,
        ]);
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(EntityId::parse(&rendered), Some(id));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(EntityId::parse("short"), None);
        assert_eq!(EntityId::parse(&"g".repeat(32)), None);
    }

    #[test]
    fn wire_value_roundtrips() {
        let id = BlueprintId::from_bytes([7; 16]);
        assert_eq!(BlueprintId::from_value(&id.to_value()).unwrap(), id);
    }

    #[test]
    fn wrong_length_blob_is_schema_mismatch() {
        let err = EntityId::from_value(&PayloadValue::Bytes(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, ProtocolError::SchemaMismatch { .. }));
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = EntityId::from_bytes([0x2a; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "2a".repeat(16)));
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
