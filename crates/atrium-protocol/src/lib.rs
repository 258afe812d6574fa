//! Atrium wire protocol -- binary packet codec and payload schema.
//!
//! Every message exchanged between the server and its clients is a single
//! binary packet: a 1-byte name tag from a closed set ([`PacketKind`])
//! followed by a self-describing typed payload tree ([`PayloadValue`]).
//!
//! # Architecture
//!
//! - **[`value`]**: the tagged payload tree (null, bool, integer, float,
//!   string, bytes, array, object) with a depth-limited binary codec.
//! - **[`packet`]**: the packet envelope -- name tags, encode/decode.
//! - **[`messages`]**: typed views over the payload tree for the structured
//!   messages (snapshot, entity deltas, entity events, chat).
//! - **[`ids`]**: opaque identifier tokens shared across the protocol.
//!
//! # Round-trip law
//!
//! For every representable payload `p` and kind `k`:
//! `Packet::decode(&Packet::new(k, p).encode()) == Ok(Packet::new(k, p))`.
//! The property is exercised with proptest in `tests/roundtrip.rs`.

#![deny(unsafe_code)]

pub mod ids;
pub mod messages;
pub mod packet;
pub mod value;

pub use ids::{BlueprintId, EntityId, SessionId};
pub use packet::{Packet, PacketKind};
pub use value::PayloadValue;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding wire data.
///
/// A `Malformed` error on inbound data means the peer sent bytes that do not
/// form a valid packet; the receiver counts these and closes the connection
/// on repeated offenses (see the session layer).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer ended before the payload tree was complete.
    #[error("malformed packet: truncated at byte {offset}")]
    Truncated {
        /// Byte offset at which more input was expected.
        offset: usize,
    },

    /// An unknown tag byte was encountered.
    #[error("malformed packet: unknown {what} tag {tag:#04x} at byte {offset}")]
    UnknownTag {
        /// What kind of tag was being read ("packet" or "value").
        what: &'static str,
        /// The offending tag byte.
        tag: u8,
        /// Byte offset of the tag.
        offset: usize,
    },

    /// A string field did not hold valid UTF-8.
    #[error("malformed packet: invalid utf-8 in string at byte {offset}")]
    InvalidUtf8 {
        /// Byte offset of the string payload.
        offset: usize,
    },

    /// The payload tree nests deeper than the decoder allows.
    #[error("malformed packet: payload nesting exceeds depth limit {limit}")]
    TooDeep {
        /// The configured depth limit.
        limit: usize,
    },

    /// Input remained after a complete packet was decoded.
    #[error("malformed packet: {remaining} trailing bytes after payload")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },

    /// A typed message view did not match the payload shape.
    #[error("payload does not match {message} schema: {detail}")]
    SchemaMismatch {
        /// Which message schema was expected.
        message: &'static str,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// A payload containing raw bytes was converted toward JSON, which
    /// cannot represent them.
    #[error("bytes value cannot be represented as JSON")]
    BytesInJson,
}
