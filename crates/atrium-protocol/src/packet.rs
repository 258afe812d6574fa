//! The packet envelope: name tags and the top-level codec.

use crate::value::{PayloadValue, Reader};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// PacketKind
// ---------------------------------------------------------------------------

/// The closed set of packet names. Each name maps to a stable 1-byte tag;
/// the mapping is exhaustive in both directions and an unknown tag on the
/// wire is a malformed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Full world state sent to a client on connect.
    Snapshot = 0,
    /// A new entity exists.
    EntityAdded = 1,
    /// Partial update of an entity's replicated record.
    EntityModified = 2,
    /// An entity was removed.
    EntityRemoved = 3,
    /// A named event targeted at one entity's script.
    EntityEvent = 4,
    /// A new blueprint was minted.
    BlueprintAdded = 5,
    /// An existing blueprint gained a new version.
    BlueprintModified = 6,
    /// A chat message was appended.
    ChatAdded = 7,
    /// The local player must teleport.
    PlayerTeleport = 8,
    /// Keepalive probe.
    Ping = 9,
    /// Keepalive reply.
    Pong = 10,
}

impl PacketKind {
    /// All kinds, in tag order. Used by dispatch tables and tests.
    pub const ALL: [PacketKind; 11] = [
        PacketKind::Snapshot,
        PacketKind::EntityAdded,
        PacketKind::EntityModified,
        PacketKind::EntityRemoved,
        PacketKind::EntityEvent,
        PacketKind::BlueprintAdded,
        PacketKind::BlueprintModified,
        PacketKind::ChatAdded,
        PacketKind::PlayerTeleport,
        PacketKind::Ping,
        PacketKind::Pong,
    ];

    /// The 1-byte wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Reverse of [`tag`](Self::tag). `None` for unknown bytes.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Protocol-level name, as it appears in logs and docs.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Snapshot => "snapshot",
            PacketKind::EntityAdded => "entityAdded",
            PacketKind::EntityModified => "entityModified",
            PacketKind::EntityRemoved => "entityRemoved",
            PacketKind::EntityEvent => "entityEvent",
            PacketKind::BlueprintAdded => "blueprintAdded",
            PacketKind::BlueprintModified => "blueprintModified",
            PacketKind::ChatAdded => "chatAdded",
            PacketKind::PlayerTeleport => "playerTeleport",
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
        }
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One framed message: a name tag plus a payload tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Which message this is.
    pub kind: PacketKind,
    /// The typed payload.
    pub payload: PayloadValue,
}

impl Packet {
    /// Assemble a packet.
    pub fn new(kind: PacketKind, payload: PayloadValue) -> Self {
        Self { kind, payload }
    }

    /// Encode to wire bytes: tag byte followed by the payload tree.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind.tag());
        self.payload.encode_into(&mut buf);
        buf
    }

    /// Decode a complete packet from `bytes`.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] variant on malformed input, including
    /// [`ProtocolError::TrailingBytes`] if the buffer holds more than one
    /// packet -- framing is the transport's job, one message per frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let offset = reader.pos;
        let tag = reader.take_u8()?;
        let kind = PacketKind::from_tag(tag).ok_or(ProtocolError::UnknownTag {
            what: "packet",
            tag,
            offset,
        })?;
        let payload = PayloadValue::decode_from(&mut reader, 0)?;
        if reader.remaining() != 0 {
            return Err(ProtocolError::TrailingBytes {
                remaining: reader.remaining(),
            });
        }
        Ok(Packet { kind, payload })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_mapping_is_exhaustive_and_stable() {
        for (index, kind) in PacketKind::ALL.iter().enumerate() {
            assert_eq!(kind.tag() as usize, index);
            assert_eq!(PacketKind::from_tag(kind.tag()), Some(*kind));
        }
        assert_eq!(PacketKind::from_tag(11), None);
        assert_eq!(PacketKind::from_tag(255), None);
    }

    #[test]
    fn packet_roundtrip() {
        let mut payload = PayloadValue::object();
        payload.set("serverTime", PayloadValue::Float(12.5));
        let packet = Packet::new(PacketKind::Snapshot, payload);

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn ping_pong_are_tiny() {
        let ping = Packet::new(PacketKind::Ping, PayloadValue::Null);
        // Tag byte + null tag: the keepalive probe is exactly two bytes.
        assert_eq!(ping.encode().len(), 2);
    }

    #[test]
    fn unknown_packet_tag_is_malformed() {
        let err = Packet::decode(&[0xee, 0x00]).unwrap_err();
        assert!(
            matches!(err, ProtocolError::UnknownTag { what: "packet", .. }),
            "{err:?}"
        );
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut bytes = Packet::new(PacketKind::Pong, PayloadValue::Null).encode();
        bytes.push(0x00);
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::TrailingBytes { remaining: 1 }));
    }

    #[test]
    fn empty_input_is_malformed() {
        let err = Packet::decode(&[]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { offset: 0 }));
    }
}
