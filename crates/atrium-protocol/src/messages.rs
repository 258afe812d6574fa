//! Typed views over the payload tree for the structured messages.
//!
//! The codec itself is schema-free; these views give the rest of the system
//! a typed surface for the messages whose shape the protocol fixes. Fields
//! the protocol treats as opaque (blueprint records, entity records, user
//! records, script `state` blobs) stay as [`PayloadValue`] subtrees and are
//! shaped by the world layer.
//!
//! # Partial updates
//!
//! `entityModified` is a partial record: a field that is absent leaves the
//! receiver's value untouched, while a field that is present-but-null
//! clears it. The `mover`/`uploader` tags rely on that distinction, so the
//! view models them as `Option<Option<SessionId>>` (outer: presence,
//! inner: value).

use crate::ids::{BlueprintId, EntityId, SessionId};
use crate::packet::{Packet, PacketKind};
use crate::value::PayloadValue;
use crate::ProtocolError;

fn mismatch(message: &'static str, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::SchemaMismatch {
        message,
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// Small wire enums
// ---------------------------------------------------------------------------

/// Animation-clip token for the player pose stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Emote {
    /// Standing still.
    Idle,
    /// Walking speed.
    Walk,
    /// Running speed.
    Run,
    /// Airborne.
    Float,
}

impl Emote {
    /// Wire tag.
    pub fn tag(self) -> i64 {
        match self {
            Emote::Idle => 0,
            Emote::Walk => 1,
            Emote::Run => 2,
            Emote::Float => 3,
        }
    }

    /// Reverse of [`tag`](Self::tag).
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(Emote::Idle),
            1 => Some(Emote::Walk),
            2 => Some(Emote::Run),
            3 => Some(Emote::Float),
            _ => None,
        }
    }
}

/// Authoring mode of an app transform gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TransformMode {
    /// Not being authored.
    #[default]
    None,
    /// Dragging along the ground / vertically.
    Move,
    /// Rotating.
    Rotate,
    /// Scaling.
    Scale,
}

impl TransformMode {
    /// Wire tag.
    pub fn tag(self) -> i64 {
        match self {
            TransformMode::None => 0,
            TransformMode::Move => 1,
            TransformMode::Rotate => 2,
            TransformMode::Scale => 3,
        }
    }

    /// Reverse of [`tag`](Self::tag).
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(TransformMode::None),
            1 => Some(TransformMode::Move),
            2 => Some(TransformMode::Rotate),
            3 => Some(TransformMode::Scale),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

fn vec_to_value(v: &[f64]) -> PayloadValue {
    PayloadValue::Array(v.iter().map(|&f| PayloadValue::Float(f)).collect())
}

fn value_to_vec<const N: usize>(
    value: &PayloadValue,
    message: &'static str,
) -> Result<[f64; N], ProtocolError> {
    let items = value
        .as_array()
        .filter(|a| a.len() == N)
        .ok_or_else(|| mismatch(message, format!("expected an array of {N} numbers")))?;
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_f64()
            .ok_or_else(|| mismatch(message, "non-numeric vector component"))?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// One chat-log line as it travels on the wire.
///
/// Server-originated system messages carry no sender: `from_entity` and
/// `author` are both encoded as null, never a sentinel id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessageWire {
    /// Monotone message id within the log.
    pub id: u64,
    /// Sending entity, if any.
    pub from_entity: Option<EntityId>,
    /// Display name of the author, if any.
    pub author: Option<String>,
    /// Message body.
    pub body: String,
    /// Server time at append, seconds.
    pub timestamp: f64,
}

impl ChatMessageWire {
    /// Wire encoding.
    pub fn to_value(&self) -> PayloadValue {
        let mut obj = PayloadValue::object();
        obj.set("id", PayloadValue::Int(self.id as i64));
        obj.set(
            "from",
            self.from_entity
                .as_ref()
                .map(EntityId::to_value)
                .unwrap_or(PayloadValue::Null),
        );
        obj.set(
            "author",
            self.author
                .clone()
                .map(PayloadValue::Str)
                .unwrap_or(PayloadValue::Null),
        );
        obj.set("body", PayloadValue::Str(self.body.clone()));
        obj.set("timestamp", PayloadValue::Float(self.timestamp));
        obj
    }

    /// Decode from the wire encoding.
    pub fn from_value(value: &PayloadValue) -> Result<Self, ProtocolError> {
        const M: &str = "chatAdded";
        let id = value
            .get("id")
            .and_then(PayloadValue::as_i64)
            .ok_or_else(|| mismatch(M, "missing id"))? as u64;
        let from_entity = match value.get("from") {
            None | Some(PayloadValue::Null) => None,
            Some(v) => Some(EntityId::from_value(v)?),
        };
        let author = match value.get("author") {
            None | Some(PayloadValue::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| mismatch(M, "author is not a string"))?
                    .to_owned(),
            ),
        };
        let body = value
            .get("body")
            .and_then(PayloadValue::as_str)
            .ok_or_else(|| mismatch(M, "missing body"))?
            .to_owned();
        let timestamp = value
            .get("timestamp")
            .and_then(PayloadValue::as_f64)
            .unwrap_or(0.0);
        Ok(Self {
            id,
            from_entity,
            author,
            body,
            timestamp,
        })
    }

    /// Wrap into a `chatAdded` packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketKind::ChatAdded, self.to_value())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full world state sent to a client on connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMsg {
    /// The network id assigned to the joining socket.
    pub session_id: SessionId,
    /// Server time at emission, seconds.
    pub server_time: f64,
    /// The chat ring, oldest first.
    pub chat: Vec<ChatMessageWire>,
    /// Blueprint registry, shaped by the world layer.
    pub blueprints: PayloadValue,
    /// Entity registry, shaped by the world layer.
    pub entities: PayloadValue,
    /// Refreshed auth token for this user.
    pub auth_token: String,
}

impl SnapshotMsg {
    /// Wrap into a `snapshot` packet.
    pub fn to_packet(&self) -> Packet {
        let mut obj = PayloadValue::object();
        obj.set("id", self.session_id.to_value());
        obj.set("serverTime", PayloadValue::Float(self.server_time));
        obj.set(
            "chat",
            PayloadValue::Array(self.chat.iter().map(ChatMessageWire::to_value).collect()),
        );
        obj.set("blueprints", self.blueprints.clone());
        obj.set("entities", self.entities.clone());
        obj.set("authToken", PayloadValue::Str(self.auth_token.clone()));
        Packet::new(PacketKind::Snapshot, obj)
    }

    /// Read a `snapshot` packet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SchemaMismatch`] if the packet is not a snapshot or
    /// a required field is missing.
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        const M: &str = "snapshot";
        if packet.kind != PacketKind::Snapshot {
            return Err(mismatch(M, format!("packet is {}", packet.kind.name())));
        }
        let payload = &packet.payload;
        let session_id = SessionId::from_value(
            payload.get("id").ok_or_else(|| mismatch(M, "missing id"))?,
        )?;
        let server_time = payload
            .get("serverTime")
            .and_then(PayloadValue::as_f64)
            .ok_or_else(|| mismatch(M, "missing serverTime"))?;
        let chat = payload
            .get("chat")
            .and_then(PayloadValue::as_array)
            .ok_or_else(|| mismatch(M, "missing chat"))?
            .iter()
            .map(ChatMessageWire::from_value)
            .collect::<Result<_, _>>()?;
        let blueprints = payload
            .get("blueprints")
            .cloned()
            .ok_or_else(|| mismatch(M, "missing blueprints"))?;
        let entities = payload
            .get("entities")
            .cloned()
            .ok_or_else(|| mismatch(M, "missing entities"))?;
        let auth_token = payload
            .get("authToken")
            .and_then(PayloadValue::as_str)
            .ok_or_else(|| mismatch(M, "missing authToken"))?
            .to_owned();
        Ok(Self {
            session_id,
            server_time,
            chat,
            blueprints,
            entities,
            auth_token,
        })
    }
}

// ---------------------------------------------------------------------------
// entityModified
// ---------------------------------------------------------------------------

/// Partial update of an entity's replicated record.
///
/// The short keys `p`, `q`, `e` carry the high-rate player pose stream;
/// `t` flags a teleport so remote interpolators snap instead of easing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityModifiedMsg {
    /// Target entity. Always present.
    pub id: Option<EntityId>,
    /// Rebuild against this blueprint id.
    pub blueprint: Option<BlueprintId>,
    /// Uploader tag: outer = field presence, inner = value (None clears).
    pub uploader: Option<Option<SessionId>>,
    /// Mover tag: outer = field presence, inner = value (None clears).
    pub mover: Option<Option<SessionId>>,
    /// Authoring mode.
    pub transform_mode: Option<TransformMode>,
    /// Authored position.
    pub position: Option<[f64; 3]>,
    /// Authored orientation quaternion (x, y, z, w).
    pub quaternion: Option<[f64; 4]>,
    /// Authored scale.
    pub scale: Option<[f64; 3]>,
    /// Script-owned state blob (opaque; present-null clears).
    pub state: Option<PayloadValue>,
    /// User record update (opaque).
    pub user: Option<PayloadValue>,
    /// Pose stream: position.
    pub pose_position: Option<[f64; 3]>,
    /// Pose stream: orientation quaternion.
    pub pose_quaternion: Option<[f64; 4]>,
    /// Pose stream: emote token.
    pub emote: Option<Emote>,
    /// Teleport flag; remotes force-snap their interpolators.
    pub teleport: bool,
}

impl EntityModifiedMsg {
    /// Start a partial update for `id`.
    pub fn for_entity(id: EntityId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Wrap into an `entityModified` packet.
    pub fn to_packet(&self) -> Packet {
        let mut obj = PayloadValue::object();
        if let Some(id) = &self.id {
            obj.set("id", id.to_value());
        }
        if let Some(blueprint) = &self.blueprint {
            obj.set("blueprint", blueprint.to_value());
        }
        if let Some(uploader) = &self.uploader {
            obj.set(
                "uploader",
                uploader
                    .as_ref()
                    .map(SessionId::to_value)
                    .unwrap_or(PayloadValue::Null),
            );
        }
        if let Some(mover) = &self.mover {
            obj.set(
                "mover",
                mover
                    .as_ref()
                    .map(SessionId::to_value)
                    .unwrap_or(PayloadValue::Null),
            );
        }
        if let Some(mode) = self.transform_mode {
            obj.set("transformMode", PayloadValue::Int(mode.tag()));
        }
        if let Some(position) = &self.position {
            obj.set("position", vec_to_value(position));
        }
        if let Some(quaternion) = &self.quaternion {
            obj.set("quaternion", vec_to_value(quaternion));
        }
        if let Some(scale) = &self.scale {
            obj.set("scale", vec_to_value(scale));
        }
        if let Some(state) = &self.state {
            obj.set("state", state.clone());
        }
        if let Some(user) = &self.user {
            obj.set("user", user.clone());
        }
        if let Some(p) = &self.pose_position {
            obj.set("p", vec_to_value(p));
        }
        if let Some(q) = &self.pose_quaternion {
            obj.set("q", vec_to_value(q));
        }
        if let Some(emote) = self.emote {
            obj.set("e", PayloadValue::Int(emote.tag()));
        }
        if self.teleport {
            obj.set("t", PayloadValue::Bool(true));
        }
        Packet::new(PacketKind::EntityModified, obj)
    }

    /// Read an `entityModified` (or `entityAdded`-shaped) payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SchemaMismatch`] if `id` is missing or any present
    /// field has the wrong shape.
    pub fn from_payload(payload: &PayloadValue) -> Result<Self, ProtocolError> {
        const M: &str = "entityModified";
        let mut msg = Self::default();
        msg.id = Some(EntityId::from_value(
            payload.get("id").ok_or_else(|| mismatch(M, "missing id"))?,
        )?);
        if let Some(v) = payload.get("blueprint") {
            msg.blueprint = Some(BlueprintId::from_value(v)?);
        }
        if let Some(v) = payload.get("uploader") {
            msg.uploader = Some(match v {
                PayloadValue::Null => None,
                v => Some(SessionId::from_value(v)?),
            });
        }
        if let Some(v) = payload.get("mover") {
            msg.mover = Some(match v {
                PayloadValue::Null => None,
                v => Some(SessionId::from_value(v)?),
            });
        }
        if let Some(v) = payload.get("transformMode") {
            let tag = v
                .as_i64()
                .ok_or_else(|| mismatch(M, "transformMode is not an integer"))?;
            msg.transform_mode =
                Some(TransformMode::from_tag(tag).ok_or_else(|| {
                    mismatch(M, format!("unknown transform mode {tag}"))
                })?);
        }
        if let Some(v) = payload.get("position") {
            msg.position = Some(value_to_vec::<3>(v, M)?);
        }
        if let Some(v) = payload.get("quaternion") {
            msg.quaternion = Some(value_to_vec::<4>(v, M)?);
        }
        if let Some(v) = payload.get("scale") {
            msg.scale = Some(value_to_vec::<3>(v, M)?);
        }
        if let Some(v) = payload.get("state") {
            msg.state = Some(v.clone());
        }
        if let Some(v) = payload.get("user") {
            msg.user = Some(v.clone());
        }
        if let Some(v) = payload.get("p") {
            msg.pose_position = Some(value_to_vec::<3>(v, M)?);
        }
        if let Some(v) = payload.get("q") {
            msg.pose_quaternion = Some(value_to_vec::<4>(v, M)?);
        }
        if let Some(v) = payload.get("e") {
            let tag = v
                .as_i64()
                .ok_or_else(|| mismatch(M, "emote is not an integer"))?;
            msg.emote = Some(
                Emote::from_tag(tag)
                    .ok_or_else(|| mismatch(M, format!("unknown emote {tag}")))?,
            );
        }
        msg.teleport = payload
            .get("t")
            .and_then(PayloadValue::as_bool)
            .unwrap_or(false);
        Ok(msg)
    }

    /// The target entity id.
    ///
    /// # Panics
    ///
    /// Panics if the message was built without an id, which
    /// [`from_payload`](Self::from_payload) never produces.
    pub fn entity_id(&self) -> EntityId {
        self.id.expect("entityModified without id")
    }
}

// ---------------------------------------------------------------------------
// entityEvent
// ---------------------------------------------------------------------------

/// A named event targeted at one entity's script.
///
/// Wire shape is the quadruple `[entityId, version, name, data]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEventMsg {
    /// Target entity.
    pub entity: EntityId,
    /// Blueprint version the sender was built against. Used to gate events
    /// across rebuild boundaries.
    pub version: u32,
    /// Event name.
    pub name: String,
    /// Opaque event data.
    pub data: PayloadValue,
}

impl EntityEventMsg {
    /// Wrap into an `entityEvent` packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketKind::EntityEvent,
            PayloadValue::Array(vec![
                self.entity.to_value(),
                PayloadValue::Int(self.version as i64),
                PayloadValue::Str(self.name.clone()),
                self.data.clone(),
            ]),
        )
    }

    /// Read an `entityEvent` payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SchemaMismatch`] unless the payload is the expected
    /// quadruple.
    pub fn from_payload(payload: &PayloadValue) -> Result<Self, ProtocolError> {
        const M: &str = "entityEvent";
        let items = payload
            .as_array()
            .filter(|a| a.len() == 4)
            .ok_or_else(|| mismatch(M, "expected [entity, version, name, data]"))?;
        let entity = EntityId::from_value(&items[0])?;
        let version = items[1]
            .as_i64()
            .filter(|v| *v >= 0)
            .ok_or_else(|| mismatch(M, "version is not a non-negative integer"))?
            as u32;
        let name = items[2]
            .as_str()
            .ok_or_else(|| mismatch(M, "name is not a string"))?
            .to_owned();
        Ok(Self {
            entity,
            version,
            name,
            data: items[3].clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// playerTeleport
// ---------------------------------------------------------------------------

/// Order the local player to a new pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerTeleportMsg {
    /// Destination position.
    pub position: [f64; 3],
    /// Optional yaw, radians.
    pub yaw: Option<f64>,
}

impl PlayerTeleportMsg {
    /// Wrap into a `playerTeleport` packet.
    pub fn to_packet(&self) -> Packet {
        let mut obj = PayloadValue::object();
        obj.set("position", vec_to_value(&self.position));
        if let Some(yaw) = self.yaw {
            obj.set("yaw", PayloadValue::Float(yaw));
        }
        Packet::new(PacketKind::PlayerTeleport, obj)
    }

    /// Read a `playerTeleport` payload.
    pub fn from_payload(payload: &PayloadValue) -> Result<Self, ProtocolError> {
        const M: &str = "playerTeleport";
        let position = value_to_vec::<3>(
            payload
                .get("position")
                .ok_or_else(|| mismatch(M, "missing position"))?,
            M,
        )?;
        let yaw = payload.get("yaw").and_then(PayloadValue::as_f64);
        Ok(Self { position, yaw })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(n: u8) -> EntityId {
        EntityId::from_bytes([n; 16])
    }

    #[test]
    fn chat_roundtrip_with_and_without_sender() {
        let from_player = ChatMessageWire {
            id: 3,
            from_entity: Some(entity(1)),
            author: Some("ada".to_owned()),
            body: "hello".to_owned(),
            timestamp: 10.0,
        };
        let system = ChatMessageWire {
            id: 4,
            from_entity: None,
            author: None,
            body: "spawn point set".to_owned(),
            timestamp: 11.0,
        };
        for msg in [from_player, system] {
            let back = ChatMessageWire::from_value(&msg.to_value()).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let msg = SnapshotMsg {
            session_id: SessionId(7),
            server_time: 123.25,
            chat: vec![ChatMessageWire {
                id: 1,
                from_entity: None,
                author: None,
                body: "welcome".to_owned(),
                timestamp: 1.0,
            }],
            blueprints: PayloadValue::Array(vec![]),
            entities: PayloadValue::Array(vec![]),
            auth_token: "tok".to_owned(),
        };
        let packet = msg.to_packet();
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(SnapshotMsg::from_packet(&decoded).unwrap(), msg);
    }

    #[test]
    fn entity_modified_partial_fields_roundtrip() {
        let mut msg = EntityModifiedMsg::for_entity(entity(9));
        msg.mover = Some(None); // present-but-null: clears the tag
        msg.position = Some([1.0, 2.0, 3.0]);
        msg.teleport = true;

        let packet = msg.to_packet();
        let decoded = EntityModifiedMsg::from_payload(&packet.payload).unwrap();
        assert_eq!(decoded, msg);
        // Absent fields stay absent.
        assert_eq!(decoded.uploader, None);
        assert_eq!(decoded.scale, None);
        // Present-null mover decodes as Some(None).
        assert_eq!(decoded.mover, Some(None));
    }

    #[test]
    fn pose_stream_uses_short_keys() {
        let mut msg = EntityModifiedMsg::for_entity(entity(2));
        msg.pose_position = Some([0.0, 1.0, 0.0]);
        msg.pose_quaternion = Some([0.0, 0.0, 0.0, 1.0]);
        msg.emote = Some(Emote::Run);

        let packet = msg.to_packet();
        assert!(packet.payload.get("p").is_some());
        assert!(packet.payload.get("q").is_some());
        assert!(packet.payload.get("e").is_some());
        assert!(packet.payload.get("position").is_none());

        let decoded = EntityModifiedMsg::from_payload(&packet.payload).unwrap();
        assert_eq!(decoded.emote, Some(Emote::Run));
        assert!(!decoded.teleport, "t defaults to false when absent");
    }

    #[test]
    fn entity_modified_requires_id() {
        let err = EntityModifiedMsg::from_payload(&PayloadValue::object()).unwrap_err();
        assert!(matches!(err, ProtocolError::SchemaMismatch { .. }));
    }

    #[test]
    fn entity_event_roundtrip() {
        let msg = EntityEventMsg {
            entity: entity(5),
            version: 12,
            name: "pressed".to_owned(),
            data: PayloadValue::Int(1),
        };
        let packet = msg.to_packet();
        let decoded = EntityEventMsg::from_payload(&packet.payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn entity_event_rejects_short_tuple() {
        let payload = PayloadValue::Array(vec![entity(5).to_value(), PayloadValue::Int(0)]);
        assert!(EntityEventMsg::from_payload(&payload).is_err());
    }

    #[test]
    fn teleport_roundtrip() {
        for yaw in [None, Some(1.25)] {
            let msg = PlayerTeleportMsg {
                position: [4.0, 0.0, -2.0],
                yaw,
            };
            let decoded = PlayerTeleportMsg::from_payload(&msg.to_packet().payload).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn emote_tags_roundtrip() {
        for emote in [Emote::Idle, Emote::Walk, Emote::Run, Emote::Float] {
            assert_eq!(Emote::from_tag(emote.tag()), Some(emote));
        }
        assert_eq!(Emote::from_tag(9), None);
    }
}
