//! The tick-synchronized client runtime.
//!
//! A client connects, applies the join snapshot, and then runs the same
//! world the server runs: its own player under the capsule controller,
//! everyone else interpolated from the authoritative stream. The render
//! loop is an external collaborator; it calls [`Client::frame`] once per
//! display frame with the collected input.

use atrium_assets::AssetCache;
use atrium_protocol::messages::{
    ChatMessageWire, EntityEventMsg, EntityModifiedMsg, PlayerTeleportMsg, SnapshotMsg,
};
use atrium_protocol::{Packet, PacketKind, PayloadValue, SessionId};
use atrium_world::blueprint::Blueprint;
use atrium_world::entity::{Entity, EntityKind, EntityRecord};
use atrium_world::math::Pose;
use atrium_world::player::InputFrame;
use atrium_world::tick::TickConfig;
use atrium_world::{World, WorldConfig};
use futures_util::{SinkExt, StreamExt};
use nalgebra::Vector3;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::NetError;

/// A connected client.
pub struct Client {
    /// The replicated world, local player included.
    pub world: World,
    /// The network id the server assigned us.
    pub session: SessionId,
    /// The refreshed auth token to present on the next join.
    pub auth_token: String,
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Client {
    /// Connect to `addr` (host:port), authenticate, and apply the join
    /// snapshot. Must be called inside a `LocalSet`.
    ///
    /// # Errors
    ///
    /// [`NetError`] on dial, handshake or snapshot failure.
    pub async fn connect(
        addr: &str,
        name: &str,
        token: Option<&str>,
        config: &Config,
        cache: AssetCache,
    ) -> Result<Self, NetError> {
        let mut url = format!("ws://{addr}/?name={name}");
        if let Some(token) = token {
            url.push_str("&token=");
            url.push_str(token);
        }
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| NetError::Handshake(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        // Writer task.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_local(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
        });

        // The first frame must be the snapshot.
        let first = loop {
            match source.next().await {
                Some(Ok(Message::Binary(bytes))) => break bytes,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(NetError::Transport(e.to_string())),
                None => return Err(NetError::Closed("before snapshot".to_owned())),
            }
        };
        let packet = Packet::decode(&first)?;
        let snapshot = SnapshotMsg::from_packet(&packet)?;
        info!(session = %snapshot.session_id, "snapshot received");

        // Reader task.
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_local(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(bytes)) => {
                        if inbound_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let world_config = WorldConfig {
            tick: TickConfig {
                tick_rate: config.tick_rate,
                ..TickConfig::default()
            },
            network_rate: config.network_rate,
            is_server: false,
            local_session: Some(snapshot.session_id),
            show_local_nametag: config.show_local_nametag,
            show_remote_nametags: config.show_remote_nametags,
            ..WorldConfig::default()
        };
        let mut world = World::new(world_config, cache);
        world.apply_snapshot(
            snapshot.session_id,
            snapshot.chat.clone(),
            &snapshot.blueprints,
            &snapshot.entities,
        )?;
        world.start_preload();

        Ok(Self {
            world,
            session: snapshot.session_id,
            auth_token: snapshot.auth_token,
            inbound_rx,
            outbound_tx,
        })
    }

    /// One display frame: drain inbound packets, advance the world, flush
    /// the outbox to the socket.
    pub fn frame(&mut self, dt: f64, input: InputFrame) {
        while let Ok(bytes) = self.inbound_rx.try_recv() {
            if let Err(err) = self.apply_inbound(&bytes) {
                warn!(%err, "inbound packet dropped");
            }
        }
        self.world.frame(dt, input);
        for packet in self.world.take_outbox() {
            self.send(&packet);
        }
    }

    /// Send a chat line (or command) to the server.
    pub fn send_chat(&mut self, body: &str) {
        let message = ChatMessageWire {
            id: 0,
            from_entity: self.world.store.local_player(),
            author: None,
            body: body.to_owned(),
            timestamp: self.world.sim_time(),
        };
        self.send(&message.to_packet());
    }

    /// Queue a packet to the server.
    pub fn send(&self, packet: &Packet) {
        if self.outbound_tx.send(packet.encode()).is_err() {
            debug!("send after disconnect dropped");
        }
    }

    /// Whether the socket is still believed open.
    pub fn connected(&self) -> bool {
        !self.outbound_tx.is_closed()
    }

    // -- inbound -------------------------------------------------------------

    fn apply_inbound(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        let packet = Packet::decode(bytes)?;
        match packet.kind {
            PacketKind::Ping => {
                self.send(&Packet::new(PacketKind::Pong, PayloadValue::Null));
            }
            PacketKind::Pong => {}
            PacketKind::Snapshot => {
                debug!("duplicate snapshot ignored");
            }
            PacketKind::EntityAdded => {
                let json = packet.payload.to_json()?;
                let record: EntityRecord = serde_json::from_value(json).map_err(|e| {
                    NetError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
                        message: "entityAdded",
                        detail: e.to_string(),
                    })
                })?;
                self.apply_entity_added(record);
            }
            PacketKind::EntityModified => {
                let msg = EntityModifiedMsg::from_payload(&packet.payload)?;
                self.world.apply_entity_modified(&msg, None)?;
            }
            PacketKind::EntityRemoved => {
                let id = atrium_protocol::EntityId::from_value(&packet.payload)?;
                self.world.remove_entity(&id);
            }
            PacketKind::EntityEvent => {
                let msg = EntityEventMsg::from_payload(&packet.payload)?;
                self.world.apply_entity_event(&msg, None)?;
            }
            PacketKind::BlueprintAdded | PacketKind::BlueprintModified => {
                let json = packet.payload.to_json()?;
                let blueprint: Blueprint = serde_json::from_value(json).map_err(|e| {
                    NetError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
                        message: "blueprint",
                        detail: e.to_string(),
                    })
                })?;
                self.world.apply_blueprint(blueprint);
            }
            PacketKind::ChatAdded => {
                let message = ChatMessageWire::from_value(&packet.payload)?;
                self.world.chat.add_existing(message);
            }
            PacketKind::PlayerTeleport => {
                let msg = PlayerTeleportMsg::from_payload(&packet.payload)?;
                self.world.teleport_local(
                    Vector3::new(msg.position[0], msg.position[1], msg.position[2]),
                    msg.yaw,
                );
            }
        }
        Ok(())
    }

    fn apply_entity_added(&mut self, record: EntityRecord) {
        let pose = Pose::from_wire(record.position, record.quaternion);
        match record.kind {
            EntityKind::Player => {
                let Some(session) = record.owner else { return };
                if session == self.session {
                    return; // our own player came with the snapshot
                }
                let user = record.user.unwrap_or(atrium_world::entity::UserRecord {
                    id: String::new(),
                    name: "anonymous".to_owned(),
                    roles: vec![],
                    avatar: None,
                });
                self.world
                    .spawn_remote_player(record.id, session, user, pose);
            }
            EntityKind::App => {
                let Some(blueprint) = record.blueprint else {
                    return;
                };
                let id = self
                    .world
                    .spawn_app(record.id, blueprint, record.owner, pose);
                if let Some(app) = self
                    .world
                    .store
                    .get_mut(&id)
                    .and_then(Entity::as_app_mut)
                {
                    if let Some(scale) = record.scale {
                        app.scale = Vector3::new(scale[0], scale[1], scale[2]);
                    }
                    if let Some(state) = record.state {
                        app.state = state;
                    }
                }
            }
        }
    }
}
