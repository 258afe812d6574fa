//! The world aggregate and the inbound application layer.
//!
//! One [`World`] instance runs per process -- authoritative on the server,
//! replicated on every client -- and both sides advance it with the same
//! [`TickEngine`]. Outbound packets accumulate in the outbox; the session
//! layer drains it after every frame and broadcasts. Inbound packets are
//! applied between frames through the `apply_*` methods.
//!
//! Build completions and script-requested fetches come back through a
//! completion channel drained at the start of each frame, so asynchronous
//! work never lands mid-phase.

use std::collections::HashMap;

use atrium_assets::{AssetCache, AssetExt, AssetKind, AssetUrl};
use atrium_protocol::messages::{ChatMessageWire, EntityEventMsg, EntityModifiedMsg};
use atrium_protocol::{BlueprintId, EntityId, Packet, PacketKind, PayloadValue, SessionId};
use atrium_script::{SandboxConfig, ScriptOutputs};
use futures_util::future::{AbortHandle, Abortable};
use nalgebra::Vector3;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{fetch_build_assets, App, AuthoringInput, BuildCtx, BuiltAssets, EventOutcome};
use crate::blueprint::{Blueprint, BlueprintRegistry};
use crate::chat::ChatLog;
use crate::controller::CharacterController;
use crate::entity::{Entity, EntityKind, EntityRecord, UserRecord};
use crate::events::EventBus;
use crate::persist::{DirtySets, PersistedWorld, SpawnPoint};
use crate::physics::PhysicsArena;
use crate::player::{InputFrame, Player};
use crate::scene::SceneGraph;
use crate::store::EntityStore;
use crate::tick::{TickConfig, TickEngine, TickPhases};
use crate::{fresh_entity_id, WorldError};

/// Player capsule dimensions.
const PLAYER_RADIUS: f64 = 0.3;
const PLAYER_HALF_HEIGHT: f64 = 0.6;
const PLAYER_MASS: f64 = 60.0;

// ---------------------------------------------------------------------------
// Config & completions
// ---------------------------------------------------------------------------

/// Per-world configuration.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Tick timing.
    pub tick: TickConfig,
    /// Player pose broadcast rate, Hz.
    pub network_rate: f64,
    /// Script sandbox budgets.
    pub sandbox: SandboxConfig,
    /// Whether this process is the authoritative server.
    pub is_server: bool,
    /// This process's session id (assigned at connect for clients; the
    /// server itself has none).
    pub local_session: Option<SessionId>,
    /// Show the local player's nametag.
    pub show_local_nametag: bool,
    /// Show remote players' nametags.
    pub show_remote_nametags: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            network_rate: 8.0,
            sandbox: SandboxConfig::default(),
            is_server: false,
            local_session: None,
            show_local_nametag: false,
            show_remote_nametags: true,
        }
    }
}

/// Asynchronous work delivered back to the simulation between frames.
enum Completion {
    /// An app build's fetch phase finished.
    Build {
        entity: EntityId,
        generation: u64,
        blueprint_version: u32,
        assets: BuiltAssets,
    },
    /// A script-requested fetch settled.
    Fetch {
        entity: EntityId,
        url: String,
        ok: bool,
    },
    /// The preload set resolved (or failed).
    Preloaded { ok: bool },
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The whole simulation state of one process.
pub struct World {
    /// Configuration.
    pub config: WorldConfig,
    /// Live entities.
    pub store: EntityStore,
    /// Blueprint catalog.
    pub blueprints: BlueprintRegistry,
    /// Chat ring.
    pub chat: ChatLog,
    /// Local event bus.
    pub bus: EventBus,
    /// Scene arena.
    pub scene: SceneGraph,
    /// Physics arena.
    pub physics: PhysicsArena,
    /// Asset cache.
    pub assets: AssetCache,
    /// Persistence dirty-sets.
    pub dirty: DirtySets,
    /// Persisted spawn point, if set.
    pub spawn: Option<SpawnPoint>,

    engine: Option<TickEngine>,
    shared_scripts: HashMap<(BlueprintId, u32), serde_json::Value>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    outbox: Vec<Packet>,
    frame_input: InputFrame,
}

impl World {
    /// A fresh world over the given asset cache.
    pub fn new(config: WorldConfig, assets: AssetCache) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let engine = TickEngine::new(config.tick.clone());
        Self {
            config,
            store: EntityStore::new(),
            blueprints: BlueprintRegistry::new(),
            chat: ChatLog::new(),
            bus: EventBus::new(),
            scene: SceneGraph::new(),
            physics: PhysicsArena::new(),
            assets,
            dirty: DirtySets::new(),
            spawn: None,
            engine: Some(engine),
            shared_scripts: HashMap::new(),
            completions_tx,
            completions_rx,
            outbox: Vec::new(),
            frame_input: InputFrame::default(),
        }
    }

    /// Seconds between pose broadcasts.
    pub fn network_interval(&self) -> f64 {
        1.0 / self.config.network_rate
    }

    /// Fixed steps executed so far.
    pub fn tick_count(&self) -> u64 {
        self.engine.as_ref().map_or(0, TickEngine::tick_count)
    }

    /// Simulation time, seconds.
    pub fn sim_time(&self) -> f64 {
        self.engine.as_ref().map_or(0.0, TickEngine::sim_time)
    }

    /// Drain the packets queued for broadcast.
    pub fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    /// Queue a packet for broadcast.
    pub fn push_outbox(&mut self, packet: Packet) {
        self.outbox.push(packet);
    }

    /// Advance one frame: drain async completions, then run the phases.
    pub fn frame(&mut self, frame_dt: f64, input: InputFrame) {
        self.drain_completions();
        self.frame_input = input;
        let mut engine = self.engine.take().expect("engine present");
        engine.advance(self, frame_dt);
        self.engine = Some(engine);
    }

    // -- entity construction -------------------------------------------------

    /// Spawn the locally-owned player at the world spawn point.
    pub fn spawn_local_player(&mut self, session: SessionId, user: UserRecord) -> EntityId {
        self.spawn_local_player_with_id(fresh_entity_id(), session, user)
    }

    /// Spawn the local player under a server-assigned entity id (client
    /// join path).
    pub fn spawn_local_player_with_id(
        &mut self,
        id: EntityId,
        session: SessionId,
        user: UserRecord,
    ) -> EntityId {
        let pose = self.spawn_pose();
        let controller = CharacterController::spawn(
            &mut self.physics,
            pose,
            PLAYER_RADIUS,
            PLAYER_HALF_HEIGHT,
            PLAYER_MASS,
        );
        let interval = self.network_interval();
        let player = Player::local(id, session, user, controller, pose, interval);
        self.store.add(Entity::Player(player), true);
        self.store.set_hot(id, true);
        info!(%id, %session, "local player spawned");
        id
    }

    /// Spawn a remote player replica. The server gives it a kinematic
    /// capsule so apps can collide with it.
    pub fn spawn_remote_player(
        &mut self,
        id: EntityId,
        session: SessionId,
        user: UserRecord,
        pose: crate::math::Pose,
    ) -> EntityId {
        let interval = self.network_interval();
        let mut player = Player::remote(id, session, user, pose, interval);
        if self.config.is_server {
            player.attach_capsule(&mut self.physics, PLAYER_RADIUS, PLAYER_HALF_HEIGHT);
        }
        self.store.add(Entity::Player(player), false);
        self.store.set_hot(id, true);
        id
    }

    /// Create an app entity and start its first build.
    pub fn spawn_app(
        &mut self,
        id: EntityId,
        blueprint: BlueprintId,
        owner: Option<SessionId>,
        pose: crate::math::Pose,
    ) -> EntityId {
        let interval = self.network_interval();
        let app = App::new(id, blueprint, owner, pose, interval);
        self.store.add(Entity::App(app), false);
        self.dirty.entities.insert(id);
        self.request_rebuild(id);
        id
    }

    /// Remove an entity, releasing scene and physics resources.
    pub fn remove_entity(&mut self, id: &EntityId) -> Option<EntityRecord> {
        let mut entity = self.store.remove(id)?;
        let record = entity.to_record();
        match &mut entity {
            Entity::Player(player) => player.release(&mut self.physics),
            Entity::App(app) => {
                app.unbuild(&mut self.scene, &mut self.physics, &mut self.shared_scripts)
            }
        }
        debug!(%id, "entity removed");
        Some(record)
    }

    /// A session disconnected: remove its player, clear `mover`/`uploader`
    /// tags pointing at it and rebuild the affected apps. Returns the
    /// removed player entity id, if there was one.
    pub fn handle_disconnect(&mut self, session: SessionId) -> Option<EntityId> {
        let player_id = self.store.player_ids().into_iter().find(|id| {
            self.store
                .get(id)
                .and_then(Entity::as_player)
                .is_some_and(|p| p.session == session)
        });
        if let Some(id) = player_id {
            self.remove_entity(&id);
            self.push_outbox(Packet::new(PacketKind::EntityRemoved, id.to_value()));
        }

        let mut rebuilds = Vec::new();
        for id in self.store.ids() {
            let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) else {
                continue;
            };
            let mut touched = false;
            if app.mover == Some(session) {
                app.mover = None;
                touched = true;
            }
            if app.uploader == Some(session) {
                app.uploader = None;
                touched = true;
            }
            if touched {
                app.common.bump_version();
                let mut msg = EntityModifiedMsg::for_entity(id);
                msg.mover = Some(None);
                msg.uploader = Some(None);
                self.push_outbox(msg.to_packet());
                rebuilds.push(id);
            }
        }
        for id in rebuilds {
            self.request_rebuild(id);
        }
        player_id
    }

    // -- builds --------------------------------------------------------------

    /// Kick off (or supersede) a build for an app. The fetch phase runs as
    /// a detached local task; completion lands on the next frame.
    pub fn request_rebuild(&mut self, id: EntityId) {
        let local_session = self.config.local_session;
        let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) else {
            return;
        };
        let generation = app.begin_build();
        let blueprint = self.blueprints.get(&app.blueprint).cloned();
        let blueprint_version = blueprint.as_ref().map_or(0, |bp| bp.version);
        let show_placeholder = app.uploader.is_some() && app.uploader != local_session;

        let (abort, registration) = AbortHandle::new_pair();
        if let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) {
            app.track_fetch(abort);
        }

        let cache = self.assets.clone();
        let tx = self.completions_tx.clone();
        tokio::task::spawn_local(async move {
            let fetch = Abortable::new(
                fetch_build_assets(cache, blueprint, show_placeholder),
                registration,
            );
            if let Ok(assets) = fetch.await {
                let _ = tx.send(Completion::Build {
                    entity: id,
                    generation,
                    blueprint_version,
                    assets,
                });
            }
        });
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            match completion {
                Completion::Build {
                    entity,
                    generation,
                    blueprint_version,
                    assets,
                } => self.finish_build(entity, generation, blueprint_version, assets),
                Completion::Fetch { entity, url, ok } => {
                    let tick = self.tick_count();
                    let sim_time = self.sim_time();
                    let data = PayloadValue::from_json(&serde_json::json!({
                        "url": url,
                        "ok": ok,
                    }));
                    let version = self
                        .store
                        .get(&entity)
                        .and_then(Entity::as_app)
                        .map_or(0, |a| a.built_version);
                    self.route_event(entity, version, "fetch", data, None, tick, sim_time);
                }
                Completion::Preloaded { ok } => {
                    self.bus.emit("ready", &serde_json::json!({ "ok": ok }));
                }
            }
        }
    }

    /// Resolve every asset named by a preload-flagged blueprint, then emit
    /// the local `ready` event. Call once after the catalog is populated
    /// (server rehydrate, client snapshot).
    pub fn start_preload(&mut self) {
        let mut items = Vec::new();
        for blueprint in self.blueprints.iter().filter(|bp| bp.preload) {
            if let Some(url) = &blueprint.model {
                items.push(atrium_assets::AssetKey::new(AssetKind::Model, url.clone()));
            }
            if let Some(url) = &blueprint.script {
                items.push(atrium_assets::AssetKey::new(AssetKind::Script, url.clone()));
            }
        }
        let cache = self.assets.clone();
        let tx = self.completions_tx.clone();
        tokio::task::spawn_local(async move {
            let ok = cache.preload(&items).await.is_ok();
            let _ = tx.send(Completion::Preloaded { ok });
        });
    }

    fn finish_build(
        &mut self,
        entity: EntityId,
        generation: u64,
        blueprint_version: u32,
        assets: BuiltAssets,
    ) {
        let tick = self.tick_count();
        let sim_time = self.sim_time();
        let Some(mut taken) = self.store.take(&entity) else {
            return;
        };
        let report = match taken.as_app_mut() {
            Some(app) => {
                let mut ctx = BuildCtx {
                    scene: &mut self.scene,
                    physics: &mut self.physics,
                    shared: &mut self.shared_scripts,
                    sandbox: &self.config.sandbox,
                    local_session: self.config.local_session,
                    tick,
                    sim_time,
                    blueprint_version,
                };
                Some(app.complete_build(&mut ctx, generation, assets))
            }
            None => None,
        };
        let built_version = taken.as_app().map_or(0, |a| a.built_version);
        self.store.restore(taken);

        let Some(report) = report else { return };
        if report.aborted {
            return;
        }
        self.store.set_hot(entity, report.hot);
        for outputs in report.outputs {
            self.absorb_script_outputs(entity, built_version, outputs);
        }
        if report.crashed {
            self.dirty.entities.insert(entity);
            let blueprint = self
                .store
                .get_mut(&entity)
                .and_then(Entity::as_app_mut)
                .map(|app| {
                    app.common.bump_version();
                    app.blueprint
                });
            // Peers observe an entityModified for a rebuild cycle. Only the
            // authoritative side announces it; clients crash (or not) on
            // their own copies, so echoing would bounce rebuilds across
            // the wire forever.
            if self.config.is_server {
                if let Some(blueprint) = blueprint {
                    let mut msg = EntityModifiedMsg::for_entity(entity);
                    msg.blueprint = Some(blueprint);
                    self.push_outbox(msg.to_packet());
                }
            }
        }
        self.bus.emit(
            "appBuilt",
            &serde_json::json!({ "id": entity.to_string(), "crashed": report.crashed }),
        );
    }

    /// Fan a script's outputs into the world: events broadcast to peers,
    /// fetches spawn chained to the app's abort set, transform/state edits
    /// land on the entity.
    fn absorb_script_outputs(&mut self, id: EntityId, version: u32, outputs: ScriptOutputs) {
        if let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) {
            app.apply_script_outputs(&outputs, &mut self.physics);
            if outputs.state.is_some() {
                self.dirty.entities.insert(id);
            }
        }
        for event in &outputs.events {
            let msg = EntityEventMsg {
                entity: id,
                version,
                name: event.name.clone(),
                data: PayloadValue::from_json(&event.data),
            };
            self.push_outbox(msg.to_packet());
        }
        for url in outputs.fetches {
            self.spawn_script_fetch(id, url);
        }
    }

    /// A script began a fetch through its proxy; chain it to the app's
    /// abort set and deliver the outcome as a later-tick event.
    fn spawn_script_fetch(&mut self, id: EntityId, url: String) {
        let kind = match AssetUrl::parse(&url).map(|u| u.ext()) {
            Ok(AssetExt::Glb) => AssetKind::Model,
            Ok(AssetExt::Vrm) => AssetKind::Avatar,
            Ok(AssetExt::Hdr) => AssetKind::Hdr,
            Ok(AssetExt::Jpg) | Ok(AssetExt::Png) => AssetKind::Texture,
            Ok(AssetExt::Wat) => AssetKind::Script,
            Err(err) => {
                warn!(app = %id, %url, error = %err, "script fetch rejected");
                return;
            }
        };
        let (abort, registration) = AbortHandle::new_pair();
        if let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) {
            app.track_fetch(abort);
        }
        let cache = self.assets.clone();
        let tx = self.completions_tx.clone();
        tokio::task::spawn_local(async move {
            let fetch = Abortable::new(
                async move { cache.load(kind, &url).await.map(|_| url) },
                registration,
            );
            match fetch.await {
                Ok(Ok(url)) => {
                    let _ = tx.send(Completion::Fetch {
                        entity: id,
                        url,
                        ok: true,
                    });
                }
                Ok(Err(err)) => {
                    // The app may have unbuilt meanwhile; stale outcomes
                    // are fine, the event router drops them by version.
                    let _ = tx.send(Completion::Fetch {
                        entity: id,
                        url: err.to_string(),
                        ok: false,
                    });
                }
                Err(_aborted) => {}
            }
        });
    }

    // -- inbound application -------------------------------------------------

    /// Apply an `entityModified` message. `origin` is the socket it came
    /// from (`None` when produced locally).
    pub fn apply_entity_modified(
        &mut self,
        msg: &EntityModifiedMsg,
        origin: Option<SessionId>,
    ) -> Result<(), WorldError> {
        let id = msg.entity_id();
        let local_session = self.config.local_session;
        let _ = origin; // relayed packets lose the origin; the mover tag decides
        let mut rebuild = false;
        {
            let entity = self
                .store
                .get_mut(&id)
                .ok_or(WorldError::UnknownEntity(id))?;
            match entity {
                Entity::Player(player) => {
                    player.apply_remote_update(msg);
                    if let Some(user) = &msg.user {
                        let json = user.to_json()?;
                        let record: UserRecord = serde_json::from_value(json).map_err(|e| {
                            WorldError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
                                message: "entityModified.user",
                                detail: e.to_string(),
                            })
                        })?;
                        self.dirty.users.insert(record.id.clone());
                        player.user = record;
                        player.common.bump_version();
                        self.dirty.entities.insert(id);
                    }
                }
                Entity::App(app) => {
                    let mut structural = false;
                    if let Some(blueprint) = msg.blueprint {
                        app.blueprint = blueprint;
                        structural = true;
                        rebuild = true;
                    }
                    if let Some(uploader) = &msg.uploader {
                        app.uploader = *uploader;
                        structural = true;
                        rebuild = true;
                    }
                    if let Some(mover) = &msg.mover {
                        app.mover = *mover;
                        structural = true;
                        rebuild = true;
                    }
                    if let Some(mode) = msg.transform_mode {
                        app.transform_mode = mode;
                    }
                    if let Some(scale) = msg.scale {
                        app.scale = Vector3::new(scale[0], scale[1], scale[2]);
                        structural = true;
                    }
                    if let (Some(p), Some(q)) = (msg.position, msg.quaternion) {
                        let pose = crate::math::Pose::from_wire(p, q);
                        let foreign_stroke = app.mover.is_some() && app.mover != local_session;
                        if foreign_stroke {
                            // Mid-gesture stroke from the authoring peer:
                            // ease rather than snap.
                            app.interp.push_target(pose);
                        } else {
                            app.pose = pose;
                            app.interp.snap(pose);
                            if let Some((body, _)) = app.body {
                                self.physics.set_body_pose(body, pose, true);
                            }
                            structural = true;
                        }
                    }
                    if let Some(state) = &msg.state {
                        app.state = state.to_json().unwrap_or(serde_json::Value::Null);
                        structural = true;
                    }
                    if structural {
                        app.common.bump_version();
                        self.dirty.entities.insert(id);
                    }
                }
            }
        }
        if rebuild {
            self.request_rebuild(id);
        }
        Ok(())
    }

    /// Apply an `entityEvent` message: route to the target entity's event
    /// gate.
    pub fn apply_entity_event(
        &mut self,
        msg: &EntityEventMsg,
        origin: Option<SessionId>,
    ) -> Result<(), WorldError> {
        if self.store.get(&msg.entity).is_none() {
            return Err(WorldError::UnknownEntity(msg.entity));
        }
        let tick = self.tick_count();
        let sim_time = self.sim_time();
        self.route_event(
            msg.entity,
            msg.version,
            &msg.name,
            msg.data.clone(),
            origin,
            tick,
            sim_time,
        );
        Ok(())
    }

    fn route_event(
        &mut self,
        entity: EntityId,
        version: u32,
        name: &str,
        data: PayloadValue,
        origin: Option<SessionId>,
        tick: u64,
        sim_time: f64,
    ) {
        let outcome = match self.store.get_mut(&entity).and_then(Entity::as_app_mut) {
            Some(app) => app.on_event(version, name, data, origin, tick, sim_time),
            None => return,
        };
        match outcome {
            EventOutcome::Fired(outputs) => {
                let built_version = self
                    .store
                    .get(&entity)
                    .and_then(Entity::as_app)
                    .map_or(version, |a| a.built_version);
                self.absorb_script_outputs(entity, built_version, outputs);
            }
            EventOutcome::Crashed => {
                self.request_rebuild(entity);
            }
            EventOutcome::Queued | EventOutcome::Discarded => {}
        }
    }

    /// Apply a blueprint broadcast (`blueprintAdded` / `blueprintModified`)
    /// and rebuild the apps built from it.
    pub fn apply_blueprint(&mut self, blueprint: Blueprint) {
        let id = blueprint.id;
        self.blueprints.upsert(blueprint);
        self.dirty.blueprints.insert(id);

        let affected: Vec<EntityId> = self
            .store
            .ids()
            .into_iter()
            .filter(|eid| {
                self.store
                    .get(eid)
                    .and_then(Entity::as_app)
                    .is_some_and(|a| a.blueprint == id)
            })
            .collect();
        for eid in affected {
            self.request_rebuild(eid);
        }
    }

    /// Teleport the local player: capsule pose set directly, pose stream
    /// flagged so remotes force-snap.
    pub fn teleport_local(&mut self, position: Vector3<f64>, yaw: Option<f64>) {
        let Some(id) = self.store.local_player() else {
            return;
        };
        let Some(mut entity) = self.store.take(&id) else {
            return;
        };
        if let Some(player) = entity.as_player_mut() {
            if let Some(local) = player.as_local_mut() {
                local.controller.teleport(&mut self.physics, position, yaw);
            }
            player.pose.position = position;
            let mut msg = EntityModifiedMsg::for_entity(id);
            msg.pose_position = Some(player.pose.position_wire());
            msg.pose_quaternion = Some(player.pose.rotation_wire());
            msg.emote = Some(player.emote);
            msg.teleport = true;
            self.push_outbox(msg.to_packet());
        }
        self.store.restore(entity);
    }

    // -- chat & spawn --------------------------------------------------------

    /// Append a chat line, notify local subscribers, and optionally queue
    /// the broadcast.
    pub fn add_chat(
        &mut self,
        from_entity: Option<EntityId>,
        author: Option<String>,
        body: String,
        broadcast: bool,
    ) -> ChatMessageWire {
        let timestamp = self.sim_time();
        let message = self.chat.add(from_entity, author, body, timestamp);
        self.bus.emit(
            "chat",
            &serde_json::json!({ "id": message.id, "body": message.body }),
        );
        if broadcast {
            self.outbox.push(message.to_packet());
        }
        message
    }

    /// Set the world spawn to the local (or named) player's pose.
    pub fn set_spawn(&mut self, pose: crate::math::Pose) {
        self.spawn = Some(SpawnPoint {
            position: pose.position_wire(),
            quaternion: pose.rotation_wire(),
        });
    }

    /// Clear the spawn back to the origin.
    pub fn clear_spawn(&mut self) {
        self.spawn = None;
    }

    fn spawn_pose(&self) -> crate::math::Pose {
        match &self.spawn {
            Some(point) => crate::math::Pose::from_wire(point.position, point.quaternion),
            None => crate::math::Pose::identity(),
        }
    }

    // -- snapshots & persistence ---------------------------------------------

    /// Serialize the entity registry for the join snapshot.
    pub fn entities_value(&self) -> PayloadValue {
        let records = self.store.serialize();
        let json = serde_json::to_value(records).expect("entity records serialize");
        PayloadValue::from_json(&json)
    }

    /// Apply a join snapshot on a client: blueprints, entities, chat.
    /// `my_session` decides which player record becomes the local player.
    pub fn apply_snapshot(
        &mut self,
        my_session: SessionId,
        chat: Vec<ChatMessageWire>,
        blueprints: &PayloadValue,
        entities: &PayloadValue,
    ) -> Result<(), WorldError> {
        self.blueprints.load_value(blueprints)?;

        let json = entities.to_json()?;
        let records: Vec<EntityRecord> = serde_json::from_value(json).map_err(|e| {
            WorldError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
                message: "snapshot.entities",
                detail: e.to_string(),
            })
        })?;

        for record in records {
            let pose = crate::math::Pose::from_wire(record.position, record.quaternion);
            match record.kind {
                EntityKind::Player => {
                    let user = record.user.clone().unwrap_or(UserRecord {
                        id: String::new(),
                        name: "anonymous".to_owned(),
                        roles: vec![],
                        avatar: None,
                    });
                    let session = record.owner.unwrap_or(SessionId(0));
                    if session == my_session {
                        self.spawn_local_player_with_id(record.id, session, user);
                        if let Some(player) = self
                            .store
                            .get_mut(&record.id)
                            .and_then(Entity::as_player_mut)
                        {
                            player.pose = pose;
                        }
                        if let Some(mut entity) = self.store.take(&record.id) {
                            if let Some(local) = entity
                                .as_player_mut()
                                .and_then(Player::as_local_mut)
                            {
                                local
                                    .controller
                                    .teleport(&mut self.physics, pose.position, None);
                            }
                            self.store.restore(entity);
                        }
                    } else {
                        self.spawn_remote_player(record.id, session, user, pose);
                    }
                }
                EntityKind::App => {
                    let Some(blueprint) = record.blueprint else {
                        continue;
                    };
                    let id = self.spawn_app(record.id, blueprint, record.owner, pose);
                    if let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) {
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

        for message in chat {
            self.chat.add_existing(message);
        }
        Ok(())
    }

    /// The current persisted shape of the world.
    pub fn persisted(&self, world_name: &str, users: Vec<UserRecord>) -> PersistedWorld {
        PersistedWorld {
            world: world_name.to_owned(),
            users,
            blueprints: self.blueprints.iter().cloned().collect(),
            entities: self
                .store
                .serialize()
                .into_iter()
                .filter(|r| r.kind == EntityKind::App)
                .collect(),
            spawn: self.spawn,
            chat: self.chat.messages().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick phases
// ---------------------------------------------------------------------------

impl TickPhases for World {
    fn fixed_update(&mut self, dt: f64) {
        let tick = self.tick_count();
        let sim_time = self.sim_time();

        let mut crashes = Vec::new();
        for id in self.store.hot_ids() {
            let Some(mut entity) = self.store.take(&id) else {
                continue;
            };
            match &mut entity {
                Entity::Player(player) => {
                    if player.as_local_mut().is_some() {
                        let input = player.fixed_input();
                        if let Some(local) = player.as_local_mut() {
                            local.controller.fixed_step(&mut self.physics, &input, dt);
                        }
                    }
                }
                Entity::App(app) => match app.script_fixed_update(tick, sim_time, dt) {
                    Ok(outputs) => {
                        let version = app.built_version;
                        app.apply_script_outputs(&outputs, &mut self.physics);
                        self.store.restore(entity);
                        self.absorb_script_outputs(id, version, outputs);
                        continue;
                    }
                    Err(()) => crashes.push(id),
                },
            }
            self.store.restore(entity);
        }
        for id in crashes {
            self.request_rebuild(id);
        }

        self.physics.step(dt);
    }

    fn update(&mut self, dt: f64) {
        let tick = self.tick_count();
        let sim_time = self.sim_time();
        let input = self.frame_input.clone();
        let net_interval = self.network_interval();

        let mut crashes = Vec::new();
        for id in self.store.hot_ids() {
            let Some(mut entity) = self.store.take(&id) else {
                continue;
            };
            match &mut entity {
                Entity::Player(player) => {
                    if player.as_local_mut().is_some() {
                        if let Some(msg) = player.update_local(&input, dt, &self.physics) {
                            self.outbox.push(msg.to_packet());
                        }
                    } else {
                        player.advance_remote(dt, &mut self.physics);
                    }
                }
                Entity::App(app) => match app.script_update(tick, sim_time, dt) {
                    Ok(outputs) => {
                        let version = app.built_version;
                        app.apply_script_outputs(&outputs, &mut self.physics);
                        self.store.restore(entity);
                        self.absorb_script_outputs(id, version, outputs);
                        continue;
                    }
                    Err(()) => crashes.push(id),
                },
            }
            self.store.restore(entity);
        }
        for id in crashes {
            self.request_rebuild(id);
        }

        // Authoring gestures on apps this session is moving.
        if let Some(local) = self.config.local_session {
            let authoring = AuthoringInput {
                pointer_delta: input.pointer_delta,
                shift: input.shift,
                commit: input.click,
                cursor_ray: input.cursor_ray,
            };
            let moved: Vec<EntityId> = self
                .store
                .ids()
                .into_iter()
                .filter(|id| {
                    self.store
                        .get(id)
                        .and_then(Entity::as_app)
                        .is_some_and(|a| a.mover == Some(local) && a.mode.is_authoring())
                })
                .collect();
            for id in moved {
                let Some(mut entity) = self.store.take(&id) else {
                    continue;
                };
                let mut committed = false;
                if let Some(app) = entity.as_app_mut() {
                    let outcome =
                        app.authoring_update(&authoring, &self.physics, dt, net_interval);
                    if let Some(stroke) = outcome.stroke {
                        self.outbox.push(stroke.to_packet());
                    }
                    if let Some(commit) = outcome.commit {
                        app.common.bump_version();
                        self.outbox.push(commit.to_packet());
                        self.dirty.entities.insert(id);
                        committed = true;
                    }
                }
                self.store.restore(entity);
                if committed {
                    self.request_rebuild(id);
                }
            }
        }
    }

    fn late_update(&mut self, dt: f64) {
        let tick = self.tick_count();
        let sim_time = self.sim_time();
        let local_session = self.config.local_session;

        // Apps moved by a foreign session ease toward the latest stroke,
        // hot or not.
        for id in self.store.ids() {
            if let Some(app) = self.store.get_mut(&id).and_then(Entity::as_app_mut) {
                if app.mover.is_some() && app.mover != local_session {
                    app.pose = app.interp.advance(dt);
                }
            }
        }

        let mut crashes = Vec::new();
        for id in self.store.hot_ids() {
            let Some(mut entity) = self.store.take(&id) else {
                continue;
            };
            if let Entity::Player(player) = &mut entity {
                if player.as_local_mut().is_some() {
                    player.late_update_local(dt);
                }
            }
            if let Entity::App(app) = &mut entity {
                match app.script_late_update(tick, sim_time, dt) {
                    Ok(outputs) => {
                        let version = app.built_version;
                        app.apply_script_outputs(&outputs, &mut self.physics);
                        self.store.restore(entity);
                        self.absorb_script_outputs(id, version, outputs);
                        continue;
                    }
                    Err(()) => crashes.push(id),
                }
            }
            self.store.restore(entity);
        }
        for id in crashes {
            self.request_rebuild(id);
        }
    }

    fn post_late_update(&mut self, _dt: f64) {
        // Render handoff belongs to the external renderer; the phase exists
        // so scripts and tools observe a stable end-of-frame ordering.
        self.frame_input = InputFrame::default();
    }
}
