//! Scripted app entities and the build/unbuild lifecycle.
//!
//! A build is asynchronous (blueprint, script and model fetches) and raced:
//! every rebuild request bumps the entity's build generation, the in-flight
//! fetch task checks the generation after every suspension point (the world
//! checks it once more at completion), and a superseded build aborts
//! without touching state. Events arriving during a build are queued and
//! replayed in order once the build completes -- but only the ones whose
//! version matches the new blueprint.

use std::collections::VecDeque;
use std::rc::Rc;

use atrium_assets::{AssetCache, AssetKind, AssetPayload, SceneTemplate};
use atrium_protocol::messages::{EntityModifiedMsg, TransformMode};
use atrium_protocol::{BlueprintId, EntityId, PayloadValue, SessionId};
use atrium_script::{SandboxConfig, ScriptInstance, ScriptOutputs};
use futures_util::future::AbortHandle;
use nalgebra::Vector3;
use rapier3d::prelude::{ColliderHandle, RigidBodyHandle};
use tracing::{debug, warn};

use crate::blueprint::Blueprint;
use crate::entity::{EntityCommon, EntityKind, EntityRecord};
use crate::interp::PoseInterpolator;
use crate::math::Pose;
use crate::physics::PhysicsArena;
use crate::scene::{NodeId, SceneGraph};

/// Scale clamp for the SCALING authoring mode.
const SCALE_RANGE: (f64, f64) = (0.1, 10.0);
/// Authoring drag sensitivity, meters (or radians) per pixel.
const DRAG_SENSITIVITY: f64 = 0.01;

// ---------------------------------------------------------------------------
// Modes & queued events
// ---------------------------------------------------------------------------

/// App lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// Built and running.
    Active,
    /// Local session is dragging it.
    Moving,
    /// Local session is rotating it.
    Rotating,
    /// Local session is scaling it.
    Scaling,
    /// A remote peer is still uploading the model; showing a placeholder.
    Loading,
    /// Build failed; showing the crash block.
    Crashed,
}

impl AppMode {
    /// Whether the scene subtree is active in this mode.
    pub fn subtree_active(self) -> bool {
        matches!(
            self,
            AppMode::Active | AppMode::Moving | AppMode::Rotating | AppMode::Scaling
        )
    }

    /// Whether this mode is one of the authoring gestures.
    pub fn is_authoring(self) -> bool {
        matches!(self, AppMode::Moving | AppMode::Rotating | AppMode::Scaling)
    }
}

/// An inbound entity event parked while a build is in flight (or destined
/// for a future blueprint version).
#[derive(Debug, Clone)]
pub struct DeferredEvent {
    /// Blueprint version the sender was built against.
    pub version: u32,
    /// Event name.
    pub name: String,
    /// Opaque payload.
    pub data: PayloadValue,
    /// Originating socket, if any.
    pub origin: Option<SessionId>,
}

/// What [`App::on_event`] did with an event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Fired into the script; outputs attached.
    Fired(ScriptOutputs),
    /// The script failed; the app must crash-rebuild.
    Crashed,
    /// Parked on the deferred queue.
    Queued,
    /// Stale version; dropped.
    Discarded,
}

// ---------------------------------------------------------------------------
// Build plumbing
// ---------------------------------------------------------------------------

/// Everything the async fetch phase resolved.
#[derive(Debug, Clone)]
pub struct BuiltAssets {
    /// Scene source (real model, placeholder cube, or crash block).
    pub scene: SceneTemplate,
    /// Script bytes, when the blueprint names a script and it fetched.
    pub script: Option<Rc<Vec<u8>>>,
    /// The blueprint's config map, handed read-only to the script.
    pub config: serde_json::Value,
    /// A fetch failed along the way; the crash block is showing.
    pub crashed: bool,
}

/// The async fetch phase of a build (steps 1-5): resolve blueprint assets
/// through the cache, falling back to the crash block. Runs as a detached
/// local task; the caller wraps it in an `Abortable`.
pub async fn fetch_build_assets(
    cache: AssetCache,
    blueprint: Option<Blueprint>,
    show_placeholder: bool,
) -> BuiltAssets {
    // 1. No blueprint: nothing to build from.
    let Some(blueprint) = blueprint else {
        return BuiltAssets {
            scene: SceneTemplate::crash_block(),
            script: None,
            config: serde_json::Value::Null,
            crashed: true,
        };
    };

    let mut crashed = false;

    // 2. Script fetch.
    let mut script = None;
    if let Some(url) = &blueprint.script {
        match cache.load(AssetKind::Script, url).await {
            Ok(payload) => match payload.as_ref() {
                AssetPayload::Script { bytes, .. } => script = Some(bytes.clone()),
                _ => crashed = true,
            },
            Err(err) => {
                warn!(blueprint = %blueprint.id, error = %err, "script fetch failed");
                crashed = true;
            }
        }
    }

    // 3. Remote upload still pending: placeholder scene, no model fetch.
    let scene = if show_placeholder {
        SceneTemplate::placeholder_cube()
    } else {
        // 4. Model fetch. A .vrm model goes through the avatar adapter.
        match &blueprint.model {
            Some(url) => {
                let kind = match atrium_assets::AssetUrl::parse(url).map(|u| u.ext()) {
                    Ok(atrium_assets::AssetExt::Vrm) => AssetKind::Avatar,
                    _ => AssetKind::Model,
                };
                match cache.load(kind, url).await {
                    Ok(payload) => match payload.as_ref() {
                        AssetPayload::Scene(template) => template.clone(),
                        _ => {
                            crashed = true;
                            SceneTemplate::crash_block()
                        }
                    },
                    Err(err) => {
                        warn!(blueprint = %blueprint.id, error = %err, "model fetch failed");
                        crashed = true;
                        SceneTemplate::crash_block()
                    }
                }
            }
            None => SceneTemplate::crash_block(),
        }
    };

    // 5. Any failure shows the crash block.
    let scene = if crashed {
        SceneTemplate::crash_block()
    } else {
        scene
    };

    BuiltAssets {
        scene,
        script,
        config: serde_json::Value::Object(blueprint.config.clone()),
        crashed,
    }
}

/// Mutable world context a build completion needs.
pub struct BuildCtx<'a> {
    /// Scene arena.
    pub scene: &'a mut SceneGraph,
    /// Physics arena.
    pub physics: &'a mut PhysicsArena,
    /// Shared script records keyed by (blueprint, version).
    pub shared: &'a mut std::collections::HashMap<(BlueprintId, u32), serde_json::Value>,
    /// Sandbox budgets.
    pub sandbox: &'a SandboxConfig,
    /// This process's session, for mover/uploader comparisons.
    pub local_session: Option<SessionId>,
    /// Current tick.
    pub tick: u64,
    /// Current simulation time.
    pub sim_time: f64,
    /// The blueprint version this build was fetched against.
    pub blueprint_version: u32,
}

/// What a completed build asks the world to do.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// The build was superseded; nothing was touched.
    pub aborted: bool,
    /// The app crashed during this build (fetch failure or script throw);
    /// peers observe a rebuild cycle.
    pub crashed: bool,
    /// Whether the entity belongs in the hot set now.
    pub hot: bool,
    /// Script outputs from `start` and replayed deferred events.
    pub outputs: Vec<ScriptOutputs>,
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// A scripted interactive object defined by a blueprint.
pub struct App {
    /// Shared entity fields.
    pub common: EntityCommon,
    /// The blueprint this app builds from.
    pub blueprint: BlueprintId,
    /// Socket currently dragging the app, if any.
    pub mover: Option<SessionId>,
    /// Socket still uploading the model bytes, if any.
    pub uploader: Option<SessionId>,
    /// Authoring gesture, when `mover` is this process.
    pub transform_mode: TransformMode,
    /// Lifecycle state.
    pub mode: AppMode,
    /// World pose.
    pub pose: Pose,
    /// Per-axis scale.
    pub scale: Vector3<f64>,
    /// Script-owned replicated state. Only the authoritative app script
    /// writes it; snapshots travel on rebuild boundaries.
    pub state: serde_json::Value,
    /// Root scene node of the current build.
    pub root: Option<NodeId>,
    /// Physics representation of the current build.
    pub body: Option<(RigidBodyHandle, ColliderHandle)>,
    /// Pose interpolator, driven while a foreign session moves this app.
    pub interp: PoseInterpolator,
    /// Blueprint version of the completed build.
    pub built_version: u32,
    /// Source tag of the scene the current build shows (model URL or a
    /// `builtin://` tag).
    pub scene_source: String,

    script: Option<ScriptInstance>,
    generation: u64,
    building: bool,
    deferred: VecDeque<DeferredEvent>,
    fetch_aborts: Vec<AbortHandle>,
    authoring_timer: f64,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("id", &self.common.id)
            .field("blueprint", &self.blueprint)
            .field("mode", &self.mode)
            .field("generation", &self.generation)
            .field("building", &self.building)
            .finish_non_exhaustive()
    }
}

impl App {
    /// A new, not-yet-built app.
    pub fn new(
        id: EntityId,
        blueprint: BlueprintId,
        owner: Option<SessionId>,
        pose: Pose,
        interp_span: f64,
    ) -> Self {
        Self {
            common: EntityCommon::new(id, owner),
            blueprint,
            mover: None,
            uploader: None,
            transform_mode: TransformMode::None,
            mode: AppMode::Loading,
            pose,
            scale: Vector3::new(1.0, 1.0, 1.0),
            state: serde_json::Value::Null,
            root: None,
            body: None,
            interp: PoseInterpolator::new(pose, interp_span),
            built_version: 0,
            scene_source: String::new(),
            script: None,
            generation: 0,
            building: false,
            deferred: VecDeque::new(),
            fetch_aborts: Vec::new(),
            authoring_timer: 0.0,
        }
    }

    /// Whether a build is in flight.
    pub fn is_building(&self) -> bool {
        self.building
    }

    /// The current build generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a script instance is live.
    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    /// Begin a build: bump the generation (superseding any in-flight
    /// build), abort outstanding fetches, and mark building. The caller
    /// spawns [`fetch_build_assets`] and registers its abort handle via
    /// [`track_fetch`](Self::track_fetch).
    pub fn begin_build(&mut self) -> u64 {
        self.generation += 1;
        self.building = true;
        for handle in self.fetch_aborts.drain(..) {
            handle.abort();
        }
        debug!(app = %self.common.id, generation = self.generation, "build started");
        self.generation
    }

    /// Track an in-flight fetch so unbuild / supersession can abort it.
    pub fn track_fetch(&mut self, handle: AbortHandle) {
        self.fetch_aborts.push(handle);
    }

    /// Complete a build (steps 6-12). `generation` is the value returned
    /// by the matching [`begin_build`](Self::begin_build).
    pub fn complete_build(
        &mut self,
        ctx: &mut BuildCtx<'_>,
        generation: u64,
        assets: BuiltAssets,
    ) -> BuildReport {
        let mut report = BuildReport::default();

        // 6. Superseded: do not touch state.
        if generation != self.generation {
            report.aborted = true;
            return report;
        }

        // 7. Unbuild the previous version.
        self.unbuild(ctx.scene, ctx.physics, ctx.shared);

        let mut crashed = assets.crashed;

        // 8. Determine the state.
        let is_local_mover =
            self.mover.is_some() && self.mover == ctx.local_session && ctx.local_session.is_some();
        let uploading_elsewhere =
            self.uploader.is_some() && self.uploader != ctx.local_session;
        self.mode = if crashed {
            AppMode::Crashed
        } else if is_local_mover {
            match self.transform_mode {
                TransformMode::Rotate => AppMode::Rotating,
                TransformMode::Scale => AppMode::Scaling,
                _ => AppMode::Moving,
            }
        } else if uploading_elsewhere {
            AppMode::Loading
        } else {
            AppMode::Active
        };

        // 9. Activate the scene subtree; physics only when not being moved.
        let root = ctx
            .scene
            .add_root(&format!("app:{}", self.common.id), self.pose.to_isometry());
        ctx.scene.set_active(root, self.mode.subtree_active());
        self.root = Some(root);
        self.scene_source = assets.scene.source.clone();
        // Physics participates only when nobody (local or foreign) is
        // dragging the app.
        if (self.mode == AppMode::Active || self.mode == AppMode::Crashed) && self.mover.is_none() {
            let half = Vector3::new(0.5, 0.5, 0.5).component_mul(&self.scale);
            self.body = Some(ctx.physics.add_prop_cuboid(
                self.pose,
                [half.x.max(0.05), half.y.max(0.05), half.z.max(0.05)],
                false,
            ));
        }

        // 10. Evaluate the script and run `start`.
        if self.mode == AppMode::Active && !crashed {
            if let Some(bytes) = &assets.script {
                let shared = ctx
                    .shared
                    .remove(&(self.blueprint, ctx.blueprint_version))
                    .unwrap_or(serde_json::Value::Null);
                match ScriptInstance::load(
                    ctx.sandbox,
                    bytes,
                    self.state.clone(),
                    shared,
                    assets.config.clone(),
                    self.common.id.to_string(),
                ) {
                    Ok(mut script) => match script.call_start(ctx.tick, ctx.sim_time) {
                        Ok(outputs) => {
                            report.outputs.push(outputs);
                            self.script = Some(script);
                        }
                        Err(err) => {
                            warn!(app = %self.common.id, error = %err, "script start crashed");
                            crashed = true;
                        }
                    },
                    Err(err) => {
                        warn!(app = %self.common.id, error = %err, "script load failed");
                        crashed = true;
                    }
                }
            }
        }

        if crashed {
            self.mode = AppMode::Crashed;
            self.script = None;
        }

        // 11. Re-latch the interpolator at the built pose.
        self.interp.snap(self.pose);

        self.built_version = ctx.blueprint_version;
        self.building = false;
        report.crashed = crashed;
        report.hot = self
            .script
            .as_ref()
            .is_some_and(ScriptInstance::wants_ticks);

        // 12. Drain the deferred queue in order. Future-version events stay.
        while let Some(event) = self.deferred.pop_front() {
            if event.version > self.built_version {
                self.deferred.push_front(event);
                break;
            }
            if event.version < self.built_version {
                continue;
            }
            match self.fire_event(&event, ctx.tick, ctx.sim_time) {
                Ok(Some(outputs)) => report.outputs.push(outputs),
                Ok(None) => {}
                Err(()) => {
                    report.crashed = true;
                    self.mode = AppMode::Crashed;
                    self.script = None;
                    break;
                }
            }
        }

        report
    }

    /// Tear down the current build: stop the script (preserving its shared
    /// record), deactivate and free the scene subtree, release physics,
    /// abort outstanding fetches. The hot flag is cleared by the store.
    pub fn unbuild(
        &mut self,
        scene: &mut SceneGraph,
        physics: &mut PhysicsArena,
        shared: &mut std::collections::HashMap<(BlueprintId, u32), serde_json::Value>,
    ) {
        if let Some(mut script) = self.script.take() {
            if let Err(err) = script.call_destroy() {
                warn!(app = %self.common.id, error = %err, "script destroy failed");
            }
            shared.insert(
                (self.blueprint, self.built_version),
                script.take_shared(),
            );
        }
        if let Some(root) = self.root.take() {
            scene.set_active(root, false);
            scene.remove_subtree(root);
        }
        if let Some((body, _)) = self.body.take() {
            physics.remove_body(body);
        }
        for handle in self.fetch_aborts.drain(..) {
            handle.abort();
        }
    }

    // -- events --------------------------------------------------------------

    /// Route an inbound entity event, honoring the rebuild gate.
    pub fn on_event(
        &mut self,
        version: u32,
        name: &str,
        data: PayloadValue,
        origin: Option<SessionId>,
        tick: u64,
        sim_time: f64,
    ) -> EventOutcome {
        let event = DeferredEvent {
            version,
            name: name.to_owned(),
            data,
            origin,
        };
        if self.building || version > self.built_version {
            self.deferred.push_back(event);
            return EventOutcome::Queued;
        }
        if version < self.built_version {
            return EventOutcome::Discarded;
        }
        match self.fire_event(&event, tick, sim_time) {
            Ok(Some(outputs)) => EventOutcome::Fired(outputs),
            Ok(None) => EventOutcome::Fired(ScriptOutputs::default()),
            Err(()) => {
                self.mode = AppMode::Crashed;
                self.script = None;
                EventOutcome::Crashed
            }
        }
    }

    /// Number of parked events (tests and diagnostics).
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn fire_event(
        &mut self,
        event: &DeferredEvent,
        tick: u64,
        sim_time: f64,
    ) -> Result<Option<ScriptOutputs>, ()> {
        let Some(script) = &mut self.script else {
            return Ok(None);
        };
        let data = event.data.to_json().unwrap_or(serde_json::Value::Null);
        match script.call_on_event(&event.name, data, tick, sim_time) {
            Ok(outputs) => Ok(Some(outputs)),
            Err(err) => {
                warn!(app = %self.common.id, event = %event.name, error = %err, "event listener crashed");
                Err(())
            }
        }
    }

    // -- update phases -------------------------------------------------------

    /// Fixed-phase script callback.
    pub fn script_fixed_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ()> {
        self.script_phase(|s| s.call_fixed_update(tick, sim_time, dt))
    }

    /// Variable-phase script callback.
    pub fn script_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ()> {
        self.script_phase(|s| s.call_update(tick, sim_time, dt))
    }

    /// Late-phase script callback.
    pub fn script_late_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ()> {
        self.script_phase(|s| s.call_late_update(tick, sim_time, dt))
    }

    fn script_phase(
        &mut self,
        call: impl FnOnce(&mut ScriptInstance) -> Result<ScriptOutputs, atrium_script::ScriptError>,
    ) -> Result<ScriptOutputs, ()> {
        let Some(script) = &mut self.script else {
            return Ok(ScriptOutputs::default());
        };
        match call(script) {
            Ok(outputs) => Ok(outputs),
            Err(err) => {
                warn!(app = %self.common.id, error = %err, "script update crashed");
                self.mode = AppMode::Crashed;
                self.script = None;
                Err(())
            }
        }
    }

    /// Apply a script's transform outputs to the app pose.
    pub fn apply_script_outputs(&mut self, outputs: &ScriptOutputs, physics: &mut PhysicsArena) {
        if let Some(p) = outputs.position {
            self.pose.position = Vector3::new(p[0], p[1], p[2]);
        }
        if let Some(q) = outputs.quaternion {
            self.pose.rotation = crate::math::quat_from_wire(q);
        }
        if outputs.position.is_some() || outputs.quaternion.is_some() {
            if let Some((body, _)) = self.body {
                physics.set_body_pose(body, self.pose, true);
            }
        }
        if let Some(state) = &outputs.state {
            self.state = state.clone();
        }
    }

    // -- authoring -----------------------------------------------------------

    /// Drive an authoring gesture for one variable frame (this process is
    /// the mover). Returns a periodic transform stroke and/or a commit.
    pub fn authoring_update(
        &mut self,
        input: &AuthoringInput,
        physics: &PhysicsArena,
        dt: f64,
        network_interval: f64,
    ) -> AuthoringOutcome {
        if !self.mode.is_authoring() {
            return AuthoringOutcome::default();
        }

        match self.mode {
            AppMode::Moving => {
                if input.shift {
                    // Vertical raise/lower by pointer-Y.
                    self.pose.position.y -= input.pointer_delta[1] * DRAG_SENSITIVITY;
                } else if let Some((origin, dir)) = input.cursor_ray {
                    if let Some(point) = physics.ray_ground_point(
                        Vector3::from(origin),
                        Vector3::from(dir),
                        500.0,
                    ) {
                        self.pose.position = point;
                    }
                }
            }
            AppMode::Rotating => {
                let yaw = nalgebra::UnitQuaternion::from_axis_angle(
                    &Vector3::y_axis(),
                    input.pointer_delta[0] * DRAG_SENSITIVITY,
                );
                if input.shift {
                    let tilt = nalgebra::UnitQuaternion::from_axis_angle(
                        &Vector3::x_axis(),
                        input.pointer_delta[1] * DRAG_SENSITIVITY,
                    );
                    self.pose.rotation = tilt * self.pose.rotation;
                } else {
                    self.pose.rotation = yaw * self.pose.rotation;
                }
            }
            AppMode::Scaling => {
                let factor = 1.0 - input.pointer_delta[1] * DRAG_SENSITIVITY;
                if input.shift {
                    self.scale *= factor;
                } else {
                    self.scale.y *= factor;
                }
                self.scale.x = self.scale.x.clamp(SCALE_RANGE.0, SCALE_RANGE.1);
                self.scale.y = self.scale.y.clamp(SCALE_RANGE.0, SCALE_RANGE.1);
                self.scale.z = self.scale.z.clamp(SCALE_RANGE.0, SCALE_RANGE.1);
            }
            _ => {}
        }

        let mut outcome = AuthoringOutcome::default();

        if input.commit {
            // Left-click commits: clear the mover, broadcast the final
            // transform with the cleared state, rebuild into ACTIVE.
            self.mover = None;
            self.transform_mode = TransformMode::None;
            let mut msg = EntityModifiedMsg::for_entity(self.common.id);
            msg.mover = Some(None);
            msg.transform_mode = Some(TransformMode::None);
            msg.position = Some(self.pose.position_wire());
            msg.quaternion = Some(self.pose.rotation_wire());
            msg.scale = Some([self.scale.x, self.scale.y, self.scale.z]);
            msg.state = Some(PayloadValue::Null);
            outcome.commit = Some(msg);
            self.authoring_timer = 0.0;
            return outcome;
        }

        // Periodic transform stroke at the network rate.
        self.authoring_timer += dt;
        if self.authoring_timer >= network_interval {
            self.authoring_timer -= network_interval;
            let mut msg = EntityModifiedMsg::for_entity(self.common.id);
            msg.position = Some(self.pose.position_wire());
            msg.quaternion = Some(self.pose.rotation_wire());
            if self.mode == AppMode::Scaling {
                msg.scale = Some([self.scale.x, self.scale.y, self.scale.z]);
            }
            outcome.stroke = Some(msg);
        }
        outcome
    }

    /// Serialized record for snapshots and persistence. Transient mover /
    /// uploader tags are not part of the record.
    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            id: self.common.id,
            kind: EntityKind::App,
            owner: self.common.owner,
            blueprint: Some(self.blueprint),
            position: self.pose.position_wire(),
            quaternion: self.pose.rotation_wire(),
            scale: Some([self.scale.x, self.scale.y, self.scale.z]),
            state: if self.state.is_null() {
                None
            } else {
                Some(self.state.clone())
            },
            user: None,
        }
    }
}

/// Pointer input for one authoring frame.
#[derive(Debug, Clone, Default)]
pub struct AuthoringInput {
    /// Pointer movement, pixels.
    pub pointer_delta: [f64; 2],
    /// Shift modifier (vertical move / tilt / uniform scale).
    pub shift: bool,
    /// Left-click commit.
    pub commit: bool,
    /// Camera ray under the cursor: (origin, direction).
    pub cursor_ray: Option<([f64; 3], [f64; 3])>,
}

/// What an authoring frame produced.
#[derive(Debug, Default)]
pub struct AuthoringOutcome {
    /// Periodic transform stroke to broadcast.
    pub stroke: Option<EntityModifiedMsg>,
    /// Commit message (mover cleared, final transform).
    pub commit: Option<EntityModifiedMsg>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{fresh_blueprint_id, fresh_entity_id};
    use crate::math::Pose;

    fn bare_app() -> App {
        App::new(
            fresh_entity_id(),
            fresh_blueprint_id(),
            None,
            Pose::identity(),
            0.125,
        )
    }

    #[test]
    fn events_queue_while_building() {
        let mut app = bare_app();
        app.begin_build();
        let outcome = app.on_event(0, "tick", PayloadValue::Null, None, 0, 0.0);
        assert!(matches!(outcome, EventOutcome::Queued));
        assert_eq!(app.deferred_len(), 1);
    }

    #[test]
    fn future_version_events_queue_even_when_idle() {
        let mut app = bare_app();
        let outcome = app.on_event(5, "tick", PayloadValue::Null, None, 0, 0.0);
        assert!(matches!(outcome, EventOutcome::Queued));
    }

    #[test]
    fn stale_version_events_drop() {
        let mut app = bare_app();
        app.built_version = 3;
        let outcome = app.on_event(1, "tick", PayloadValue::Null, None, 0, 0.0);
        assert!(matches!(outcome, EventOutcome::Discarded));
        assert_eq!(app.deferred_len(), 0);
    }

    #[test]
    fn matching_version_without_script_is_a_silent_fire() {
        let mut app = bare_app();
        let outcome = app.on_event(0, "tick", PayloadValue::Null, None, 0, 0.0);
        match outcome {
            EventOutcome::Fired(outputs) => assert!(outputs.is_empty()),
            other => panic!("expected a no-op fire, got {other:?}"),
        }
    }

    #[test]
    fn begin_build_supersedes_monotonically() {
        let mut app = bare_app();
        let g1 = app.begin_build();
        let g2 = app.begin_build();
        assert!(g2 > g1);
        assert!(app.is_building());
    }

    #[test]
    fn subtree_activity_table() {
        assert!(AppMode::Active.subtree_active());
        assert!(AppMode::Moving.subtree_active());
        assert!(AppMode::Rotating.subtree_active());
        assert!(AppMode::Scaling.subtree_active());
        assert!(!AppMode::Loading.subtree_active());
        assert!(!AppMode::Crashed.subtree_active());
    }

    #[test]
    fn scaling_clamps_each_axis() {
        let mut app = bare_app();
        app.mode = AppMode::Scaling;
        let physics = PhysicsArena::new();

        // Drag hard enough to blow past the clamp in one gesture.
        let input = AuthoringInput {
            pointer_delta: [0.0, -100_000.0],
            shift: true,
            ..Default::default()
        };
        app.authoring_update(&input, &physics, 0.016, 0.125);
        assert!(app.scale.iter().all(|&s| (0.1..=10.0).contains(&s)));

        let input = AuthoringInput {
            pointer_delta: [0.0, 100_000.0],
            shift: true,
            ..Default::default()
        };
        app.authoring_update(&input, &physics, 0.016, 0.125);
        assert!(app.scale.iter().all(|&s| (0.1..=10.0).contains(&s)));
    }

    #[test]
    fn commit_clears_transient_authoring_state() {
        let mut app = bare_app();
        app.mode = AppMode::Moving;
        app.mover = Some(SessionId(4));
        app.transform_mode = TransformMode::Move;
        let physics = PhysicsArena::new();

        let outcome = app.authoring_update(
            &AuthoringInput {
                commit: true,
                ..Default::default()
            },
            &physics,
            0.016,
            0.125,
        );
        let commit = outcome.commit.expect("commit message");
        assert_eq!(commit.mover, Some(None));
        assert_eq!(commit.state, Some(PayloadValue::Null));
        assert_eq!(app.mover, None);
        assert_eq!(app.transform_mode, TransformMode::None);
    }

    #[test]
    fn record_omits_null_state() {
        let mut app = bare_app();
        assert!(app.to_record().state.is_none());
        app.state = serde_json::json!({ "open": true });
        assert_eq!(
            app.to_record().state,
            Some(serde_json::json!({ "open": true }))
        );
    }
}
