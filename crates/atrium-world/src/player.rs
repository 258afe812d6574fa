//! Player entities.
//!
//! The locally-owned player runs the full capsule controller, camera and
//! input pipeline and emits its pose on the network cadence. Remote players
//! are interpolated replicas of the authoritative stream; the server
//! variant additionally owns a kinematic capsule so server-side apps can
//! detect contact and trigger events against them.

use atrium_protocol::messages::{Emote, EntityModifiedMsg};
use atrium_protocol::SessionId;
use nalgebra::{UnitQuaternion, Vector3};
use rapier3d::prelude::{ColliderHandle, RigidBodyHandle};

use crate::controller::{CharacterController, ControllerInput};
use crate::entity::{EntityCommon, EntityKind, EntityRecord, UserRecord};
use crate::interp::PoseInterpolator;
use crate::math::Pose;
use crate::physics::PhysicsArena;

/// Pointer sensitivity, radians per pixel.
const LOOK_SENSITIVITY: f64 = 0.002;
/// Camera zoom bounds.
const ZOOM_RANGE: (f64, f64) = (2.0, 100.0);
/// Touch stick radius in pixels; offsets saturate here.
const STICK_RADIUS: f64 = 50.0;
/// Stick deflection beyond this fraction of the radius reads as running.
const STICK_RUN_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Input & camera
// ---------------------------------------------------------------------------

/// Raw input for one variable-rate frame, already collected by the
/// platform layer (which is an external collaborator).
#[derive(Debug, Clone, Default)]
pub struct InputFrame {
    /// Pointer movement since last frame, pixels.
    pub pointer_delta: [f64; 2],
    /// Whether the mouse is pointer-locked (camera-look mode).
    pub pointer_locked: bool,
    /// One-finger camera pan delta, pixels (touch).
    pub touch_pan: [f64; 2],
    /// Scroll wheel delta.
    pub scroll: f64,
    /// WASD / arrows.
    pub forward: bool,
    /// Backward key.
    pub backward: bool,
    /// Strafe left key.
    pub left: bool,
    /// Strafe right key.
    pub right: bool,
    /// Run modifier.
    pub shift: bool,
    /// Jump was pressed this frame.
    pub jump: bool,
    /// Left touch-stick offset from its anchor, pixels.
    pub touch_stick: Option<[f64; 2]>,
    /// Left-click edge (commits authoring gestures).
    pub click: bool,
    /// Camera ray under the cursor: (origin, direction), for authoring.
    pub cursor_ray: Option<([f64; 3], [f64; 3])>,
}

/// Third-person orbit camera state.
#[derive(Debug, Clone)]
pub struct CameraState {
    /// Yaw around +Y, radians.
    pub yaw: f64,
    /// Pitch, radians, clamped to +-90 degrees.
    pub pitch: f64,
    /// Orbit distance.
    pub zoom: f64,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            zoom: 8.0,
        }
    }
}

impl CameraState {
    fn absorb(&mut self, input: &InputFrame) {
        let (dx, dy) = if input.pointer_locked {
            (input.pointer_delta[0], input.pointer_delta[1])
        } else {
            (input.touch_pan[0], input.touch_pan[1])
        };
        self.yaw -= dx * LOOK_SENSITIVITY;
        self.pitch = (self.pitch - dy * LOOK_SENSITIVITY)
            .clamp(-std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2);
        self.zoom = (self.zoom - input.scroll).clamp(ZOOM_RANGE.0, ZOOM_RANGE.1);
    }
}

/// Render-camera smoothing: the rig eases toward the orbit target each
/// late phase, but snaps outright when the target jumped (teleport) so the
/// camera never sweeps across the whole world.
#[derive(Debug, Clone)]
pub struct CameraRig {
    /// Smoothed camera position handed to the renderer.
    pub position: Vector3<f64>,
    /// Smoothing factor per second.
    pub stiffness: f64,
    /// Target jumps beyond this distance snap instead of easing.
    pub snap_distance: f64,
}

impl Default for CameraRig {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            stiffness: 12.0,
            snap_distance: 8.0,
        }
    }
}

impl CameraRig {
    /// The orbit target for a player pose and camera state.
    pub fn target(pose: &Pose, camera: &CameraState) -> Vector3<f64> {
        let orbit = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), camera.yaw)
            * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), camera.pitch);
        pose.position + orbit * Vector3::new(0.0, 0.0, -camera.zoom)
    }

    /// Ease toward (or snap to) the target.
    pub fn late_update(&mut self, target: Vector3<f64>, dt: f64) {
        if (target - self.position).norm() > self.snap_distance {
            self.position = target;
            return;
        }
        let t = (self.stiffness * dt).clamp(0.0, 1.0);
        self.position = self.position.lerp(&target, t);
    }
}

// ---------------------------------------------------------------------------
// Local / remote halves
// ---------------------------------------------------------------------------

/// State only the locally-owned player instance carries.
pub struct LocalState {
    /// The capsule controller.
    pub controller: CharacterController,
    /// The orbit camera.
    pub camera: CameraState,
    /// The smoothed render camera.
    pub rig: CameraRig,
    /// Current world-space move intent (normalized or zero).
    pub move_dir: Vector3<f64>,
    /// Whether the run modifier is engaged.
    pub running: bool,
    jump_queued: bool,
    network_timer: f64,
    /// Seconds between pose broadcasts (1 / network rate).
    pub network_interval: f64,
}

/// State only remote replicas carry.
pub struct RemoteState {
    /// Pose interpolator fed by the authoritative stream.
    pub interp: PoseInterpolator,
    /// Server-side kinematic capsule, if this world hosts one.
    pub capsule: Option<(RigidBodyHandle, ColliderHandle)>,
}

/// Local or remote.
pub enum PlayerView {
    /// The player this process owns.
    Local(LocalState),
    /// A foreign player's replica.
    Remote(RemoteState),
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// A player entity.
pub struct Player {
    /// Shared entity fields.
    pub common: EntityCommon,
    /// The socket this player belongs to.
    pub session: SessionId,
    /// Identity.
    pub user: UserRecord,
    /// Current animation token.
    pub emote: Emote,
    /// Pose as of the last frame (authoritative for locals, interpolated
    /// for remotes).
    pub pose: Pose,
    /// Local or remote half.
    pub view: PlayerView,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.common.id)
            .field("session", &self.session)
            .field("user", &self.user.name)
            .field("emote", &self.emote)
            .finish_non_exhaustive()
    }
}

impl Player {
    /// The locally-owned player.
    pub fn local(
        id: atrium_protocol::EntityId,
        session: SessionId,
        user: UserRecord,
        controller: CharacterController,
        pose: Pose,
        network_interval: f64,
    ) -> Self {
        Self {
            common: EntityCommon::new(id, Some(session)),
            session,
            user,
            emote: Emote::Idle,
            pose,
            view: PlayerView::Local(LocalState {
                controller,
                camera: CameraState::default(),
                rig: CameraRig::default(),
                move_dir: Vector3::zeros(),
                running: false,
                jump_queued: false,
                network_timer: 0.0,
                network_interval,
            }),
        }
    }

    /// A remote replica.
    pub fn remote(
        id: atrium_protocol::EntityId,
        session: SessionId,
        user: UserRecord,
        pose: Pose,
        interp_span: f64,
    ) -> Self {
        Self {
            common: EntityCommon::new(id, Some(session)),
            session,
            user,
            emote: Emote::Idle,
            pose,
            view: PlayerView::Remote(RemoteState {
                interp: PoseInterpolator::new(pose, interp_span),
                capsule: None,
            }),
        }
    }

    /// The local half, if this is the local player.
    pub fn as_local_mut(&mut self) -> Option<&mut LocalState> {
        match &mut self.view {
            PlayerView::Local(local) => Some(local),
            PlayerView::Remote(_) => None,
        }
    }

    /// The remote half, if this is a replica.
    pub fn as_remote_mut(&mut self) -> Option<&mut RemoteState> {
        match &mut self.view {
            PlayerView::Remote(remote) => Some(remote),
            PlayerView::Local(_) => None,
        }
    }

    // -- local pipeline ------------------------------------------------------

    /// Variable-rate update for the local player: camera, move intent,
    /// base-orientation slerp, emote selection, pose broadcast cadence.
    /// Returns a pose-stream message when the network timer fires.
    pub fn update_local(
        &mut self,
        input: &InputFrame,
        dt: f64,
        physics: &PhysicsArena,
    ) -> Option<EntityModifiedMsg> {
        let id = self.common.id;
        let PlayerView::Local(local) = &mut self.view else {
            return None;
        };

        local.camera.absorb(input);

        // Move intent: keyboard first, else the touch stick.
        let (raw, stick_run) = if let Some(stick) = input.touch_stick {
            let v = Vector3::new(stick[0], 0.0, stick[1]) / STICK_RADIUS;
            let len = v.norm().min(1.0);
            let v = if len > 1e-6 { v.normalize() * len } else { Vector3::zeros() };
            (v, len > STICK_RUN_THRESHOLD)
        } else {
            let mut v = Vector3::zeros();
            if input.forward {
                v.z += 1.0;
            }
            if input.backward {
                v.z -= 1.0;
            }
            if input.left {
                v.x -= 1.0;
            }
            if input.right {
                v.x += 1.0;
            }
            (v, false)
        };
        local.running = input.shift || stick_run;
        local.jump_queued |= input.jump;

        local.move_dir = if raw.norm_squared() > 1e-9 {
            // Normalize, then rotate by the camera yaw into world space.
            let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), local.camera.yaw);
            yaw * raw.normalize()
        } else {
            Vector3::zeros()
        };

        // Slerp the avatar base toward the move direction.
        if local.move_dir.norm_squared() > 1e-9 {
            let target_yaw = local.move_dir.x.atan2(local.move_dir.z);
            let target = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), target_yaw);
            let factor = 1.0 - 0.000_000_01_f64.powf(dt);
            local.controller.base_yaw = local
                .controller
                .base_yaw
                .try_slerp(&target, factor, 1e-9)
                .unwrap_or(target);
        }

        // Emote from the controller state machine.
        self.emote = if local.controller.jumping || local.controller.falling {
            Emote::Float
        } else if local.move_dir.norm_squared() > 1e-9 {
            if local.running {
                Emote::Run
            } else {
                Emote::Walk
            }
        } else {
            Emote::Idle
        };

        self.pose = Pose {
            position: local.controller.pose(physics).position,
            rotation: local.controller.base_yaw,
        };

        // Pose broadcast at the network rate.
        local.network_timer += dt;
        if local.network_timer >= local.network_interval {
            local.network_timer -= local.network_interval;
            let mut msg = EntityModifiedMsg::for_entity(id);
            msg.pose_position = Some(self.pose.position_wire());
            msg.pose_quaternion = Some(self.pose.rotation_wire());
            msg.emote = Some(self.emote);
            return Some(msg);
        }
        None
    }

    /// Late phase for the local player: ease the render camera toward its
    /// orbit target, snapping if the player teleported.
    pub fn late_update_local(&mut self, dt: f64) {
        let pose = self.pose;
        if let PlayerView::Local(local) = &mut self.view {
            let target = CameraRig::target(&pose, &local.camera);
            local.rig.late_update(target, dt);
        }
    }

    /// Whether this player's nametag renders, per world configuration.
    pub fn nametag_visible(&self, config: &crate::world::WorldConfig) -> bool {
        match self.view {
            PlayerView::Local(_) => config.show_local_nametag,
            PlayerView::Remote(_) => config.show_remote_nametags,
        }
    }

    /// Resolve the controller input for the next fixed step. Consumes the
    /// queued jump edge.
    pub fn fixed_input(&mut self) -> ControllerInput {
        match &mut self.view {
            PlayerView::Local(local) => {
                let jump = std::mem::take(&mut local.jump_queued);
                ControllerInput {
                    move_dir: local.move_dir,
                    running: local.running,
                    jump_pressed: jump,
                }
            }
            PlayerView::Remote(_) => ControllerInput::default(),
        }
    }

    // -- remote pipeline -----------------------------------------------------

    /// Apply an authoritative pose-stream update to a replica.
    pub fn apply_remote_update(&mut self, msg: &EntityModifiedMsg) {
        if let Some(emote) = msg.emote {
            self.emote = emote;
        }
        let PlayerView::Remote(remote) = &mut self.view else {
            return;
        };
        if let (Some(p), Some(q)) = (msg.pose_position, msg.pose_quaternion) {
            let pose = Pose::from_wire(p, q);
            if msg.teleport {
                remote.interp.snap(pose);
            } else {
                remote.interp.push_target(pose);
            }
        }
    }

    /// Per-frame advance of a replica: ease toward the latest target and
    /// carry the server-side capsule along.
    pub fn advance_remote(&mut self, dt: f64, physics: &mut PhysicsArena) {
        let PlayerView::Remote(remote) = &mut self.view else {
            return;
        };
        self.pose = remote.interp.advance(dt);
        if let Some((body, _)) = remote.capsule {
            physics.move_kinematic(body, self.pose);
        }
    }

    /// Give a replica a server-side kinematic capsule.
    pub fn attach_capsule(&mut self, physics: &mut PhysicsArena, radius: f64, half_height: f64) {
        let pose = self.pose;
        if let PlayerView::Remote(remote) = &mut self.view {
            if remote.capsule.is_none() {
                remote.capsule = Some(physics.add_remote_capsule(pose, radius, half_height));
            }
        }
    }

    /// Release physics resources (entity removal).
    pub fn release(&mut self, physics: &mut PhysicsArena) {
        match &mut self.view {
            PlayerView::Local(local) => physics.remove_body(local.controller.body),
            PlayerView::Remote(remote) => {
                if let Some((body, _)) = remote.capsule.take() {
                    physics.remove_body(body);
                }
            }
        }
    }

    /// Serialized record for snapshots and persistence.
    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            id: self.common.id,
            kind: EntityKind::Player,
            owner: Some(self.session),
            blueprint: None,
            position: self.pose.position_wire(),
            quaternion: self.pose.rotation_wire(),
            scale: None,
            state: None,
            user: Some(self.user.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
