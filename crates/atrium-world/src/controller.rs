//! The capsule character controller.
//!
//! A policy layer over [`PhysicsArena`]: the capsule is a rotation-locked
//! dynamic body with body-level gravity disabled, and every fixed step this
//! controller decides what forces, impulses and velocity edits apply. The
//! step order is load-bearing:
//!
//! 1. platform tracking, 2. ground sweep, 3. material swap, 4. jump/fall
//! state machine, 5. gravity policy, 6. velocity shaping, 7. move force.

use nalgebra::{UnitQuaternion, Vector3};
use rapier3d::prelude::{ColliderHandle, RigidBodyHandle, RigidBodyType};

use crate::math::{yaw_of, Pose};
use crate::physics::PhysicsArena;

/// Ground sweep length below the capsule base.
const GROUND_SWEEP_DISTANCE: f64 = 0.22;
/// Sweep sphere shrink, so walls brushing the capsule side do not read as
/// ground.
const GROUND_SWEEP_SHRINK: f64 = 0.01;
/// Slopes steeper than this are not walkable.
const MAX_GROUND_ANGLE_DEG: f64 = 60.0;
/// Downward velocity must persist this long before the fall animation
/// engages. Suppresses chatter on bumpy ground.
const FALL_DEAD_BAND: f64 = 0.1;
/// Platform probe length below the capsule base.
const PLATFORM_RAY_DISTANCE: f64 = 2.0;
/// Snap-down hint applied on the frame the player walks off an edge.
const EDGE_SNAP_VELOCITY: f64 = -5.0;
/// Extra downward bias while slipping on a steep slope.
const SLIP_BIAS: f64 = -0.5;

const GRAVITY: f64 = 9.81;

/// Input resolved for one fixed step.
#[derive(Debug, Clone, Default)]
pub struct ControllerInput {
    /// World-space move direction, normalized or zero.
    pub move_dir: Vector3<f64>,
    /// Whether the run modifier is held.
    pub running: bool,
    /// Whether jump was pressed since the last step.
    pub jump_pressed: bool,
}

impl ControllerInput {
    fn moving(&self) -> bool {
        self.move_dir.norm_squared() > 1e-9
    }
}

#[derive(Debug, Clone, Copy)]
struct PlatformTrack {
    body: RigidBodyHandle,
    prev: Pose,
}

/// Controller state for the locally-owned player capsule.
pub struct CharacterController {
    /// The capsule body.
    pub body: RigidBodyHandle,
    /// The capsule collider.
    pub collider: ColliderHandle,
    /// Capsule radius.
    pub radius: f64,
    /// Capsule cylinder half-height (hemispheres excluded).
    pub half_height: f64,
    /// Capsule mass.
    pub mass: f64,
    /// Apex height of a jump.
    pub jump_height: f64,

    /// Whether the ground sweep hit walkable ground last step.
    pub grounded: bool,
    /// Surface normal under the capsule (up when airborne).
    pub ground_normal: Vector3<f64>,
    /// Ground slope angle, degrees.
    pub ground_angle: f64,
    /// On ground steeper than the walkable limit.
    pub slipping: bool,
    /// Airborne because of a jump.
    pub jumping: bool,
    /// Airborne and past the fall dead-band.
    pub falling: bool,
    /// Yaw-only avatar base orientation. Platforms rotate it; input slerps
    /// it toward the move direction.
    pub base_yaw: UnitQuaternion<f64>,

    was_grounded: bool,
    jumped: bool,
    fall_timer: f64,
    platform: Option<PlatformTrack>,
}

impl CharacterController {
    /// Create the capsule in the arena and wrap it.
    pub fn spawn(
        physics: &mut PhysicsArena,
        pose: Pose,
        radius: f64,
        half_height: f64,
        mass: f64,
    ) -> Self {
        let (body, collider) = physics.add_character_capsule(pose, radius, half_height, mass);
        Self {
            body,
            collider,
            radius,
            half_height,
            mass,
            jump_height: 1.2,
            grounded: false,
            ground_normal: Vector3::y(),
            ground_angle: 0.0,
            slipping: false,
            jumping: false,
            falling: false,
            base_yaw: UnitQuaternion::identity(),
            was_grounded: false,
            jumped: false,
            fall_timer: 0.0,
            platform: None,
        }
    }

    /// Distance from capsule center to its lowest point.
    fn half_extent(&self) -> f64 {
        self.half_height + self.radius
    }

    /// The capsule pose.
    pub fn pose(&self, physics: &PhysicsArena) -> Pose {
        physics.body_pose(self.body).unwrap_or_default()
    }

    /// Teleport: set the capsule pose directly, no interpolation, and kill
    /// all momentum. Optionally sets the base yaw.
    pub fn teleport(&mut self, physics: &mut PhysicsArena, position: Vector3<f64>, yaw: Option<f64>) {
        if let Some(yaw) = yaw {
            self.base_yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
        }
        physics.set_body_pose(
            self.body,
            Pose {
                position,
                rotation: UnitQuaternion::identity(),
            },
            true,
        );
        physics.set_linvel(self.body, Vector3::zeros(), true);
        self.platform = None;
    }

    /// One fixed step of controller policy. Call before
    /// [`PhysicsArena::step`].
    pub fn fixed_step(&mut self, physics: &mut PhysicsArena, input: &ControllerInput, dt: f64) {
        // Forces are re-derived from scratch each step.
        if let Some(body) = physics.bodies.get_mut(self.body) {
            body.reset_forces(true);
        }

        let pose = self.pose(physics);
        let base = pose.position - Vector3::y() * self.half_extent();

        // 1. Platform tracking. Ports the capsule along with elevators,
        //    rotating disks and see-saws.
        if self.grounded {
            let probe_origin = base + Vector3::y() * 0.1;
            let hit = physics
                .ray_down(probe_origin, PLATFORM_RAY_DISTANCE, self.body)
                .filter(|(handle, _)| {
                    physics.bodies.get(*handle).is_some_and(|b| {
                        matches!(
                            b.body_type(),
                            RigidBodyType::Dynamic
                                | RigidBodyType::KinematicPositionBased
                                | RigidBodyType::KinematicVelocityBased
                        )
                    })
                });
            match hit {
                Some((platform_body, _)) => {
                    let platform_pose = physics.body_pose(platform_body).unwrap_or_default();
                    if let Some(track) = self.platform.filter(|t| t.body == platform_body) {
                        let delta =
                            platform_pose.to_isometry() * track.prev.to_isometry().inverse();
                        let ported = delta * pose.to_isometry();
                        physics.set_body_pose(
                            self.body,
                            Pose {
                                position: ported.translation.vector,
                                rotation: UnitQuaternion::identity(),
                            },
                            true,
                        );
                        self.base_yaw = yaw_of(&delta.rotation) * self.base_yaw;
                    }
                    self.platform = Some(PlatformTrack {
                        body: platform_body,
                        prev: platform_pose,
                    });
                }
                None => self.platform = None,
            }
        } else {
            self.platform = None;
        }

        // Re-read the pose; platform porting may have moved it.
        let pose = self.pose(physics);
        let base = pose.position - Vector3::y() * self.half_extent();

        // 2. Ground sweep.
        let sweep_origin = base + Vector3::y() * self.radius;
        match physics.cast_sphere_down(
            sweep_origin,
            self.radius - GROUND_SWEEP_SHRINK,
            GROUND_SWEEP_DISTANCE,
            self.body,
        ) {
            Some(hit) => {
                self.ground_normal = hit.normal.normalize();
                self.ground_angle = self.ground_normal.dot(&Vector3::y()).clamp(-1.0, 1.0).acos()
                    .to_degrees();
                if self.ground_angle > MAX_GROUND_ANGLE_DEG {
                    self.grounded = false;
                    self.slipping = true;
                } else {
                    self.grounded = true;
                    self.slipping = false;
                }
            }
            None => {
                self.grounded = false;
                self.slipping = false;
                self.ground_normal = Vector3::y();
                self.ground_angle = 0.0;
            }
        }

        // 3. Material swap: zero friction against walls while airborne,
        //    absorb platform friction while grounded.
        physics.set_capsule_grounded_material(self.collider, self.grounded);

        let velocity = physics.linvel(self.body).unwrap_or_default();

        // 4. Jump / fall state machine.
        let jumped_this_step = self.grounded && input.jump_pressed && !self.jumped;
        if jumped_this_step {
            let jump_speed = (2.0 * GRAVITY * self.jump_height).sqrt();
            if let Some(body) = physics.bodies.get_mut(self.body) {
                body.apply_impulse(
                    rapier3d::prelude::vector![
                        0.0,
                        (jump_speed * self.mass) as rapier3d::prelude::Real,
                        0.0
                    ],
                    true,
                );
            }
            self.jumped = true;
            self.jumping = true;
        } else if self.grounded && velocity.y <= 0.01 {
            // Landed (or never left): clear the whole machine.
            self.jumped = false;
            self.jumping = false;
            self.falling = false;
            self.fall_timer = 0.0;
        }
        if !self.grounded {
            if velocity.y < 0.0 {
                self.fall_timer += dt;
                if self.fall_timer > FALL_DEAD_BAND {
                    self.falling = true;
                }
            } else {
                self.fall_timer = 0.0;
            }
        }

        // 5. Gravity policy. Grounded: no gravity at all, plus a small
        //    reaction force on dynamic platforms so see-saws respond.
        if self.grounded {
            if let Some(track) = self.platform {
                let is_dynamic = physics
                    .bodies
                    .get(track.body)
                    .is_some_and(|b| b.body_type() == RigidBodyType::Dynamic);
                if is_dynamic {
                    if let Some(platform) = physics.bodies.get_mut(track.body) {
                        platform.add_force_at_point(
                            rapier3d::prelude::vector![
                                0.0,
                                (-GRAVITY * 0.2 * self.mass) as rapier3d::prelude::Real,
                                0.0
                            ],
                            rapier3d::prelude::point![
                                pose.position.x as rapier3d::prelude::Real,
                                pose.position.y as rapier3d::prelude::Real,
                                pose.position.z as rapier3d::prelude::Real
                            ],
                            true,
                        );
                    }
                }
            }
        } else if let Some(body) = physics.bodies.get_mut(self.body) {
            body.add_force(
                rapier3d::prelude::vector![
                    0.0,
                    (-GRAVITY * self.mass) as rapier3d::prelude::Real,
                    0.0
                ],
                true,
            );
        }

        // 6. Velocity shaping.
        let velocity = physics.linvel(self.body).unwrap_or_default();
        let normal = self.ground_normal;
        let v_normal = normal * velocity.dot(&normal);
        let v_parallel = velocity - v_normal;

        // Drag on the slope-parallel component prevents ice-skating up
        // ramps.
        let drag = (10.0 * dt).min(1.0);
        let v_parallel = v_parallel * (1.0 - drag);

        // Null the normal-direction velocity while grounded so elevators
        // carry the player instead of leaving them hovering.
        let v_normal = if self.grounded && !self.jumping {
            Vector3::zeros()
        } else {
            v_normal
        };

        let mut shaped = v_parallel + v_normal;
        if self.was_grounded && !self.grounded && !self.jumping {
            // Walked off an edge without jumping: snap-down hint.
            shaped.y = EDGE_SNAP_VELOCITY;
        }
        if self.slipping {
            shaped.y += SLIP_BIAS;
        }
        physics.set_linvel(self.body, shaped, true);

        // 7. Move force, rotated onto the slope.
        if input.moving() {
            let move_speed = if input.running { 8.0 } else { 4.0 } * self.mass;
            let align = UnitQuaternion::rotation_between(&Vector3::y(), &normal)
                .unwrap_or_else(UnitQuaternion::identity);
            let dir = align * input.move_dir;
            if let Some(body) = physics.bodies.get_mut(self.body) {
                body.add_force(
                    rapier3d::prelude::vector![
                        (10.0 * move_speed * dir.x) as rapier3d::prelude::Real,
                        (10.0 * move_speed * dir.y) as rapier3d::prelude::Real,
                        (10.0 * move_speed * dir.z) as rapier3d::prelude::Real
                    ],
                    true,
                );
            }
        }

        self.was_grounded = self.grounded;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
