//! rapier3d integration.
//!
//! The [`PhysicsArena`] owns the rapier sets and pipelines; it is stored
//! outside the entity store because rapier owns its own body storage.
//! Scene state is mutated only in the fixed phase. The character
//! controller (see [`controller`](crate::controller)) is a policy layer on
//! top of the queries and force accessors exposed here.

use rapier3d::parry::query::ShapeCastOptions;
use rapier3d::prelude::*;

use crate::math::Pose;

/// Collision layer bits.
pub mod layers {
    use rapier3d::prelude::Group;

    /// Static world geometry.
    pub const ENVIRONMENT: Group = Group::GROUP_1;
    /// App-owned physical objects.
    pub const PROP: Group = Group::GROUP_2;
    /// Held / equipped objects.
    pub const TOOL: Group = Group::GROUP_3;
    /// Player capsules.
    pub const PLAYER: Group = Group::GROUP_4;

    /// What the ground sweep and platform raycast are allowed to hit.
    pub const WALKABLE: Group = ENVIRONMENT.union(PROP).union(TOOL);
}

/// A contact that started during the last step, reported by entity-opaque
/// collider handles; the world maps them back to entities.
#[derive(Debug, Clone, Copy)]
pub struct ContactPair {
    /// First collider.
    pub a: ColliderHandle,
    /// Second collider.
    pub b: ColliderHandle,
    /// Whether either collider is a sensor (trigger semantics).
    pub sensor: bool,
}

/// Result of the downward ground sweep.
#[derive(Debug, Clone, Copy)]
pub struct GroundHit {
    /// The collider that was hit.
    pub collider: ColliderHandle,
    /// The body behind it, if any.
    pub body: Option<RigidBodyHandle>,
    /// Distance travelled before impact.
    pub distance: f64,
    /// Surface normal at the hit, world space.
    pub normal: nalgebra::Vector3<f64>,
}

// ---------------------------------------------------------------------------
// PhysicsArena
// ---------------------------------------------------------------------------

/// Owns all rapier state for one world.
pub struct PhysicsArena {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_params: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    /// Rigid bodies. Public because the controller shapes velocities and
    /// forces directly.
    pub bodies: RigidBodySet,
    /// Colliders. Public for material swaps.
    pub colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
}

impl PhysicsArena {
    /// A world with standard downward gravity. The player capsule opts out
    /// via gravity scale; the controller applies its own gravity policy.
    pub fn new() -> Self {
        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![0.0, -9.81, 0.0],
            integration_params: IntegrationParameters::default(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
        }
    }

    /// Step the simulation by `dt`, returning contacts that started.
    pub fn step(&mut self, dt: f64) -> Vec<ContactPair> {
        self.integration_params.dt = dt as Real;

        let (collision_send, collision_recv) =
            rapier3d::crossbeam::channel::unbounded::<CollisionEvent>();
        let (force_send, _force_recv) =
            rapier3d::crossbeam::channel::unbounded::<ContactForceEvent>();
        let event_handler = ChannelEventCollector::new(collision_send, force_send);

        self.pipeline.step(
            &self.gravity,
            &self.integration_params,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &event_handler,
        );

        let mut contacts = Vec::new();
        while let Ok(event) = collision_recv.try_recv() {
            if let CollisionEvent::Started(a, b, flags) = event {
                contacts.push(ContactPair {
                    a,
                    b,
                    sensor: flags.contains(CollisionEventFlags::SENSOR),
                });
            }
        }
        // Channel delivery order may vary; sort for a deterministic report.
        contacts.sort_by_key(|c| (c.a.into_raw_parts(), c.b.into_raw_parts()));
        contacts
    }

    // -- construction helpers -----------------------------------------------

    /// Static environment cuboid (floors, walls, ramps).
    pub fn add_environment_cuboid(&mut self, pose: Pose, half_extents: [f64; 3]) -> ColliderHandle {
        let collider = ColliderBuilder::cuboid(
            half_extents[0] as Real,
            half_extents[1] as Real,
            half_extents[2] as Real,
        )
        .position(na_cast(&pose))
        .collision_groups(InteractionGroups::new(layers::ENVIRONMENT, Group::ALL))
        .build();
        self.colliders.insert(collider)
    }

    /// Dynamic prop body + cuboid collider, for app physics.
    pub fn add_prop_cuboid(
        &mut self,
        pose: Pose,
        half_extents: [f64; 3],
        sensor: bool,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::dynamic().position(na_cast(&pose)).build();
        let body_handle = self.bodies.insert(body);
        let collider = ColliderBuilder::cuboid(
            half_extents[0] as Real,
            half_extents[1] as Real,
            half_extents[2] as Real,
        )
        .collision_groups(InteractionGroups::new(layers::PROP, Group::ALL))
        .sensor(sensor)
        .active_events(ActiveEvents::COLLISION_EVENTS)
        .build();
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        (body_handle, collider_handle)
    }

    /// Kinematic platform body + cuboid collider (elevators, disks).
    pub fn add_kinematic_cuboid(
        &mut self,
        pose: Pose,
        half_extents: [f64; 3],
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::kinematic_position_based()
            .position(na_cast(&pose))
            .build();
        let body_handle = self.bodies.insert(body);
        let collider = ColliderBuilder::cuboid(
            half_extents[0] as Real,
            half_extents[1] as Real,
            half_extents[2] as Real,
        )
        .collision_groups(InteractionGroups::new(layers::PROP, Group::ALL))
        .build();
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        (body_handle, collider_handle)
    }

    /// The local player's capsule: dynamic, rotation-locked, gravity
    /// disabled at the body level (the controller applies gravity policy).
    pub fn add_character_capsule(
        &mut self,
        pose: Pose,
        radius: f64,
        half_height: f64,
        mass: f64,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::dynamic()
            .position(na_cast(&pose))
            .lock_rotations()
            .gravity_scale(0.0)
            .build();
        let body_handle = self.bodies.insert(body);
        let collider = ColliderBuilder::capsule_y(half_height as Real, radius as Real)
            .mass(mass as Real)
            .friction_combine_rule(CoefficientCombineRule::Min)
            .restitution_combine_rule(CoefficientCombineRule::Min)
            .collision_groups(InteractionGroups::new(layers::PLAYER, Group::ALL))
            .build();
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        (body_handle, collider_handle)
    }

    /// A remote player's kinematic capsule, so server-side apps can detect
    /// contact and trigger events with it.
    pub fn add_remote_capsule(
        &mut self,
        pose: Pose,
        radius: f64,
        half_height: f64,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::kinematic_position_based()
            .position(na_cast(&pose))
            .build();
        let body_handle = self.bodies.insert(body);
        let collider = ColliderBuilder::capsule_y(half_height as Real, radius as Real)
            .collision_groups(InteractionGroups::new(layers::PLAYER, Group::ALL))
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        (body_handle, collider_handle)
    }

    /// Remove a body and everything attached to it.
    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        self.bodies.remove(
            handle,
            &mut self.island_manager,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    /// Remove a standalone collider.
    pub fn remove_collider(&mut self, handle: ColliderHandle) {
        self.colliders
            .remove(handle, &mut self.island_manager, &mut self.bodies, false);
    }

    /// Number of rigid bodies.
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    // -- pose & velocity accessors ------------------------------------------

    /// A body's pose as world math types.
    pub fn body_pose(&self, handle: RigidBodyHandle) -> Option<Pose> {
        let body = self.bodies.get(handle)?;
        Some(pose_cast(body.position()))
    }

    /// Teleport a body (dynamic or kinematic) to `pose` immediately.
    pub fn set_body_pose(&mut self, handle: RigidBodyHandle, pose: Pose, wake: bool) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_position(na_cast(&pose), wake);
        }
    }

    /// Move a kinematic body toward `pose` over the next step.
    pub fn move_kinematic(&mut self, handle: RigidBodyHandle, pose: Pose) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_next_kinematic_position(na_cast(&pose));
        }
    }

    /// A body's linear velocity.
    pub fn linvel(&self, handle: RigidBodyHandle) -> Option<nalgebra::Vector3<f64>> {
        let v = self.bodies.get(handle)?.linvel();
        Some(nalgebra::Vector3::new(v.x as f64, v.y as f64, v.z as f64))
    }

    /// Overwrite a body's linear velocity.
    pub fn set_linvel(&mut self, handle: RigidBodyHandle, v: nalgebra::Vector3<f64>, wake: bool) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_linvel(vector![v.x as Real, v.y as Real, v.z as Real], wake);
        }
    }

    // -- queries -------------------------------------------------------------

    /// Sweep a sphere downward. `origin` is the sphere center at start.
    pub fn cast_sphere_down(
        &self,
        origin: nalgebra::Vector3<f64>,
        radius: f64,
        max_distance: f64,
        exclude: RigidBodyHandle,
    ) -> Option<GroundHit> {
        let shape = Ball::new(radius as Real);
        let shape_pos = Isometry::translation(
            origin.x as Real,
            origin.y as Real,
            origin.z as Real,
        );
        let shape_vel = vector![0.0, -1.0, 0.0];
        let filter = QueryFilter::new()
            .groups(InteractionGroups::new(layers::PLAYER, layers::WALKABLE))
            .exclude_rigid_body(exclude);
        let options = ShapeCastOptions {
            max_time_of_impact: max_distance as Real,
            stop_at_penetration: true,
            ..Default::default()
        };

        let (collider, hit) = self.query_pipeline.cast_shape(
            &self.bodies,
            &self.colliders,
            &shape_pos,
            &shape_vel,
            &shape,
            options,
            filter,
        )?;
        let normal = hit.normal1;
        Some(GroundHit {
            collider,
            body: self.colliders.get(collider).and_then(Collider::parent),
            distance: hit.time_of_impact as f64,
            normal: nalgebra::Vector3::new(
                normal.x as f64,
                normal.y as f64,
                normal.z as f64,
            ),
        })
    }

    /// Ray straight down, for platform tracking. Returns the hit body.
    pub fn ray_down(
        &self,
        origin: nalgebra::Vector3<f64>,
        max_distance: f64,
        exclude: RigidBodyHandle,
    ) -> Option<(RigidBodyHandle, f64)> {
        let ray = Ray::new(
            point![origin.x as Real, origin.y as Real, origin.z as Real],
            vector![0.0, -1.0, 0.0],
        );
        let filter = QueryFilter::new()
            .groups(InteractionGroups::new(layers::PLAYER, layers::WALKABLE))
            .exclude_rigid_body(exclude);
        let (collider, toi) = self.query_pipeline.cast_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            max_distance as Real,
            true,
            filter,
        )?;
        let body = self.colliders.get(collider).and_then(Collider::parent)?;
        Some((body, toi as f64))
    }

    /// Ray from an arbitrary origin along a direction, for the authoring
    /// cursor ("where on the ground is the pointer").
    pub fn ray_ground_point(
        &self,
        origin: nalgebra::Vector3<f64>,
        dir: nalgebra::Vector3<f64>,
        max_distance: f64,
    ) -> Option<nalgebra::Vector3<f64>> {
        let ray = Ray::new(
            point![origin.x as Real, origin.y as Real, origin.z as Real],
            vector![dir.x as Real, dir.y as Real, dir.z as Real],
        );
        let filter = QueryFilter::new().groups(InteractionGroups::new(
            layers::PLAYER,
            layers::ENVIRONMENT,
        ));
        let (_, toi) = self.query_pipeline.cast_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            max_distance as Real,
            true,
            filter,
        )?;
        Some(origin + dir * toi as f64)
    }

    /// Swap the capsule's material combine rule: `Min` airborne (zero
    /// friction against walls), `Max` grounded (absorb platform friction).
    pub fn set_capsule_grounded_material(&mut self, collider: ColliderHandle, grounded: bool) {
        if let Some(collider) = self.colliders.get_mut(collider) {
            let rule = if grounded {
                CoefficientCombineRule::Max
            } else {
                CoefficientCombineRule::Min
            };
            collider.set_friction_combine_rule(rule);
            collider.set_restitution_combine_rule(rule);
        }
    }
}

impl Default for PhysicsArena {
    fn default() -> Self {
        Self::new()
    }
}

// -- casts -------------------------------------------------------------------

fn na_cast(pose: &Pose) -> Isometry<Real> {
    Isometry::from_parts(
        nalgebra::Translation3::new(
            pose.position.x as Real,
            pose.position.y as Real,
            pose.position.z as Real,
        ),
        nalgebra::UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            pose.rotation.w as Real,
            pose.rotation.i as Real,
            pose.rotation.j as Real,
            pose.rotation.k as Real,
        )),
    )
}

fn pose_cast(iso: &Isometry<Real>) -> Pose {
    Pose {
        position: nalgebra::Vector3::new(
            iso.translation.x as f64,
            iso.translation.y as f64,
            iso.translation.z as f64,
        ),
        rotation: nalgebra::UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            iso.rotation.w as f64,
            iso.rotation.i as f64,
            iso.rotation.j as f64,
            iso.rotation.k as f64,
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;

    fn floor(arena: &mut PhysicsArena) -> ColliderHandle {
        arena.add_environment_cuboid(
            Pose {
                position: Vector3::new(0.0, -0.5, 0.0),
                rotation: nalgebra::UnitQuaternion::identity(),
            },
            [50.0, 0.5, 50.0],
        )
    }

    fn capsule_at(arena: &mut PhysicsArena, y: f64) -> (RigidBodyHandle, ColliderHandle) {
        arena.add_character_capsule(
            Pose {
                position: Vector3::new(0.0, y, 0.0),
                rotation: nalgebra::UnitQuaternion::identity(),
            },
            0.3,
            0.6,
            60.0,
        )
    }

    #[test]
    fn ground_sweep_finds_the_floor() {
        let mut arena = PhysicsArena::new();
        floor(&mut arena);
        let (body, _) = capsule_at(&mut arena, 1.0);
        arena.step(1.0 / 50.0); // refresh the query pipeline

        // Sphere center just above the capsule base (base at y = 1 - 0.9).
        let hit = arena
            .cast_sphere_down(Vector3::new(0.0, 0.45, 0.0), 0.29, 1.0, body)
            .expect("sweep should hit the floor");
        assert!(hit.normal.y > 0.9, "floor normal should point up: {:?}", hit.normal);
        assert!(hit.distance <= 1.0);
    }

    #[test]
    fn sweep_excludes_the_caller_body() {
        let mut arena = PhysicsArena::new();
        let (body, _) = capsule_at(&mut arena, 1.0);
        arena.step(1.0 / 50.0);

        // No floor: the only thing below is nothing; the capsule itself
        // must not be hit.
        let hit = arena.cast_sphere_down(Vector3::new(0.0, 2.0, 0.0), 0.29, 3.0, body);
        assert!(hit.is_none(), "sweep must ignore the excluded body");
    }

    #[test]
    fn capsule_ignores_world_gravity() {
        let mut arena = PhysicsArena::new();
        let (body, _) = capsule_at(&mut arena, 5.0);
        for _ in 0..50 {
            arena.step(1.0 / 50.0);
        }
        let pose = arena.body_pose(body).unwrap();
        assert!(
            (pose.position.y - 5.0).abs() < 1e-3,
            "gravity-scale-0 capsule should hover, got y={}",
            pose.position.y
        );
    }

    #[test]
    fn dynamic_prop_falls_onto_the_floor() {
        let mut arena = PhysicsArena::new();
        floor(&mut arena);
        let (prop, _) = arena.add_prop_cuboid(
            Pose {
                position: Vector3::new(0.0, 3.0, 0.0),
                rotation: nalgebra::UnitQuaternion::identity(),
            },
            [0.5, 0.5, 0.5],
            false,
        );
        for _ in 0..200 {
            arena.step(1.0 / 50.0);
        }
        let pose = arena.body_pose(prop).unwrap();
        assert!(
            (pose.position.y - 0.5).abs() < 0.1,
            "prop should rest on the floor, got y={}",
            pose.position.y
        );
    }

    #[test]
    fn kinematic_platform_moves_where_told() {
        let mut arena = PhysicsArena::new();
        let (platform, _) = arena.add_kinematic_cuboid(
            Pose {
                position: Vector3::new(0.0, 0.0, 0.0),
                rotation: nalgebra::UnitQuaternion::identity(),
            },
            [1.0, 0.1, 1.0],
        );
        arena.move_kinematic(
            platform,
            Pose {
                position: Vector3::new(0.5, 0.0, 0.0),
                rotation: nalgebra::UnitQuaternion::identity(),
            },
        );
        arena.step(1.0 / 50.0);
        let pose = arena.body_pose(platform).unwrap();
        assert!((pose.position.x - 0.5).abs() < 1e-3);
    }

    #[test]
    fn remove_body_releases_everything() {
        let mut arena = PhysicsArena::new();
        let (body, _) = capsule_at(&mut arena, 1.0);
        assert_eq!(arena.body_count(), 1);
        arena.remove_body(body);
        assert_eq!(arena.body_count(), 0);
        assert!(arena.body_pose(body).is_none());
    }
}
