//! App lifecycle and replication scenarios that span modules: build
//! supersession, event gating across rebuilds, disconnect cleanup and the
//! join snapshot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use atrium_assets::{AssetCache, AssetError, AssetExt, AssetFetcher, AssetUrl, DefaultDecoder};
use atrium_protocol::messages::{EntityEventMsg, EntityModifiedMsg};
use atrium_protocol::{PacketKind, PayloadValue, SessionId};
use atrium_world::app::AppMode;
use atrium_world::blueprint::Blueprint;
use atrium_world::entity::{fresh_blueprint_id, fresh_entity_id, UserRecord};
use atrium_world::math::Pose;
use atrium_world::player::InputFrame;
use atrium_world::{World, WorldConfig};
use futures_util::future::LocalBoxFuture;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Test fetcher
// ---------------------------------------------------------------------------

/// Serves bytes from a map; URLs can be gated behind a Notify to create
/// real in-flight overlap.
#[derive(Default)]
struct TestFetcher {
    data: RefCell<HashMap<String, Vec<u8>>>,
    gates: RefCell<HashMap<String, Rc<Notify>>>,
}

impl TestFetcher {
    fn insert(&self, url: &str, bytes: Vec<u8>) {
        self.data.borrow_mut().insert(url.to_owned(), bytes);
    }

    fn gate(&self, url: &str) -> Rc<Notify> {
        let gate = Rc::new(Notify::new());
        self.gates.borrow_mut().insert(url.to_owned(), gate.clone());
        gate
    }
}

impl AssetFetcher for TestFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, AssetError>> {
        let gate = self.gates.borrow().get(url).cloned();
        let bytes = self.data.borrow().get(url).cloned();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            bytes.ok_or_else(|| AssetError::Fetch {
                url: url.to_owned(),
                reason: "not in test fixture".to_owned(),
            })
        })
    }
}

struct Fixture {
    world: World,
    fetcher: Rc<TestFetcher>,
}

fn fixture(config: WorldConfig) -> Fixture {
    let fetcher = Rc::new(TestFetcher::default());
    let cache = AssetCache::new(
        fetcher.clone(),
        Rc::new(DefaultDecoder::default()),
    );
    Fixture {
        world: World::new(config, cache),
        fetcher,
    }
}

fn model_asset(fetcher: &TestFetcher, seed: &[u8]) -> String {
    let url = AssetUrl::for_bytes(seed, AssetExt::Glb).to_url_string();
    fetcher.insert(&url, seed.to_vec());
    url
}

fn script_asset(fetcher: &TestFetcher, wat: &str) -> String {
    let url = AssetUrl::for_bytes(wat.as_bytes(), AssetExt::Wat).to_url_string();
    fetcher.insert(&url, wat.as_bytes().to_vec());
    url
}

/// Let detached fetch tasks run, then run one frame so completions drain.
async fn pump(world: &mut World) {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
    world.frame(0.02, InputFrame::default());
}

/// A script whose `on_event` echoes the delivered event name back out.
const ECHO_SCRIPT: &str = r#"(module
    (import "atrium" "event_name_len" (func $nlen (result i32)))
    (import "atrium" "event_name_read" (func $nread (param i32 i32) (result i32)))
    (import "atrium" "emit" (func $emit (param i32 i32 i32 i32)))
    (memory (export "memory") 1)
    (func (export "on_event")
        (drop (call $nread (i32.const 0) (i32.const 64)))
        (call $emit (i32.const 0) (call $nlen) (i32.const 0) (i32.const 0))))"#;

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn app_builds_to_active() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());
            let model = model_asset(&fetcher, b"cube model");

            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model.clone());
            world.blueprints.add(bp);

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;

            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.mode, AppMode::Active);
            assert_eq!(app.scene_source, model);
            assert!(!app.is_building());
            assert_eq!(world.scene.len(), 1, "one root node for one app");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn missing_model_crashes_to_crash_block() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, .. } = fixture(WorldConfig::default());
            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(AssetUrl::for_bytes(b"never uploaded", AssetExt::Glb).to_url_string());
            world.blueprints.add(bp);

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;

            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.mode, AppMode::Crashed);
            assert_eq!(app.scene_source, "builtin://crash-block");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn superseded_build_never_lands() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());

            // B1's model hangs behind a gate; B2's resolves instantly.
            let slow_model = model_asset(&fetcher, b"slow model");
            let slow_gate = fetcher.gate(&slow_model);
            let fast_model = model_asset(&fetcher, b"fast model");

            let bp1 = fresh_blueprint_id();
            let mut b1 = Blueprint::new(bp1);
            b1.model = Some(slow_model);
            world.blueprints.add(b1);

            let bp2 = fresh_blueprint_id();
            let mut b2 = Blueprint::new(bp2);
            b2.model = Some(fast_model.clone());
            world.blueprints.add(b2);

            // Build against B1 (hangs), then immediately retarget to B2.
            let app_id = world.spawn_app(fresh_entity_id(), bp1, None, Pose::identity());
            let mut retarget = EntityModifiedMsg::for_entity(app_id);
            retarget.blueprint = Some(bp2);
            world.apply_entity_modified(&retarget, Some(SessionId(9))).unwrap();

            pump(&mut world).await;
            {
                let app = world.store.get(&app_id).unwrap().as_app().unwrap();
                assert_eq!(app.scene_source, fast_model, "B2 should have landed");
                assert_eq!(app.mode, AppMode::Active);
            }

            // Now let B1's fetch finish: its completion must abort.
            slow_gate.notify_waiters();
            pump(&mut world).await;
            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(
                app.scene_source, fast_model,
                "the stale B1 build must not replace B2"
            );
            assert_eq!(world.scene.len(), 1, "no leaked scene subtree from B1");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn build_unbuild_releases_resources() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());
            let model = model_asset(&fetcher, b"resource model");
            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model);
            world.blueprints.add(bp);

            let store_len = world.store.len();
            let bodies = world.physics.body_count();

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;
            assert!(world.physics.body_count() > bodies);

            world.remove_entity(&app_id);
            assert_eq!(world.store.len(), store_len);
            assert!(world.scene.is_empty(), "scene subtree must be released");
            assert_eq!(world.physics.body_count(), bodies, "no leaked physics actors");
        })
        .await;
}

// ---------------------------------------------------------------------------
// Event gating across rebuilds
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn future_version_event_waits_for_its_rebuild() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());
            let model = model_asset(&fetcher, b"evt model");
            let script = script_asset(&fetcher, ECHO_SCRIPT);

            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model.clone());
            bp.script = Some(script.clone());
            world.blueprints.add(bp.clone());

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;
            world.take_outbox();

            // An event stamped one version ahead: parked, not fired.
            let event = EntityEventMsg {
                entity: app_id,
                version: 1,
                name: "tick".to_owned(),
                data: PayloadValue::Null,
            };
            world.apply_entity_event(&event, Some(SessionId(3))).unwrap();
            {
                let app = world.store.get(&app_id).unwrap().as_app().unwrap();
                assert_eq!(app.deferred_len(), 1, "future-version event must park");
            }
            assert!(
                world.take_outbox().is_empty(),
                "nothing fires before the matching rebuild"
            );

            // Rebuild to version 1: the parked event fires in order.
            let mut next = bp;
            next.version = 1;
            world.apply_blueprint(next);
            pump(&mut world).await;

            let outbox = world.take_outbox();
            let echoed = outbox.iter().any(|p| {
                p.kind == PacketKind::EntityEvent
                    && EntityEventMsg::from_payload(&p.payload)
                        .is_ok_and(|e| e.name == "tick" && e.entity == app_id)
            });
            assert!(echoed, "the parked event must fire after the v1 build");
            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.deferred_len(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn stale_version_event_is_discarded() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());
            let model = model_asset(&fetcher, b"stale model");
            let script = script_asset(&fetcher, ECHO_SCRIPT);

            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model);
            bp.script = Some(script);
            world.blueprints.add(bp.clone());

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;

            let mut next = bp;
            next.version = 1;
            world.apply_blueprint(next);
            pump(&mut world).await;
            world.take_outbox();

            // An event from the old version: silently dropped.
            let stale = EntityEventMsg {
                entity: app_id,
                version: 0,
                name: "old".to_owned(),
                data: PayloadValue::Null,
            };
            world.apply_entity_event(&stale, None).unwrap();
            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.deferred_len(), 0);
            assert!(world.take_outbox().is_empty(), "stale events never fire");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn matching_version_event_fires_immediately() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let Fixture { mut world, fetcher } = fixture(WorldConfig::default());
            let model = model_asset(&fetcher, b"now model");
            let script = script_asset(&fetcher, ECHO_SCRIPT);

            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model);
            bp.script = Some(script);
            world.blueprints.add(bp);

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;
            world.take_outbox();

            let event = EntityEventMsg {
                entity: app_id,
                version: 0,
                name: "pressed".to_owned(),
                data: PayloadValue::Null,
            };
            world.apply_entity_event(&event, None).unwrap();

            let outbox = world.take_outbox();
            assert!(
                outbox.iter().any(|p| p.kind == PacketKind::EntityEvent),
                "matching-version event fires straight into the script"
            );
        })
        .await;
}

// ---------------------------------------------------------------------------
// Disconnect cleanup
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn disconnect_clears_transient_tags_and_rebuilds() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let mut config = WorldConfig::default();
            config.is_server = true;
            let Fixture { mut world, fetcher } = fixture(config);
            let model = model_asset(&fetcher, b"dc model");
            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model);
            world.blueprints.add(bp);

            let session = SessionId(7);
            let player_id = world.spawn_remote_player(
                fresh_entity_id(),
                session,
                UserRecord {
                    id: "u7".to_owned(),
                    name: "bea".to_owned(),
                    roles: vec![],
                    avatar: None,
                },
                Pose::identity(),
            );

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, None, Pose::identity());
            pump(&mut world).await;
            {
                let app = world
                    .store
                    .get_mut(&app_id)
                    .unwrap()
                    .as_app_mut()
                    .unwrap();
                app.mover = Some(session);
                app.uploader = Some(session);
            }
            world.take_outbox();

            let removed = world.handle_disconnect(session);
            assert_eq!(removed, Some(player_id));
            assert!(world.store.get(&player_id).is_none());

            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.mover, None, "mover must be cleared on disconnect");
            assert_eq!(app.uploader, None, "uploader must be cleared on disconnect");
            assert!(app.is_building(), "affected app rebuilds");

            let outbox = world.take_outbox();
            assert!(outbox.iter().any(|p| p.kind == PacketKind::EntityRemoved));
            assert!(outbox.iter().any(|p| p.kind == PacketKind::EntityModified));
        })
        .await;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn join_snapshot_reproduces_the_world() {
    tokio::task::LocalSet::new()
        .run_until(async {
            // Server side: one connected player A.
            let mut server_config = WorldConfig::default();
            server_config.is_server = true;
            let mut server = fixture(server_config).world;

            let session_a = SessionId(1);
            let session_b = SessionId(2);
            server.spawn_remote_player(
                fresh_entity_id(),
                session_a,
                UserRecord {
                    id: "ua".to_owned(),
                    name: "ada".to_owned(),
                    roles: vec![],
                    avatar: None,
                },
                Pose::identity(),
            );
            // B connects: the server mints B's player before snapshotting.
            let b_entity = server.spawn_remote_player(
                fresh_entity_id(),
                session_b,
                UserRecord {
                    id: "ub".to_owned(),
                    name: "bea".to_owned(),
                    roles: vec![],
                    avatar: None,
                },
                Pose::identity(),
            );

            let blueprints = server.blueprints.to_value();
            let entities = server.entities_value();
            let chat = server.chat.messages().to_vec();

            // Client side: blank world, applies the snapshot.
            let mut client_config = WorldConfig::default();
            client_config.local_session = Some(session_b);
            let Fixture {
                world: mut client, ..
            } = fixture(client_config);
            client
                .apply_snapshot(session_b, chat, &blueprints, &entities)
                .unwrap();

            assert_eq!(client.store.player_ids().len(), 2, "exactly A and B");
            assert_eq!(client.store.local_player(), Some(b_entity));
            assert!(
                client.take_outbox().is_empty(),
                "a joining client broadcasts nothing proactively"
            );
        })
        .await;
}

// ---------------------------------------------------------------------------
// Authoring
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn commit_clears_mover_and_rebuilds_active() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let local = SessionId(5);
            let mut config = WorldConfig::default();
            config.local_session = Some(local);
            let Fixture { mut world, fetcher } = fixture(config);
            let model = model_asset(&fetcher, b"authoring model");
            let bp_id = fresh_blueprint_id();
            let mut bp = Blueprint::new(bp_id);
            bp.model = Some(model);
            world.blueprints.add(bp);

            let app_id = world.spawn_app(fresh_entity_id(), bp_id, Some(local), Pose::identity());
            // Take the mover role and rebuild into the Moving state.
            {
                let app = world
                    .store
                    .get_mut(&app_id)
                    .unwrap()
                    .as_app_mut()
                    .unwrap();
                app.mover = Some(local);
            }
            world.request_rebuild(app_id);
            pump(&mut world).await;
            assert_eq!(
                world.store.get(&app_id).unwrap().as_app().unwrap().mode,
                AppMode::Moving
            );
            world.take_outbox();

            // A click commits the gesture.
            let mut input = InputFrame::default();
            input.click = true;
            world.frame(0.02, input);

            let outbox = world.take_outbox();
            let commit = outbox
                .iter()
                .filter(|p| p.kind == PacketKind::EntityModified)
                .map(|p| EntityModifiedMsg::from_payload(&p.payload).unwrap())
                .find(|m| m.mover == Some(None))
                .expect("commit broadcast with cleared mover");
            assert!(commit.position.is_some());
            assert_eq!(commit.state, Some(PayloadValue::Null), "state clears on commit");

            pump(&mut world).await;
            let app = world.store.get(&app_id).unwrap().as_app().unwrap();
            assert_eq!(app.mover, None);
            assert_eq!(app.mode, AppMode::Active, "commit rebuilds into ACTIVE");
        })
        .await;
}
