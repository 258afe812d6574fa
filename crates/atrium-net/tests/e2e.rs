//! End-to-end smoke test: a real server on a loopback socket, two real
//! clients, replication observed through the public surfaces only.

use std::rc::Rc;
use std::time::Duration;

use atrium_assets::{AssetCache, AssetError, AssetFetcher, DefaultDecoder};
use atrium_net::client::Client;
use atrium_net::{Config, Server};
use atrium_world::player::InputFrame;
use futures_util::future::LocalBoxFuture;

struct NullFetcher;

impl AssetFetcher for NullFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, AssetError>> {
        Box::pin(async move {
            Err(AssetError::Fetch {
                url: url.to_owned(),
                reason: "no assets in the smoke test".to_owned(),
            })
        })
    }
}

fn cache() -> AssetCache {
    AssetCache::new(Rc::new(NullFetcher), Rc::new(DefaultDecoder::default()))
}

/// Drive a client until `predicate` holds or the deadline passes.
async fn pump_until(
    client: &mut Client,
    deadline: Duration,
    mut predicate: impl FnMut(&Client) -> bool,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        client.frame(0.02, InputFrame::default());
        if predicate(client) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "current_thread")]
async fn two_clients_replicate_through_a_real_socket() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = Config {
                listen_addr: "127.0.0.1:0".to_owned(),
                persist_path: std::env::temp_dir().join(format!(
                    "atrium-e2e-{}.json",
                    u64::from_le_bytes(rand::random())
                )),
                ..Config::default()
            };
            let persist_path = config.persist_path.clone();
            let client_config = config.clone();

            let server = Server::bind(config, Rc::new(NullFetcher)).await.unwrap();
            let addr = server.local_addr().unwrap();
            tokio::task::spawn_local(async move {
                let _ = server.run().await;
            });

            // First client joins an empty world: one player (itself).
            let mut ada = Client::connect(
                &addr.to_string(),
                "ada",
                None,
                &client_config,
                cache(),
            )
            .await
            .expect("ada connects");
            assert_eq!(ada.world.store.player_ids().len(), 1);
            assert!(!ada.auth_token.is_empty());

            // Second client sees both players in its snapshot.
            let mut bea = Client::connect(
                &addr.to_string(),
                "bea",
                None,
                &client_config,
                cache(),
            )
            .await
            .expect("bea connects");
            assert_eq!(
                bea.world.store.player_ids().len(),
                2,
                "bea's snapshot carries ada's player"
            );
            assert_eq!(bea.world.store.local_player().is_some(), true);

            // Ada learns about bea through the entityAdded broadcast.
            let saw_bea = pump_until(&mut ada, Duration::from_secs(5), |c| {
                c.world.store.player_ids().len() == 2
            })
            .await;
            assert!(saw_bea, "ada should observe bea joining");

            // Chat crosses the wire.
            ada.send_chat("hello from ada");
            let heard = pump_until(&mut bea, Duration::from_secs(5), |c| {
                c.world
                    .chat
                    .messages()
                    .iter()
                    .any(|m| m.body == "hello from ada")
            })
            .await;
            assert!(heard, "bea should receive ada's chat line");

            // Pose stream: move ada by teleport and watch bea's replica snap.
            ada.world
                .teleport_local(nalgebra::Vector3::new(25.0, 0.0, -3.0), None);
            ada.frame(0.02, InputFrame::default());
            let tracked = pump_until(&mut bea, Duration::from_secs(5), |c| {
                c.world
                    .store
                    .player_ids()
                    .iter()
                    .filter_map(|id| c.world.store.get(id))
                    .filter_map(|e| e.as_player())
                    .any(|p| (p.pose.position.x - 25.0).abs() < 0.5)
            })
            .await;
            assert!(tracked, "bea's replica should snap to ada's teleport");

            std::fs::remove_file(&persist_path).ok();
        })
        .await;
}
