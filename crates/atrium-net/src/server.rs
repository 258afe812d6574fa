//! The authoritative server: WebSocket admission plus the single-threaded
//! simulation task.
//!
//! Socket I/O runs on detached local tasks that bridge into the simulation
//! through an event channel; the simulation drains it between frames,
//! advances the world, broadcasts the outbox, pings, and flushes
//! persistence on its interval. Everything stateful happens on one task.

use std::time::{Duration, Instant};

use atrium_assets::{AssetCache, DefaultDecoder};
use atrium_protocol::{Packet, PacketKind, PayloadValue, SessionId};
use atrium_world::persist::{JsonFileStore, WorldStore};
use atrium_world::player::InputFrame;
use atrium_world::World;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::replicator::{self, DispatchOutcome, ServerState};
use crate::session::{SessionRegistry, UserDirectory};
use crate::NetError;

/// Frame cadence of the simulation task.
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Liveness and tick-rate numbers for the external HTTP collaborator's
/// `/health` and `/status` endpoints.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    /// Whether the simulation task is running.
    pub alive: bool,
    /// Fixed steps executed so far.
    pub tick_count: u64,
    /// Measured fixed-step rate over the last second.
    pub measured_tick_rate: f64,
    /// Connected sessions.
    pub sessions: usize,
    /// Live entities.
    pub entities: usize,
}

// ---------------------------------------------------------------------------
// Socket plumbing
// ---------------------------------------------------------------------------

enum NetEvent {
    Connected {
        name: String,
        token: Option<String>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        admitted: oneshot::Sender<SessionId>,
    },
    Inbound {
        session: SessionId,
        bytes: Vec<u8>,
    },
    Closed {
        session: SessionId,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    config: Config,
    fetcher: std::rc::Rc<dyn atrium_assets::AssetFetcher>,
    status_tx: watch::Sender<StatusReport>,
    status_rx: watch::Receiver<StatusReport>,
}

impl Server {
    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// [`NetError::Bind`] if the address is unavailable.
    pub async fn bind(
        config: Config,
        fetcher: std::rc::Rc<dyn atrium_assets::AssetFetcher>,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| NetError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let (status_tx, status_rx) = watch::channel(StatusReport::default());
        Ok(Self {
            listener,
            config,
            fetcher,
            status_tx,
            status_rx,
        })
    }

    /// The actually-bound address (useful when the config named port 0).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Watch the liveness report.
    pub fn status_watch(&self) -> watch::Receiver<StatusReport> {
        self.status_rx.clone()
    }

    /// Run forever. Must be called inside a `LocalSet`.
    pub async fn run(self) -> Result<(), NetError> {
        let Server {
            listener,
            config,
            fetcher,
            status_tx,
            ..
        } = self;

        let cache = AssetCache::new(
            fetcher,
            std::rc::Rc::new(DefaultDecoder {
                // The server never renders avatars; substitute the stand-in.
                decode_avatars: false,
            }),
        );
        let mut world = World::new(config.server_world(), cache);

        // Rehydrate from the persistence backend.
        let mut persist = JsonFileStore::new(&config.persist_path);
        let mut users = UserDirectory::new();
        match persist.load() {
            Ok(Some(saved)) => {
                info!(
                    users = saved.users.len(),
                    blueprints = saved.blueprints.len(),
                    entities = saved.entities.len(),
                    "world rehydrated"
                );
                users.load(saved.users);
                for blueprint in saved.blueprints {
                    world.blueprints.upsert(blueprint);
                }
                world.spawn = saved.spawn;
                for message in saved.chat {
                    world.chat.add_existing(message);
                }
                for record in saved.entities {
                    if let Some(blueprint) = record.blueprint {
                        let pose = atrium_world::math::Pose::from_wire(
                            record.position,
                            record.quaternion,
                        );
                        world.spawn_app(record.id, blueprint, None, pose);
                    }
                }
            }
            Ok(None) => info!("starting a fresh world"),
            Err(err) => error!(%err, "persistence load failed; starting fresh"),
        }
        world.start_preload();

        let mut state = ServerState {
            world,
            sessions: SessionRegistry::new(),
            users,
            config,
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_local(accept_loop(listener, event_tx));

        let mut interval = tokio::time::interval(FRAME_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();
        let mut ping_timer = 0.0_f64;
        let mut save_timer = 0.0_f64;
        let mut rate_window_start = state.world.tick_count();
        let mut rate_timer = 0.0_f64;
        let mut measured_rate = 0.0_f64;

        info!(world = %state.config.world, "server running");
        loop {
            interval.tick().await;
            let now = Instant::now();
            let dt = now.duration_since(last_frame).as_secs_f64();
            last_frame = now;

            // Inbound work drains between frames, never mid-phase.
            while let Ok(event) = event_rx.try_recv() {
                match event {
                    NetEvent::Connected {
                        name,
                        token,
                        outbound,
                        admitted,
                    } => {
                        let id = replicator::handle_connect(
                            &mut state,
                            outbound,
                            &name,
                            token.as_deref(),
                        );
                        let _ = admitted.send(id);
                    }
                    NetEvent::Inbound { session, bytes } => {
                        if replicator::dispatch(&mut state, session, &bytes)
                            == DispatchOutcome::Close
                        {
                            replicator::handle_disconnect(&mut state, session);
                        }
                    }
                    NetEvent::Closed { session } => {
                        if state.sessions.get(session).is_some() {
                            replicator::handle_disconnect(&mut state, session);
                        }
                    }
                }
            }

            state.world.frame(dt, InputFrame::default());

            for packet in state.world.take_outbox() {
                state.sessions.broadcast(&packet, None);
            }

            // Keepalive.
            ping_timer += dt;
            if ping_timer >= state.config.ping_rate {
                ping_timer = 0.0;
                let ping = Packet::new(PacketKind::Ping, PayloadValue::Null);
                state.sessions.broadcast(&ping, None);
                let now_sim = state.world.sim_time();
                for session in state
                    .sessions
                    .timed_out(now_sim, state.config.pong_timeout())
                {
                    warn!(%session, "pong timeout");
                    replicator::handle_disconnect(&mut state, session);
                }
            }

            // Persistence flush.
            save_timer += dt;
            if save_timer >= state.config.save_interval {
                save_timer = 0.0;
                if !state.world.dirty.is_empty() {
                    let snapshot = state
                        .world
                        .persisted(&state.config.world, state.users.records());
                    match persist.save(&snapshot) {
                        Ok(()) => {
                            state.world.dirty.take();
                            debug!("world persisted");
                        }
                        // Keep the dirty sets; retried next interval.
                        Err(err) => error!(%err, "persistence save failed"),
                    }
                }
            }

            // Status.
            rate_timer += dt;
            if rate_timer >= 1.0 {
                let ticks = state.world.tick_count() - rate_window_start;
                measured_rate = ticks as f64 / rate_timer;
                rate_window_start = state.world.tick_count();
                rate_timer = 0.0;
            }
            let _ = status_tx.send(StatusReport {
                alive: true,
                tick_count: state.world.tick_count(),
                measured_tick_rate: measured_rate,
                sessions: state.sessions.len(),
                entities: state.world.store.len(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Accept path
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp accepted");
                let events = events.clone();
                tokio::task::spawn_local(async move {
                    if let Err(err) = serve_socket(stream, events).await {
                        debug!(%peer, %err, "socket ended");
                    }
                });
            }
            Err(err) => {
                error!(%err, "accept failed");
                break;
            }
        }
    }
}

async fn serve_socket(
    stream: TcpStream,
    events: mpsc::UnboundedSender<NetEvent>,
) -> Result<(), NetError> {
    // Identity rides in the handshake query string: ?name=...&token=...
    let mut query = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().unwrap_or_default().to_owned();
        Ok(resp)
    })
    .await
    .map_err(|e| NetError::Handshake(e.to_string()))?;

    let (name, token) = parse_identity(&query);
    let (mut sink, mut source) = ws.split();

    // Writer task: everything queued for this socket, in order.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::task::spawn_local(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Hand the socket to the simulation and wait for admission.
    let (admitted_tx, admitted_rx) = oneshot::channel();
    events
        .send(NetEvent::Connected {
            name,
            token,
            outbound: outbound_tx,
            admitted: admitted_tx,
        })
        .map_err(|_| NetError::Closed("server shutting down".to_owned()))?;
    let session = admitted_rx
        .await
        .map_err(|_| NetError::Closed("admission dropped".to_owned()))?;

    // Reader loop: binary frames only; the protocol is binary mode.
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                if events.send(NetEvent::Inbound { session, bytes }).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // text/ping/pong frames are transport noise here
        }
    }
    let _ = events.send(NetEvent::Closed { session });
    Ok(())
}

/// Pull `name` and `token` out of the handshake query string.
fn parse_identity(query: &str) -> (String, Option<String>) {
    let mut name = "anonymous".to_owned();
    let mut token = None;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "name" if !value.is_empty() => name = value.to_owned(),
            "token" if !value.is_empty() => token = Some(value.to_owned()),
            _ => {}
        }
    }
    (name, token)
}
