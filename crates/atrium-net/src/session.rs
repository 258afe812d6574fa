//! Per-socket session state, the session registry and the user directory.

use std::collections::{HashMap, VecDeque};

use atrium_protocol::{EntityId, Packet, SessionId};
use atrium_world::entity::{Role, UserRecord};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Malformed packets tolerated inside the strike window before the socket
/// is closed.
const MALFORMED_LIMIT: usize = 3;
/// The strike window, seconds.
const MALFORMED_WINDOW: f64 = 10.0;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// State the server keeps per connected socket.
pub struct Session {
    /// Assigned network id.
    pub id: SessionId,
    /// The authenticated user.
    pub user_id: String,
    /// The player entity minted for this socket.
    pub player_entity: EntityId,
    /// Encoded-packet channel to the socket writer task.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Sim-time of the last pong.
    pub last_pong: f64,
    /// Malformed-packet strike timestamps inside the window.
    strikes: VecDeque<f64>,
}

impl Session {
    /// New session around a writer channel.
    pub fn new(
        id: SessionId,
        user_id: String,
        player_entity: EntityId,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        now: f64,
    ) -> Self {
        Self {
            id,
            user_id,
            player_entity,
            outbound,
            last_pong: now,
            strikes: VecDeque::new(),
        }
    }

    /// Queue a packet for this socket. Errors mean the writer task is gone;
    /// the disconnect sweep picks the session up.
    pub fn send(&self, packet: &Packet) {
        if self.outbound.send(packet.encode()).is_err() {
            debug!(session = %self.id, "send to closed socket dropped");
        }
    }

    /// Record a malformed packet. Returns `true` when the strike window is
    /// exhausted and the socket must close. The first offense is forgiven
    /// with a log line.
    pub fn note_malformed(&mut self, now: f64) -> bool {
        while let Some(&front) = self.strikes.front() {
            if now - front > MALFORMED_WINDOW {
                self.strikes.pop_front();
            } else {
                break;
            }
        }
        self.strikes.push_back(now);
        if self.strikes.len() >= MALFORMED_LIMIT {
            warn!(session = %self.id, "malformed-packet strike-out");
            true
        } else {
            warn!(
                session = %self.id,
                strikes = self.strikes.len(),
                "malformed packet tolerated"
            );
            false
        }
    }

    /// Record a pong.
    pub fn note_pong(&mut self, now: f64) {
        self.last_pong = now;
    }

    /// Whether the peer has gone silent past the timeout.
    pub fn timed_out(&self, now: f64, timeout: f64) -> bool {
        now - self.last_pong > timeout
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// All connected sockets.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id. Ids are never reused.
    pub fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Register a session.
    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Remove a session.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Borrow a session.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Borrow a session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Connected session count.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterate sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Send to every socket except `skip` (the originator of a
    /// re-broadcast).
    pub fn broadcast(&self, packet: &Packet, skip: Option<SessionId>) {
        for session in self.sessions.values() {
            if Some(session.id) == skip {
                continue;
            }
            session.send(packet);
        }
    }

    /// Sessions silent past the pong timeout.
    pub fn timed_out(&self, now: f64, timeout: f64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.timed_out(now, timeout))
            .map(|s| s.id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// UserDirectory
// ---------------------------------------------------------------------------

/// Known users and their auth-token hashes. Only token hashes are kept;
/// the plaintext token exists client-side and in the snapshot that
/// refreshed it.
#[derive(Default)]
pub struct UserDirectory {
    users: HashMap<String, UserRecord>,
    token_to_user: HashMap<String, String>,
}

impl UserDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted records.
    pub fn load(&mut self, records: Vec<UserRecord>) {
        for record in records {
            self.users.insert(record.id.clone(), record);
        }
    }

    /// The persisted shape.
    pub fn records(&self) -> Vec<UserRecord> {
        let mut records: Vec<_> = self.users.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Authenticate: rehydrate the user behind `token`, or mint a new user
    /// with `name`. Either way a fresh token replaces the old one (the
    /// caller puts it in the snapshot). Returns (user, fresh token).
    pub fn authenticate(&mut self, token: Option<&str>, name: &str) -> (UserRecord, String) {
        let existing = token
            .map(hash_token)
            .and_then(|hash| self.token_to_user.remove(&hash))
            .and_then(|user_id| self.users.get(&user_id).cloned());

        let user = existing.unwrap_or_else(|| {
            let user = UserRecord {
                id: mint_token(),
                name: name.to_owned(),
                roles: vec![],
                avatar: None,
            };
            self.users.insert(user.id.clone(), user.clone());
            user
        });

        let fresh = mint_token();
        self.token_to_user.insert(hash_token(&fresh), user.id.clone());
        (user, fresh)
    }

    /// Borrow a user record.
    pub fn get(&self, user_id: &str) -> Option<&UserRecord> {
        self.users.get(user_id)
    }

    /// Rename a user. Returns the updated record.
    pub fn rename(&mut self, user_id: &str, name: &str) -> Option<UserRecord> {
        let user = self.users.get_mut(user_id)?;
        user.name = name.to_owned();
        Some(user.clone())
    }

    /// Grant a role. Returns the updated record.
    pub fn grant(&mut self, user_id: &str, role: Role) -> Option<UserRecord> {
        let user = self.users.get_mut(user_id)?;
        if !user.roles.contains(&role) {
            user.roles.push(role);
        }
        Some(user.clone())
    }
}

/// Mint an opaque token: 16 random bytes, hex.
pub fn mint_token() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use atrium_protocol::{PacketKind, PayloadValue};

    use super::*;

    fn session(id: u64) -> (Session, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(
                SessionId(id),
                format!("u{id}"),
                EntityId::from_bytes([id as u8; 16]),
                tx,
                0.0,
            ),
            rx,
        )
    }

    #[test]
    fn malformed_strikes_out_inside_the_window() {
        let (mut s, _rx) = session(1);
        assert!(!s.note_malformed(0.0));
        assert!(!s.note_malformed(1.0));
        assert!(s.note_malformed(2.0), "third strike closes");
    }

    #[test]
    fn old_strikes_age_out() {
        let (mut s, _rx) = session(1);
        assert!(!s.note_malformed(0.0));
        assert!(!s.note_malformed(1.0));
        // Far outside the window: the old strikes no longer count.
        assert!(!s.note_malformed(60.0));
    }

    #[test]
    fn broadcast_skips_the_origin() {
        let mut registry = SessionRegistry::new();
        let (a, mut rx_a) = session(1);
        let (b, mut rx_b) = session(2);
        registry.insert(a);
        registry.insert(b);

        let packet = Packet::new(PacketKind::Ping, PayloadValue::Null);
        registry.broadcast(&packet, Some(SessionId(1)));

        assert!(rx_a.try_recv().is_err(), "origin must be skipped");
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn timeout_detection() {
        let mut registry = SessionRegistry::new();
        let (mut a, _rx) = session(1);
        a.note_pong(10.0);
        registry.insert(a);

        assert!(registry.timed_out(11.0, 3.0).is_empty());
        assert_eq!(registry.timed_out(14.5, 3.0), vec![SessionId(1)]);
    }

    #[test]
    fn authenticate_mints_then_rehydrates() {
        let mut dir = UserDirectory::new();
        let (user, token) = dir.authenticate(None, "ada");
        assert_eq!(user.name, "ada");

        // Same token: same user, new token.
        let (again, fresh) = dir.authenticate(Some(&token), "ignored");
        assert_eq!(again.id, user.id);
        assert_ne!(fresh, token, "token must rotate on every join");

        // The consumed token no longer authenticates.
        let (other, _) = dir.authenticate(Some(&token), "mallory");
        assert_ne!(other.id, user.id);
    }

    #[test]
    fn roles_grant_once() {
        let mut dir = UserDirectory::new();
        let (user, _) = dir.authenticate(None, "ada");
        dir.grant(&user.id, Role::Admin);
        dir.grant(&user.id, Role::Admin);
        assert_eq!(dir.get(&user.id).unwrap().roles, vec![Role::Admin]);
    }
}
