// Copyright (c) 2026 The Omerta Project

//! Relay sessions: token framing, the server table, and the client table.
//!
//! A relayed datagram is an ordinary envelope wrapped in an eight-byte prefix
//! of session token and payload length. The relay never looks inside the
//! payload; it maps the token to the session pair and forwards the frame to
//! the other end, where the client unwraps it and feeds the inner bytes back
//! through its own dispatcher. Frames with unknown tokens are dropped
//! silently.

use crate::{
    config::RelayConfig,
    error::{MeshError, MeshResult},
};
use om_common::{Endpoint, PeerId};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Token (4) plus payload length (4, big-endian).
pub const FRAME_PREFIX_LEN: usize = 8;

/// Wrap a datagram for transit through a relay.
pub fn wrap_frame(token: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&token.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parse a relay frame; `None` for anything that is not one.
pub fn parse_frame(bytes: &[u8]) -> Option<(u32, &[u8])> {
    if bytes.len() < FRAME_PREFIX_LEN {
        return None;
    }
    let token = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let declared = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let payload = &bytes[FRAME_PREFIX_LEN..];
    if payload.len() != declared {
        return None;
    }
    Some((token, payload))
}

/// One forwarding session at the relay.
#[derive(Clone, Debug)]
pub struct ServerSession {
    pub session_id: Uuid,
    pub token: u32,
    pub initiator: PeerId,
    pub initiator_endpoint: Endpoint,
    pub target: PeerId,
    pub target_endpoint: Endpoint,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl ServerSession {
    /// The forwarding destination for a frame arriving from `source`.
    pub fn other_endpoint(&self, source: &Endpoint) -> &Endpoint {
        if source == &self.initiator_endpoint {
            &self.target_endpoint
        } else {
            &self.initiator_endpoint
        }
    }
}

/// Server-side session table with per-peer and total caps.
pub struct RelayServer {
    config: RelayConfig,
    sessions: HashMap<u32, ServerSession>,
    by_id: HashMap<Uuid, u32>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Slots left, as advertised in availability messages.
    pub fn available_slots(&self) -> u32 {
        self.config.max_sessions.saturating_sub(self.sessions.len()) as u32
    }

    fn sessions_for(&self, initiator: &PeerId) -> usize {
        self.sessions
            .values()
            .filter(|session| &session.initiator == initiator)
            .count()
    }

    /// Admit a session, minting a fresh token. Capacity is enforced here:
    /// per-initiator and total.
    pub fn open<R: Rng>(
        &mut self,
        session_id: Uuid,
        initiator: PeerId,
        initiator_endpoint: Endpoint,
        target: PeerId,
        target_endpoint: Endpoint,
        rng: &mut R,
    ) -> MeshResult<&ServerSession> {
        if self.by_id.contains_key(&session_id) {
            return Err(MeshError::DuplicateSession);
        }
        if self.sessions.len() >= self.config.max_sessions
            || self.sessions_for(&initiator) >= self.config.max_sessions_per_peer
        {
            return Err(MeshError::RelayCapacity);
        }

        let mut token: u32 = rng.gen();
        while self.sessions.contains_key(&token) {
            token = rng.gen();
        }

        let now = Instant::now();
        let session = ServerSession {
            session_id,
            token,
            initiator,
            initiator_endpoint,
            target,
            target_endpoint,
            created_at: now,
            last_activity: now,
        };
        debug!(%session_id, token, "relay session opened");
        self.by_id.insert(session_id, token);
        Ok(self.sessions.entry(token).or_insert(session))
    }

    /// Look up a live session for a frame and refresh its activity clock.
    pub fn touch(&mut self, token: u32) -> Option<&ServerSession> {
        let session = self.sessions.get_mut(&token)?;
        session.last_activity = Instant::now();
        Some(session)
    }

    pub fn close_by_id(&mut self, session_id: &Uuid) -> Option<ServerSession> {
        let token = self.by_id.remove(session_id)?;
        self.sessions.remove(&token)
    }

    /// Tear down all sessions touching a peer (on peer removal).
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<ServerSession> {
        let doomed: Vec<u32> = self
            .sessions
            .values()
            .filter(|session| &session.initiator == peer || &session.target == peer)
            .map(|session| session.token)
            .collect();
        doomed
            .into_iter()
            .filter_map(|token| {
                let session = self.sessions.remove(&token)?;
                self.by_id.remove(&session.session_id);
                Some(session)
            })
            .collect()
    }

    /// Evict idle sessions; returns them for event raising.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<ServerSession> {
        let idle_timeout = self.config.idle_timeout();
        let doomed: Vec<u32> = self
            .sessions
            .values()
            .filter(|session| now.duration_since(session.last_activity) >= idle_timeout)
            .map(|session| session.token)
            .collect();
        doomed
            .into_iter()
            .filter_map(|token| {
                let session = self.sessions.remove(&token)?;
                self.by_id.remove(&session.session_id);
                debug!(session_id = %session.session_id, "idle relay session evicted");
                Some(session)
            })
            .collect()
    }
}

/// A session this node participates in as an endpoint.
#[derive(Clone, Debug)]
pub struct ClientSession {
    pub session_id: Uuid,
    pub token: u32,
    /// The peer on the far side of the relay.
    pub remote_peer: PeerId,
    pub relay_peer: PeerId,
    pub relay_endpoint: Endpoint,
}

/// Client-side session table plus pending open requests.
#[derive(Default)]
pub struct RelayClient {
    by_peer: HashMap<PeerId, ClientSession>,
    by_token: HashMap<u32, PeerId>,
    pending: HashMap<Uuid, PendingOpen>,
}

pub struct PendingOpen {
    pub relay_peer: PeerId,
    pub target: PeerId,
    pub waiter: oneshot::Sender<MeshResult<ClientSession>>,
    pub deadline: Instant,
}

impl RelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_open(&mut self, session_id: Uuid, pending: PendingOpen) {
        self.pending.insert(session_id, pending);
    }

    pub fn take_pending(&mut self, session_id: &Uuid) -> Option<PendingOpen> {
        self.pending.remove(session_id)
    }

    /// Install a session accepted by the relay (either side).
    pub fn install(&mut self, session: ClientSession) {
        self.by_token
            .insert(session.token, session.remote_peer.clone());
        self.by_peer.insert(session.remote_peer.clone(), session);
    }

    pub fn session_for_peer(&self, peer: &PeerId) -> Option<&ClientSession> {
        self.by_peer.get(peer)
    }

    /// The session owning an inbound frame token, if any.
    pub fn session_for_token(&self, token: u32) -> Option<&ClientSession> {
        self.by_token
            .get(&token)
            .and_then(|peer| self.by_peer.get(peer))
    }

    pub fn close(&mut self, session_id: &Uuid) -> Option<ClientSession> {
        let peer = self
            .by_peer
            .values()
            .find(|session| &session.session_id == session_id)
            .map(|session| session.remote_peer.clone())?;
        let session = self.by_peer.remove(&peer)?;
        self.by_token.remove(&session.token);
        Some(session)
    }

    /// Time out overdue open requests.
    pub fn sweep_pending(&mut self, now: Instant) {
        let overdue: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for session_id in overdue {
            if let Some(pending) = self.pending.remove(&session_id) {
                let _ = pending
                    .waiter
                    .send(Err(MeshError::RelayTimeout(pending.relay_peer)));
            }
        }
    }
}
