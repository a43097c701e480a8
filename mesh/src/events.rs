// Copyright (c) 2026 The Omerta Project

//! Events emitted by a running node.
//!
//! Everything the node learns asynchronously flows through one bounded
//! channel: discoveries, expiries, NAT verdicts, keepalive failures, path
//! establishment outcomes, and degraded-component notices.

use crate::messages::PeerAnnouncement;
use om_common::{Endpoint, MachineId, NatType, PeerId};
use uuid::Uuid;

/// Events delivered to the embedding application.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// The node bound its transport and started its dispatch loop.
    Started { local_endpoint: Endpoint },

    /// The STUN classifier produced a verdict.
    NatClassified {
        nat_type: NatType,
        public_endpoint: Option<Endpoint>,
    },

    /// A previously unknown peer's announcement was accepted.
    PeerDiscovered(PeerId),

    /// A cached announcement expired and was dropped.
    PeerExpired(PeerId),

    /// A verified announcement was received (new or refreshed).
    AnnouncementReceived(PeerAnnouncement),

    /// A monitored machine failed its keepalive threshold and was removed.
    KeepaliveFailed {
        peer_id: PeerId,
        machine_id: MachineId,
        endpoint: Option<Endpoint>,
    },

    /// A hole punch opened a direct path.
    HolePunchSucceeded { peer_id: PeerId, endpoint: Endpoint },

    /// A hole punch ran out of its attempt window or was refused.
    HolePunchFailed { peer_id: PeerId },

    /// A relay session was accepted (either side).
    RelaySessionOpened {
        session_id: Uuid,
        peer_id: PeerId,
        via: PeerId,
    },

    /// A relay session ended or was evicted.
    RelaySessionClosed { session_id: Uuid },

    /// A component failed to start; the capability is degraded, the node
    /// keeps running.
    ComponentDegraded {
        component: &'static str,
        reason: String,
    },

    /// The dispatch loop exited.
    Stopped,
}
