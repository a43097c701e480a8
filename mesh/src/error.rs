// Copyright (c) 2026 The Omerta Project

//! Error types for mesh operations.
//!
//! Datagram-plane failures (parse, crypto, transport receive) never surface
//! here; the dispatcher counts them and drops the packet. These are the
//! errors of request-shaped operations: sends, pings, punches, relays.

use displaydoc::Display;
use om_common::{MachineId, PeerId};
use om_envelope::EnvelopeError;
use om_stun::StunError;
use thiserror::Error;

/// Errors surfaced by mesh operations.
#[derive(Debug, Display, Error)]
pub enum MeshError {
    /// No known endpoint for peer {0}
    NoEndpoint(PeerId),

    /// Peer {0} is unreachable by any strategy
    Unreachable(PeerId),

    /// Hop limit exceeded
    HopLimitExceeded,

    /// Could not bind the transport socket: {0}
    BindFailed(#[source] std::io::Error),

    /// Sending {bytes} bytes to {destination} failed: {source}
    SendFailed {
        destination: String,
        bytes: usize,
        #[source]
        source: std::io::Error,
    },

    /// No pong from {peer_id}/{machine_id} within the response timeout
    PingTimeout {
        peer_id: PeerId,
        machine_id: MachineId,
    },

    /// Hole punch to {0} did not complete within the attempt window
    HolePunchTimeout(PeerId),

    /// Hole punch to {0} is impossible for this NAT pairing
    HolePunchImpossible(PeerId),

    /// Relay {0} did not answer within the request timeout
    RelayTimeout(PeerId),

    /// Relay {relay} denied the session: {reason}
    RelayDenied { relay: PeerId, reason: String },

    /// Relay capacity exhausted
    RelayCapacity,

    /// A session with this id or token already exists
    DuplicateSession,

    /// No relay session established with peer {0}
    NoSession(PeerId),

    /// Node is not running
    NotRunning,

    /// Node is already running
    AlreadyRunning,

    /// Response signature did not verify
    SignatureInvalid,

    /// Claimed peer id is not derived from the presented key
    PeerIdNotDerived,

    /// Envelope encoding failed: {0}
    Envelope(#[from] EnvelopeError),

    /// NAT classification failed: {0}
    Stun(#[from] StunError),

    /// Invalid configuration: {0}
    Config(#[from] crate::config::ConfigError),

    /// Channel name rejected: {0}
    Channel(#[from] om_envelope::ChannelError),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
