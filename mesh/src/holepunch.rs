// Copyright (c) 2026 The Omerta Project

//! Hole-punch coordination.
//!
//! A third peer (the coordinator) relays endpoint and NAT information between
//! two NAT-bound peers, then tells both to fire probes. The strategy table is
//! a pure function over the classified NAT pair; `Unknown` never reaches it
//! because coordination refuses unclassified parties up front.

use crate::{config::HolePunchConfig, error::MeshError};
use om_common::{Endpoint, NatType, PeerId};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// How the two probe bursts are ordered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PunchStrategy {
    /// Both sides fire as soon as they receive the execute message.
    Simultaneous,
    /// The initiator's burst opens the path for the responder's.
    InitiatorFirst,
    /// The responder's burst opens the path for the initiator's.
    ResponderFirst,
    /// No probe ordering can work; fall through to relay.
    Impossible,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum NatGroup {
    Open,
    Restricted,
    Symmetric,
}

fn group(nat: NatType) -> Option<NatGroup> {
    match nat {
        NatType::Public | NatType::FullCone => Some(NatGroup::Open),
        NatType::RestrictedCone | NatType::PortRestrictedCone => Some(NatGroup::Restricted),
        NatType::Symmetric => Some(NatGroup::Symmetric),
        NatType::Unknown => None,
    }
}

/// The strategy table over classified NAT types. `None` when either side is
/// unclassified, in which case hole punching is disabled for the pair.
pub fn strategy_for(initiator: NatType, responder: NatType) -> Option<PunchStrategy> {
    use NatGroup::*;
    let strategy = match (group(initiator)?, group(responder)?) {
        (Open | Restricted, Open | Restricted) => PunchStrategy::Simultaneous,
        (Open, Symmetric) => PunchStrategy::InitiatorFirst,
        (Restricted, Symmetric) => PunchStrategy::ResponderFirst,
        (Symmetric, Open) => PunchStrategy::ResponderFirst,
        (Symmetric, Restricted) => PunchStrategy::InitiatorFirst,
        (Symmetric, Symmetric) => PunchStrategy::Impossible,
    };
    Some(strategy)
}

/// Initiator-side attempt lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PunchState {
    /// Request sent to the coordinator.
    Requested,
    /// The responder accepted; waiting for the execute message.
    Invited,
    /// Probes are in flight.
    Probing,
    Succeeded,
    Failed,
}

/// One punch attempt tracked by an endpoint peer (initiator or responder).
pub struct PunchAttempt {
    pub attempt_id: Uuid,
    pub remote_peer: PeerId,
    pub state: PunchState,
    pub deadline: Instant,
    /// Resolved with the opened endpoint or a timeout error.
    pub waiter: Option<oneshot::Sender<Result<Endpoint, MeshError>>>,
}

/// Coordinator-side bookkeeping for one rendezvous.
pub struct PendingRendezvous {
    pub initiator: PeerId,
    pub initiator_endpoint: Endpoint,
    pub initiator_nat: NatType,
    pub target: PeerId,
    pub deadline: Instant,
}

/// All punch state on one node, in either role.
pub struct HolePunchCoordinator {
    config: HolePunchConfig,
    attempts: HashMap<Uuid, PunchAttempt>,
    rendezvous: HashMap<Uuid, PendingRendezvous>,
}

impl HolePunchCoordinator {
    pub fn new(config: HolePunchConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
            rendezvous: HashMap::new(),
        }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.config
    }

    pub fn begin_attempt(
        &mut self,
        remote_peer: PeerId,
        state: PunchState,
        waiter: Option<oneshot::Sender<Result<Endpoint, MeshError>>>,
    ) -> Uuid {
        let attempt_id = Uuid::new_v4();
        self.attempts.insert(
            attempt_id,
            PunchAttempt {
                attempt_id,
                remote_peer,
                state,
                deadline: Instant::now() + self.config.attempt_window(),
                waiter,
            },
        );
        attempt_id
    }

    /// Track the responder side of an invite under the initiator's id.
    pub fn accept_invite(&mut self, attempt_id: Uuid, remote_peer: PeerId) {
        self.attempts.insert(
            attempt_id,
            PunchAttempt {
                attempt_id,
                remote_peer,
                state: PunchState::Invited,
                deadline: Instant::now() + self.config.attempt_window(),
                waiter: None,
            },
        );
    }

    pub fn attempt_mut(&mut self, attempt_id: &Uuid) -> Option<&mut PunchAttempt> {
        self.attempts.get_mut(attempt_id)
    }

    pub fn attempt_state(&self, attempt_id: &Uuid) -> Option<PunchState> {
        self.attempts.get(attempt_id).map(|attempt| attempt.state)
    }

    /// Resolve an attempt as opened; returns the attempt for event raising.
    pub fn succeed(&mut self, attempt_id: &Uuid, endpoint: Endpoint) -> Option<PunchAttempt> {
        let mut attempt = self.attempts.remove(attempt_id)?;
        attempt.state = PunchState::Succeeded;
        if let Some(waiter) = attempt.waiter.take() {
            let _ = waiter.send(Ok(endpoint));
        }
        Some(attempt)
    }

    /// Resolve an attempt as failed with the given error.
    pub fn fail(&mut self, attempt_id: &Uuid, error: MeshError) -> Option<PunchAttempt> {
        let mut attempt = self.attempts.remove(attempt_id)?;
        attempt.state = PunchState::Failed;
        if let Some(waiter) = attempt.waiter.take() {
            let _ = waiter.send(Err(error));
        }
        Some(attempt)
    }

    pub fn begin_rendezvous(&mut self, attempt_id: Uuid, pending: PendingRendezvous) {
        self.rendezvous.insert(attempt_id, pending);
    }

    pub fn take_rendezvous(&mut self, attempt_id: &Uuid) -> Option<PendingRendezvous> {
        self.rendezvous.remove(attempt_id)
    }

    /// Expire overdue attempts and rendezvous. Returns the failed attempts
    /// so the caller can raise events and fall through to relay.
    pub fn sweep(&mut self, now: Instant) -> Vec<PunchAttempt> {
        self.rendezvous.retain(|_, pending| pending.deadline > now);

        let expired: Vec<Uuid> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| attempt.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut failed = Vec::with_capacity(expired.len());
        for attempt_id in expired {
            debug!(%attempt_id, "hole punch attempt expired");
            if let Some(mut attempt) = self.attempts.remove(&attempt_id) {
                attempt.state = PunchState::Failed;
                if let Some(waiter) = attempt.waiter.take() {
                    let _ = waiter
                        .send(Err(MeshError::HolePunchTimeout(attempt.remote_peer.clone())));
                }
                failed.push(attempt);
            }
        }
        failed
    }
}
