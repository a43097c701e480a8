// Copyright (c) 2026 The Omerta Project

//! Per-machine endpoint tracking.
//!
//! Each (peer, machine) pair keeps a recency-ordered endpoint list: the most
//! recently observed or successfully used endpoint sits at the front.
//! Cross-machine queries concatenate the per-machine lists in stable machine
//! order, then partition IPv6 ahead of IPv4 while preserving recency inside
//! each family. The dispatcher is the single writer; no interior locking.

use om_common::{Endpoint, MachineId, PeerId, ValidationMode};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Tracks which physical endpoint currently reaches each machine of each peer.
#[derive(Debug)]
pub struct EndpointManager {
    peers: HashMap<PeerId, BTreeMap<MachineId, Vec<Endpoint>>>,
    validation_mode: ValidationMode,
}

impl EndpointManager {
    pub fn new(validation_mode: ValidationMode) -> Self {
        Self {
            peers: HashMap::new(),
            validation_mode,
        }
    }

    /// Record an endpoint observed on an inbound datagram. Invalid endpoints
    /// under the active validation mode are silently discarded.
    pub fn record_received(&mut self, peer: &PeerId, machine: &MachineId, endpoint: Endpoint) {
        self.promote(peer, machine, endpoint);
    }

    /// Record an endpoint that just carried a successful send.
    pub fn record_send_success(&mut self, peer: &PeerId, machine: &MachineId, endpoint: Endpoint) {
        self.promote(peer, machine, endpoint);
    }

    fn promote(&mut self, peer: &PeerId, machine: &MachineId, endpoint: Endpoint) {
        if !endpoint.is_valid_under(self.validation_mode) {
            trace!(%peer, %machine, %endpoint, "discarding endpoint failing validation");
            return;
        }
        let list = self
            .peers
            .entry(peer.clone())
            .or_default()
            .entry(machine.clone())
            .or_default();
        list.retain(|existing| existing != &endpoint);
        list.insert(0, endpoint);
    }

    /// Endpoints for one machine, most recent first.
    pub fn get_endpoints(&self, peer: &PeerId, machine: &MachineId) -> &[Endpoint] {
        self.peers
            .get(peer)
            .and_then(|machines| machines.get(machine))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Best endpoint for one machine: first IPv6 if any, else the most
    /// recent endpoint.
    pub fn get_best(&self, peer: &PeerId, machine: &MachineId) -> Option<&Endpoint> {
        let list = self.get_endpoints(peer, machine);
        list.iter().find(|ep| ep.is_ipv6()).or_else(|| list.first())
    }

    /// All endpoints across a peer's machines: IPv6 before IPv4, recency
    /// preserved within each family, first occurrence wins on duplicates.
    pub fn get_all_endpoints(&self, peer: &PeerId) -> Vec<Endpoint> {
        let Some(machines) = self.peers.get(peer) else {
            return Vec::new();
        };
        let merged: Vec<&Endpoint> = machines.values().flatten().collect();
        let mut ordered: Vec<&Endpoint> = Vec::with_capacity(merged.len());
        ordered.extend(merged.iter().filter(|ep| ep.is_ipv6()));
        ordered.extend(merged.iter().filter(|ep| !ep.is_ipv6()));

        let mut seen = HashSet::new();
        ordered
            .into_iter()
            .filter(|ep| seen.insert((*ep).clone()))
            .cloned()
            .collect()
    }

    /// Best endpoint across every machine of a peer.
    pub fn get_best_any(&self, peer: &PeerId) -> Option<Endpoint> {
        self.get_all_endpoints(peer).into_iter().next()
    }

    /// Machines currently tracked for a peer.
    pub fn machines(&self, peer: &PeerId) -> Vec<MachineId> {
        self.peers
            .get(peer)
            .map(|machines| machines.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop one endpoint wherever it appears for the peer.
    pub fn remove_endpoint(&mut self, peer: &PeerId, endpoint: &Endpoint) {
        if let Some(machines) = self.peers.get_mut(peer) {
            for list in machines.values_mut() {
                list.retain(|existing| existing != endpoint);
            }
            machines.retain(|_, list| !list.is_empty());
        }
    }

    /// Drop a whole machine.
    pub fn remove_machine(&mut self, peer: &PeerId, machine: &MachineId) {
        if let Some(machines) = self.peers.get_mut(peer) {
            machines.remove(machine);
            if machines.is_empty() {
                self.peers.remove(peer);
            }
        }
    }

    /// Drop a peer entirely.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}
