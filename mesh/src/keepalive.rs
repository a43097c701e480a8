// Copyright (c) 2026 The Omerta Project

//! The keepalive scheduler.
//!
//! Every cycle it pings a weighted sample of tracked machines: the longer a
//! machine has gone unconfirmed, the more likely it is to be picked, with a
//! floor so fresh machines still get occasional traffic. The scheduler only
//! reports failures; path re-discovery is the caller's decision.

use crate::config::KeepaliveConfig;
use om_common::{Endpoint, MachineId, PeerId};
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Monitoring state for one machine of one peer.
#[derive(Clone, Debug)]
pub struct MachineState {
    pub peer_id: PeerId,
    pub machine_id: MachineId,
    pub last_known_endpoint: Option<Endpoint>,
    /// Millisecond timestamp of the last confirmed round trip or inbound
    /// datagram.
    pub last_successful_ping: u64,
    pub missed_pings: u32,
}

impl MachineState {
    pub fn is_healthy(&self, missed_threshold: u32) -> bool {
        self.missed_pings < missed_threshold
    }
}

/// Weighted-sampling keepalive scheduler. Owned by the dispatcher.
pub struct KeepaliveScheduler {
    config: KeepaliveConfig,
    machines: HashMap<(PeerId, MachineId), MachineState>,
}

impl KeepaliveScheduler {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            machines: HashMap::new(),
        }
    }

    pub fn config(&self) -> &KeepaliveConfig {
        &self.config
    }

    /// Start monitoring a machine if it is not tracked yet.
    pub fn track(&mut self, peer_id: &PeerId, machine_id: &MachineId, now_millis: u64) {
        self.machines
            .entry((peer_id.clone(), machine_id.clone()))
            .or_insert_with(|| MachineState {
                peer_id: peer_id.clone(),
                machine_id: machine_id.clone(),
                last_known_endpoint: None,
                last_successful_ping: now_millis,
                missed_pings: 0,
            });
    }

    /// Any inbound datagram from the machine counts as proof of life.
    pub fn record_success(
        &mut self,
        peer_id: &PeerId,
        machine_id: &MachineId,
        endpoint: Option<Endpoint>,
        now_millis: u64,
    ) {
        if let Some(state) = self
            .machines
            .get_mut(&(peer_id.clone(), machine_id.clone()))
        {
            state.missed_pings = 0;
            state.last_successful_ping = now_millis;
            if endpoint.is_some() {
                state.last_known_endpoint = endpoint;
            }
        }
    }

    /// A ping went unanswered. When the miss count reaches the threshold the
    /// machine is removed and its final state returned exactly once, so the
    /// caller can notify the failure handler.
    pub fn record_failure(
        &mut self,
        peer_id: &PeerId,
        machine_id: &MachineId,
    ) -> Option<MachineState> {
        let key = (peer_id.clone(), machine_id.clone());
        let state = self.machines.get_mut(&key)?;
        state.missed_pings += 1;
        if state.missed_pings >= self.config.missed_threshold {
            debug!(%peer_id, %machine_id, "machine failed keepalive threshold");
            return self.machines.remove(&key);
        }
        None
    }

    pub fn is_tracked(&self, peer_id: &PeerId, machine_id: &MachineId) -> bool {
        self.machines
            .contains_key(&(peer_id.clone(), machine_id.clone()))
    }

    pub fn get(&self, peer_id: &PeerId, machine_id: &MachineId) -> Option<&MachineState> {
        self.machines.get(&(peer_id.clone(), machine_id.clone()))
    }

    pub fn tracked_count(&self) -> usize {
        self.machines.len()
    }

    /// Stop monitoring every machine of a peer.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.machines.retain(|(p, _), _| p != peer_id);
    }

    /// Sampling weight for a machine last confirmed `age_millis` ago.
    pub fn weight(&self, age_millis: u64) -> f64 {
        let half_life = (self.config.sampling_half_life_secs * 1_000).max(1) as f64;
        let decayed = 0.5f64.powf(age_millis as f64 / half_life);
        decayed.max(self.config.min_sampling_weight)
    }

    /// Pick this cycle's machines. Everything is selected when at or under
    /// the cap; otherwise a weighted sample without replacement, oldest
    /// confirmations favored.
    pub fn select_for_cycle<R: Rng>(
        &self,
        now_millis: u64,
        rng: &mut R,
    ) -> Vec<(PeerId, MachineId)> {
        let cap = self.config.max_machines_per_cycle;
        if self.machines.len() <= cap {
            return self.machines.keys().cloned().collect();
        }

        // Weighted sampling without replacement (Efraimidis-Spirakis): each
        // candidate draws a key u^(1/w) and the largest keys win.
        let mut keyed: Vec<(f64, &(PeerId, MachineId))> = self
            .machines
            .iter()
            .map(|(key, state)| {
                let age = now_millis.saturating_sub(state.last_successful_ping);
                let weight = self.weight(age);
                let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
                (uniform.powf(1.0 / weight), key)
            })
            .collect();
        keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        keyed.into_iter().take(cap).map(|(_, key)| key.clone()).collect()
    }
}
