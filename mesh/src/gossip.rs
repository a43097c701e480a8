// Copyright (c) 2026 The Omerta Project

//! Announcement gossip: bounded fan-out with loop suppression.
//!
//! Each round broadcasts the local announcement plus a small random sample of
//! cached ones. A bounded set of `peerId:timestamp` gossip ids suppresses
//! re-broadcast loops; hop counts bound propagation depth. The engine only
//! plans; the dispatcher owns sockets and does the sending.

use crate::{config::GossipConfig, messages::PeerAnnouncement, peer_cache::PeerCache};
use om_common::PeerId;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Bounded set of recently gossiped announcement ids with deterministic
/// half-eviction on overflow.
pub struct RecentGossip {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentGossip {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Mark an id as gossiped. Returns false when it was already marked.
    pub fn mark(&mut self, gossip_id: &str) -> bool {
        if !self.ids.insert(gossip_id.to_string()) {
            return false;
        }
        self.order.push_back(gossip_id.to_string());
        if self.order.len() > self.capacity {
            for _ in 0..self.capacity / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, gossip_id: &str) -> bool {
        self.ids.contains(gossip_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One planned announce message.
#[derive(Clone, Debug)]
pub struct PlannedBroadcast {
    pub announcements: Vec<PeerAnnouncement>,
    pub targets: Vec<PeerId>,
}

/// The gossip engine. Owned by the dispatcher.
pub struct GossipEngine {
    config: GossipConfig,
    recent: RecentGossip,
}

impl GossipEngine {
    pub fn new(config: GossipConfig) -> Self {
        let recent = RecentGossip::new(config.max_recent_gossip);
        Self { config, recent }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Plan one periodic round: the local announcement plus up to
    /// `sample_size` cached announcements not yet gossiped, fanned out to up
    /// to `fanout` random peers.
    pub fn plan_round<R: Rng>(
        &mut self,
        own: &PeerAnnouncement,
        cache: &PeerCache,
        now_secs: u64,
        rng: &mut R,
    ) -> Option<PlannedBroadcast> {
        let mut announcements = vec![own.clone()];
        for cached in cache.sample(self.config.sample_size, &own.peer_id, now_secs, rng) {
            if announcements.len() >= self.config.max_announcements_per_message {
                break;
            }
            if self.recent.mark(&cached.gossip_id()) {
                announcements.push(cached);
            }
        }

        let mut targets: Vec<PeerId> = cache
            .sample(usize::MAX, &own.peer_id, now_secs, rng)
            .into_iter()
            .map(|ann| ann.peer_id)
            .collect();
        if targets.is_empty() {
            return None;
        }
        targets.shuffle(rng);
        targets.truncate(self.config.fanout);

        trace!(
            announcements = announcements.len(),
            targets = targets.len(),
            "gossip round planned"
        );
        Some(PlannedBroadcast {
            announcements,
            targets,
        })
    }

    /// Decide whether a received announcement gets re-broadcast. Marks the
    /// dedup set, so a given announcement is forwarded at most once per node.
    /// The caller has already verified the signature and freshness.
    pub fn should_rebroadcast(&mut self, announcement: &PeerAnnouncement, hop_count: u8) -> bool {
        if hop_count >= self.config.max_hops {
            return false;
        }
        self.recent.mark(&announcement.gossip_id())
    }

    /// Fan-out targets for a re-broadcast, excluding self and the sender.
    pub fn rebroadcast_targets<R: Rng>(
        &self,
        cache: &PeerCache,
        own_peer_id: &PeerId,
        sender: &PeerId,
        announced: &PeerId,
        now_secs: u64,
        rng: &mut R,
    ) -> Vec<PeerId> {
        let mut targets: Vec<PeerId> = cache
            .sample(usize::MAX, own_peer_id, now_secs, rng)
            .into_iter()
            .map(|ann| ann.peer_id)
            .filter(|peer| peer != sender && peer != announced)
            .collect();
        targets.shuffle(rng);
        targets.truncate(self.config.fanout);
        targets
    }
}
