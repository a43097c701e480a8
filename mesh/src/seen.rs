// Copyright (c) 2026 The Omerta Project

//! Per-sender replay suppression.
//!
//! Each sender gets a bounded set of message ids in arrival order. When a
//! sender's set is full, the older half is evicted in one deterministic
//! sweep; the same id from a different sender is never a collision.

use om_common::PeerId;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Default per-peer capacity.
pub const DEFAULT_CAPACITY: usize = 512;

struct PeerSeen {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

/// Bounded per-sender dedup table.
pub struct SeenMessages {
    capacity: usize,
    peers: HashMap<PeerId, PeerSeen>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            peers: HashMap::new(),
        }
    }

    /// Record a message id. Returns false when it was already seen from this
    /// sender (the caller drops the datagram).
    pub fn insert(&mut self, sender: &PeerId, message_id: Uuid) -> bool {
        let seen = self.peers.entry(sender.clone()).or_insert_with(|| PeerSeen {
            order: VecDeque::new(),
            ids: HashSet::new(),
        });
        if !seen.ids.insert(message_id) {
            return false;
        }
        seen.order.push_back(message_id);
        if seen.order.len() > self.capacity {
            // Deterministic half-eviction, oldest first.
            for _ in 0..self.capacity / 2 {
                if let Some(old) = seen.order.pop_front() {
                    seen.ids.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, sender: &PeerId, message_id: &Uuid) -> bool {
        self.peers
            .get(sender)
            .is_some_and(|seen| seen.ids.contains(message_id))
    }

    /// Forget a sender entirely (on peer removal).
    pub fn remove_peer(&mut self, sender: &PeerId) {
        self.peers.remove(sender);
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_public_key(&[n; 32])
    }

    #[test]
    fn test_first_insert_accepts_replay_rejects() {
        let mut seen = SeenMessages::new(8);
        let id = Uuid::new_v4();
        assert!(seen.insert(&peer(1), id));
        assert!(!seen.insert(&peer(1), id));
    }

    #[test]
    fn test_same_id_from_different_sender_is_not_a_collision() {
        let mut seen = SeenMessages::new(8);
        let id = Uuid::new_v4();
        assert!(seen.insert(&peer(1), id));
        assert!(seen.insert(&peer(2), id));
    }

    #[test]
    fn test_half_eviction_drops_oldest() {
        let mut seen = SeenMessages::new(4);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(seen.insert(&peer(1), *id));
        }
        // Capacity 4 overflowed at the fifth insert; the oldest two are gone.
        assert!(!seen.contains(&peer(1), &ids[0]));
        assert!(!seen.contains(&peer(1), &ids[1]));
        assert!(seen.contains(&peer(1), &ids[2]));
        assert!(seen.contains(&peer(1), &ids[4]));
        // Evicted ids are accepted again.
        assert!(seen.insert(&peer(1), ids[0]));
    }

    #[test]
    fn test_remove_peer_forgets_history() {
        let mut seen = SeenMessages::new(8);
        let id = Uuid::new_v4();
        seen.insert(&peer(1), id);
        seen.remove_peer(&peer(1));
        assert!(seen.insert(&peer(1), id));
    }
}
