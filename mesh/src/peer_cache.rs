// Copyright (c) 2026 The Omerta Project

//! Bounded LRU cache of verified peer announcements.
//!
//! Insertion verifies the signature and the peer-id derivation, refuses stale
//! replacements, and evicts the least recently touched entry when full.
//! Expiry is wall-clock: `now - timestamp > ttl_seconds`.

use crate::messages::PeerAnnouncement;
use om_common::{Capabilities, PeerId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of offering an announcement to the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    /// First announcement seen for this peer.
    New,
    /// Replaced an older announcement for a known peer.
    Refreshed,
    /// Rejected: bad signature, expired, stale, or capacity exhausted.
    Rejected,
}

struct CacheEntry {
    announcement: PeerAnnouncement,
    last_touched: u64,
}

/// Statistics snapshot over the cache.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerCacheStats {
    pub total_peers: usize,
    pub relay_capable: usize,
    pub coordinator_capable: usize,
    pub newest_announcement: u64,
    pub oldest_announcement: u64,
}

/// The announcement cache. Owned by the dispatcher; no interior locking.
pub struct PeerCache {
    max_entries: usize,
    entries: HashMap<PeerId, CacheEntry>,
    tick: u64,
}

impl PeerCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    /// Verify and insert. Returns what happened so callers can raise events
    /// and count duplicates.
    pub fn insert(&mut self, announcement: PeerAnnouncement, now_secs: u64) -> InsertOutcome {
        if !announcement.verify() {
            warn!(peer_id = %announcement.peer_id, "rejecting announcement with bad signature");
            return InsertOutcome::Rejected;
        }
        if announcement.is_expired(now_secs) {
            debug!(peer_id = %announcement.peer_id, "rejecting expired announcement");
            return InsertOutcome::Rejected;
        }

        let peer_id = announcement.peer_id.clone();
        if let Some(existing) = self.entries.get(&peer_id) {
            if !announcement.is_newer_than(&existing.announcement) {
                return InsertOutcome::Rejected;
            }
        } else if self.entries.len() >= self.max_entries && !self.evict_lru() {
            warn!("peer cache full, rejecting new announcement");
            return InsertOutcome::Rejected;
        }

        self.tick += 1;
        let outcome = if self.entries.contains_key(&peer_id) {
            InsertOutcome::Refreshed
        } else {
            InsertOutcome::New
        };
        self.entries.insert(
            peer_id,
            CacheEntry {
                announcement,
                last_touched: self.tick,
            },
        );
        outcome
    }

    pub fn get(&mut self, peer_id: &PeerId) -> Option<&PeerAnnouncement> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(peer_id).map(|entry| {
            entry.last_touched = tick;
            &entry.announcement
        })
    }

    /// Read without refreshing recency.
    pub fn peek(&self, peer_id: &PeerId) -> Option<&PeerAnnouncement> {
        self.entries.get(peer_id).map(|entry| &entry.announcement)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerAnnouncement> {
        self.entries.remove(peer_id).map(|entry| entry.announcement)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Random sample of non-expired announcements, excluding one peer
    /// (normally self).
    pub fn sample<R: Rng>(
        &self,
        count: usize,
        exclude: &PeerId,
        now_secs: u64,
        rng: &mut R,
    ) -> Vec<PeerAnnouncement> {
        let mut candidates: Vec<&PeerAnnouncement> = self
            .entries
            .values()
            .map(|entry| &entry.announcement)
            .filter(|ann| &ann.peer_id != exclude && !ann.is_expired(now_secs))
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(count);
        candidates.into_iter().cloned().collect()
    }

    /// Peers carrying every capability in `required`, non-expired.
    pub fn with_capabilities(&self, required: Capabilities, now_secs: u64) -> Vec<&PeerAnnouncement> {
        self.entries
            .values()
            .map(|entry| &entry.announcement)
            .filter(|ann| ann.capabilities.contains(required) && !ann.is_expired(now_secs))
            .collect()
    }

    /// Announcements newer than a given instant (anti-entropy reply).
    pub fn newer_than(&self, since_secs: u64) -> Vec<&PeerAnnouncement> {
        self.entries
            .values()
            .map(|entry| &entry.announcement)
            .filter(|ann| ann.timestamp > since_secs)
            .collect()
    }

    /// Drop expired entries; returns the ids that were removed.
    pub fn cleanup_expired(&mut self, now_secs: u64) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.announcement.is_expired(now_secs))
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in &expired {
            self.entries.remove(peer_id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "dropped expired announcements");
        }
        expired
    }

    pub fn stats(&self) -> PeerCacheStats {
        let mut stats = PeerCacheStats {
            total_peers: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            let ann = &entry.announcement;
            if ann.capabilities.contains(Capabilities::RELAY) {
                stats.relay_capable += 1;
            }
            if ann.capabilities.contains(Capabilities::COORDINATOR) {
                stats.coordinator_capable += 1;
            }
            if stats.newest_announcement == 0 || ann.timestamp > stats.newest_announcement {
                stats.newest_announcement = ann.timestamp;
            }
            if stats.oldest_announcement == 0 || ann.timestamp < stats.oldest_announcement {
                stats.oldest_announcement = ann.timestamp;
            }
        }
        stats
    }

    fn evict_lru(&mut self) -> bool {
        let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_touched)
            .map(|(peer_id, _)| peer_id.clone())
        else {
            return false;
        };
        debug!(peer_id = %victim, "evicting least recently used announcement");
        self.entries.remove(&victim);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use om_common::{Endpoint, NodeIdentity, ReachabilityPath};
    use rand::thread_rng;

    fn signed(identity: &NodeIdentity, timestamp: u64) -> PeerAnnouncement {
        let mut ann = PeerAnnouncement::new(
            identity.peer_id(),
            identity.public_key_bytes(),
            vec![ReachabilityPath::Direct {
                endpoint: Endpoint::new("1.2.3.4:9000").unwrap(),
            }],
            Capabilities::GOSSIP,
            timestamp,
            120,
        );
        ann.sign(identity);
        ann
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = PeerCache::new(10);
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let ann = signed(&identity, 1_000);

        assert_eq!(cache.insert(ann.clone(), 1_000), InsertOutcome::New);
        assert_eq!(cache.get(&identity.peer_id()), Some(&ann));
    }

    #[test]
    fn test_rejects_unsigned() {
        let mut cache = PeerCache::new(10);
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let mut ann = signed(&identity, 1_000);
        ann.signature = [0u8; 64];
        assert_eq!(cache.insert(ann, 1_000), InsertOutcome::Rejected);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rejects_expired() {
        let mut cache = PeerCache::new(10);
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let ann = signed(&identity, 1_000);
        assert_eq!(cache.insert(ann, 5_000), InsertOutcome::Rejected);
    }

    #[test]
    fn test_rejects_stale_replacement() {
        let mut cache = PeerCache::new(10);
        let identity = NodeIdentity::from_random(&mut thread_rng());
        assert_eq!(
            cache.insert(signed(&identity, 2_000), 2_000),
            InsertOutcome::New
        );
        assert_eq!(
            cache.insert(signed(&identity, 1_500), 2_000),
            InsertOutcome::Rejected
        );
        assert_eq!(
            cache.insert(signed(&identity, 2_500), 2_000),
            InsertOutcome::Refreshed
        );
    }

    #[test]
    fn test_lru_eviction_when_full() {
        let mut cache = PeerCache::new(2);
        let a = NodeIdentity::from_random(&mut thread_rng());
        let b = NodeIdentity::from_random(&mut thread_rng());
        let c = NodeIdentity::from_random(&mut thread_rng());

        cache.insert(signed(&a, 1_000), 1_000);
        cache.insert(signed(&b, 1_000), 1_000);
        // Touch a so b becomes the LRU victim.
        cache.get(&a.peer_id());
        cache.insert(signed(&c, 1_000), 1_000);

        assert!(cache.contains(&a.peer_id()));
        assert!(!cache.contains(&b.peer_id()));
        assert!(cache.contains(&c.peer_id()));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut cache = PeerCache::new(10);
        let a = NodeIdentity::from_random(&mut thread_rng());
        let b = NodeIdentity::from_random(&mut thread_rng());
        cache.insert(signed(&a, 1_000), 1_000);
        cache.insert(signed(&b, 2_000), 2_000);

        let removed = cache.cleanup_expired(2_000);
        assert_eq!(removed, vec![a.peer_id()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sample_excludes_self_and_expired() {
        let mut cache = PeerCache::new(10);
        let me = NodeIdentity::from_random(&mut thread_rng());
        let other = NodeIdentity::from_random(&mut thread_rng());
        let stale = NodeIdentity::from_random(&mut thread_rng());
        cache.insert(signed(&me, 2_000), 2_000);
        cache.insert(signed(&other, 2_000), 2_000);
        cache.insert(signed(&stale, 1_000), 1_000);

        let sample = cache.sample(10, &me.peer_id(), 2_000, &mut thread_rng());
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].peer_id, other.peer_id());
    }

    #[test]
    fn test_stats_counts_capabilities() {
        let mut cache = PeerCache::new(10);
        let relay = NodeIdentity::from_random(&mut thread_rng());
        let mut ann = PeerAnnouncement::new(
            relay.peer_id(),
            relay.public_key_bytes(),
            vec![],
            Capabilities::GOSSIP | Capabilities::RELAY | Capabilities::COORDINATOR,
            1_000,
            120,
        );
        ann.sign(&relay);
        cache.insert(ann, 1_000);

        let stats = cache.stats();
        assert_eq!(stats.total_peers, 1);
        assert_eq!(stats.relay_capable, 1);
        assert_eq!(stats.coordinator_capable, 1);
        assert_eq!(stats.newest_announcement, 1_000);
    }
}
