// Copyright (c) 2026 The Omerta Project

//! Mesh protocol payloads and signed peer announcements.
//!
//! Every payload on the reserved channel is one `ProtocolMessage`, encoded as
//! JSON inside the (already encrypted and authenticated) envelope payload.
//! Announcements carry their own signature so they stay verifiable when
//! re-gossiped by third parties.

use om_common::{
    identity::verify_signature, Capabilities, Endpoint, NatType, NodeIdentity, PeerId,
    ReachabilityPath,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A signed, self-contained claim of how to reach a peer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    pub peer_id: PeerId,

    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],

    /// Ways of reaching this peer, best first.
    pub reachability: Vec<ReachabilityPath>,

    pub capabilities: Capabilities,

    /// Seconds since the Unix epoch at signing time.
    pub timestamp: u64,

    /// Lifetime after `timestamp`.
    pub ttl_seconds: u64,

    /// Signature over every field above.
    #[serde(with = "hex_sig")]
    pub signature: [u8; 64],
}

impl PeerAnnouncement {
    /// Create an unsigned announcement; call `sign` before sending.
    pub fn new(
        peer_id: PeerId,
        public_key: [u8; 32],
        reachability: Vec<ReachabilityPath>,
        capabilities: Capabilities,
        timestamp: u64,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            peer_id,
            public_key,
            reachability,
            capabilities,
            timestamp,
            ttl_seconds,
            signature: [0u8; 64],
        }
    }

    /// The canonical byte string covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        push_str(&mut bytes, self.peer_id.as_str());
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&(self.reachability.len() as u16).to_le_bytes());
        for path in &self.reachability {
            match path {
                ReachabilityPath::Direct { endpoint } => {
                    bytes.push(0);
                    push_str(&mut bytes, endpoint.as_str());
                }
                ReachabilityPath::Relay {
                    relay_peer_id,
                    relay_endpoint,
                } => {
                    bytes.push(1);
                    push_str(&mut bytes, relay_peer_id.as_str());
                    push_str(&mut bytes, relay_endpoint.as_str());
                }
                ReachabilityPath::HolePunch {
                    public_ip,
                    local_port,
                } => {
                    bytes.push(2);
                    push_str(&mut bytes, public_ip);
                    bytes.extend_from_slice(&local_port.to_le_bytes());
                }
            }
        }
        bytes.extend_from_slice(&self.capabilities.bits().to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.ttl_seconds.to_le_bytes());
        bytes
    }

    /// Sign in place with the announcing node's identity.
    pub fn sign(&mut self, identity: &NodeIdentity) {
        self.signature = identity.sign(&self.signing_bytes());
    }

    /// Verify the embedded signature and that the peer id re-derives from
    /// the embedded key.
    pub fn verify(&self) -> bool {
        self.peer_id.matches_public_key(&self.public_key)
            && verify_signature(&self.public_key, &self.signing_bytes(), &self.signature)
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.timestamp) > self.ttl_seconds
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }

    /// Dedup key for gossip: one id per (peer, signing instant).
    pub fn gossip_id(&self) -> String {
        format!("{}:{}", self.peer_id, self.timestamp)
    }

    /// The first direct endpoint, if the peer advertises one.
    pub fn direct_endpoint(&self) -> Option<&Endpoint> {
        self.reachability.iter().find_map(|path| match path {
            ReachabilityPath::Direct { endpoint } => Some(endpoint),
            _ => None,
        })
    }
}

fn push_str(bytes: &mut Vec<u8>, value: &str) {
    bytes.extend_from_slice(&(value.len() as u16).to_le_bytes());
    bytes.extend_from_slice(value.as_bytes());
}

/// Cache summary entry used by the pull side of anti-entropy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipSummary {
    pub peer_id: PeerId,
    pub timestamp: u64,
}

/// Everything the reserved mesh channel can carry.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProtocolMessage {
    /// Liveness probe; the pong echoes the envelope's message id.
    Ping,

    /// Reply to a ping. `your_endpoint` is the source address the ponger
    /// observed, which is how a peer learns its own mapping.
    Pong {
        in_reply_to: Uuid,
        your_endpoint: Endpoint,
    },

    /// Ask for a specific peer's announcement.
    FindPeer { peer_id: PeerId },

    /// Positive reply to `FindPeer`.
    PeerInfo { announcement: PeerAnnouncement },

    /// Fallback reply to `FindPeer`: a sample of peers the responder knows.
    PeerList { announcements: Vec<PeerAnnouncement> },

    /// Push a batch of announcements (at most
    /// `gossip.max_announcements_per_message`).
    Announce { announcements: Vec<PeerAnnouncement> },

    /// Anti-entropy pull: what do you have newer than this?
    WhoHasRecent { since: u64 },

    /// Anti-entropy reply: cache summaries newer than the asked instant.
    IHaveRecent { entries: Vec<GossipSummary> },

    /// Initiator -> coordinator: punch me through to `target`.
    HolePunchRequest {
        attempt_id: Uuid,
        target: PeerId,
        endpoint: Endpoint,
        nat_type: NatType,
    },

    /// Coordinator -> responder: the initiator wants a direct path.
    HolePunchInvite {
        attempt_id: Uuid,
        from_peer_id: PeerId,
        their_endpoint: Endpoint,
        their_nat: NatType,
    },

    /// Responder -> coordinator: acceptance plus the responder's mapping.
    HolePunchAccept {
        attempt_id: Uuid,
        endpoint: Endpoint,
        nat_type: NatType,
    },

    /// Coordinator -> both parties: fire probes at this endpoint.
    HolePunchExecute {
        attempt_id: Uuid,
        target_endpoint: Endpoint,
        simultaneous_send: bool,
    },

    /// Either party -> coordinator, or coordinator -> initiator on refusal.
    HolePunchResult { attempt_id: Uuid, success: bool },

    /// The probe datagrams themselves; an ack probe confirms the path.
    HolePunchProbe { attempt_id: Uuid, ack: bool },

    /// Client -> relay: open a session to `target`.
    RelayRequest { session_id: Uuid, target: PeerId },

    /// Relay -> both ends: session is live under this token. `peer` is the
    /// other end of the pair.
    RelayAccept {
        session_id: Uuid,
        token: u32,
        peer: PeerId,
    },

    /// Relay -> client: refused.
    RelayDeny { session_id: Uuid, reason: String },

    /// Either end or the relay: tear the session down.
    RelayEnd { session_id: Uuid },

    /// In-envelope session data, equivalent to a raw token frame.
    RelayData { token: u32, payload: Vec<u8> },

    /// One-shot: deliver `payload` to `target` as a raw datagram.
    RelayForward { forward_id: Uuid, target: PeerId, payload: Vec<u8> },

    /// Reply to `RelayForward`.
    RelayForwardResult { forward_id: Uuid, success: bool },

    /// Periodic capacity advertisement from relay-capable peers.
    RelayAvailability {
        reachable_peers: Vec<PeerId>,
        available_slots: u32,
    },
}

impl ProtocolMessage {
    /// Encode for the envelope payload. These types always serialize.
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("protocol messages are always serializable")
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(key).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_sig {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn signed_announcement(identity: &NodeIdentity, timestamp: u64) -> PeerAnnouncement {
        let mut announcement = PeerAnnouncement::new(
            identity.peer_id(),
            identity.public_key_bytes(),
            vec![ReachabilityPath::Direct {
                endpoint: Endpoint::new("1.2.3.4:9000").unwrap(),
            }],
            Capabilities::GOSSIP | Capabilities::RELAY,
            timestamp,
            120,
        );
        announcement.sign(identity);
        announcement
    }

    #[test]
    fn test_announcement_signature_verifies() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let announcement = signed_announcement(&identity, 1_000);
        assert!(announcement.verify());
    }

    #[test]
    fn test_announcement_tamper_is_detected() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let mut announcement = signed_announcement(&identity, 1_000);
        announcement.capabilities = Capabilities::GOSSIP;
        assert!(!announcement.verify());
    }

    #[test]
    fn test_announcement_peer_id_must_derive_from_key() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let other = NodeIdentity::from_random(&mut thread_rng());
        let mut announcement = signed_announcement(&identity, 1_000);
        // Re-sign under a different key without fixing the peer id.
        announcement.public_key = other.public_key_bytes();
        announcement.sign(&other);
        assert!(!announcement.verify());
    }

    #[test]
    fn test_announcement_expiry() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let announcement = signed_announcement(&identity, 1_000);
        assert!(!announcement.is_expired(1_000 + 120));
        assert!(announcement.is_expired(1_000 + 121));
    }

    #[test]
    fn test_announcement_serde_roundtrip_preserves_signature() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let announcement = signed_announcement(&identity, 2_000);
        let json = serde_json::to_string(&announcement).unwrap();
        let back: PeerAnnouncement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, announcement);
        assert!(back.verify());
    }

    #[test]
    fn test_gossip_id_changes_with_timestamp() {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        let a = signed_announcement(&identity, 1_000);
        let b = signed_announcement(&identity, 1_001);
        assert_ne!(a.gossip_id(), b.gossip_id());
    }

    #[test]
    fn test_protocol_message_roundtrip() {
        let message = ProtocolMessage::Pong {
            in_reply_to: Uuid::new_v4(),
            your_endpoint: Endpoint::new("1.2.3.4:9000").unwrap(),
        };
        let payload = message.to_payload();
        let back = ProtocolMessage::from_payload(&payload).unwrap();
        match back {
            ProtocolMessage::Pong { your_endpoint, .. } => {
                assert_eq!(your_endpoint.as_str(), "1.2.3.4:9000");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_protocol_message_rejects_garbage() {
        assert!(ProtocolMessage::from_payload(b"not json").is_err());
        assert!(ProtocolMessage::from_payload(b"{\"type\":\"noSuchThing\"}").is_err());
    }
}
