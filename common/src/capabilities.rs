// Copyright (c) 2026 The Omerta Project

//! Capabilities advertised in peer announcements.

bitflags::bitflags! {
    /// Services a peer offers to the rest of the network.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct Capabilities: u32 {
        /// Peer participates in announcement gossip
        const GOSSIP = 0b0000_0001;
        /// Peer forwards relay sessions for NAT-bound pairs
        const RELAY = 0b0000_0010;
        /// Peer coordinates hole-punch rendezvous
        const COORDINATOR = 0b0000_0100;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::GOSSIP
    }
}
