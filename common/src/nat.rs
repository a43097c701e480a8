// Copyright (c) 2026 The Omerta Project

//! NAT classification and reachability paths.

use crate::{Endpoint, PeerId};
use serde::{Deserialize, Serialize};

/// NAT behavior class of a node, as observed by the STUN classifier.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NatType {
    /// Directly reachable, no translation observed.
    Public,
    /// Mapping is stable and any remote host may use it.
    FullCone,
    /// Mapping is stable but only previously-contacted hosts may use it.
    RestrictedCone,
    /// Mapping is stable but only previously-contacted host:port pairs may use it.
    PortRestrictedCone,
    /// A fresh mapping is allocated per destination.
    Symmetric,
    /// Classification has not run or could not complete.
    #[default]
    Unknown,
}

impl NatType {
    /// True for NAT classes that coordinated simultaneous probes can open.
    pub fn is_hole_punchable(&self) -> bool {
        matches!(
            self,
            NatType::Public
                | NatType::FullCone
                | NatType::RestrictedCone
                | NatType::PortRestrictedCone
        )
    }

    /// True for NAT classes that can accept unsolicited relay traffic.
    pub fn can_relay(&self) -> bool {
        matches!(self, NatType::Public | NatType::FullCone)
    }
}

/// One way of reaching a peer's machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReachabilityPath {
    /// A directly routable endpoint.
    Direct { endpoint: Endpoint },
    /// Forwarding through a relay peer.
    Relay {
        relay_peer_id: PeerId,
        relay_endpoint: Endpoint,
    },
    /// A NAT mapping that must be re-opened by coordinated probing.
    HolePunch { public_ip: String, local_port: u16 },
}
