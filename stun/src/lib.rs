// Copyright (c) 2026 The Omerta Project

//! NAT classification via STUN (RFC 5389, binding requests only).
//!
//! The classifier binds one UDP socket, asks two STUN servers with distinct
//! external IPs what mapping they observe for it, and compares the answers.
//! Identical mappings yield the most conservative cone verdict achievable
//! without hairpin probing; differing mappings mean the NAT allocates per
//! destination and is symmetric.

pub mod classifier;
pub mod error;
pub mod message;

pub use classifier::{Classification, NatClassifier, StunConfig};
pub use error::StunError;
