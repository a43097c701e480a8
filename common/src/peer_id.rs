// Copyright (c) 2026 The Omerta Project

//! Peer and machine identifier types.
//!
//! A `PeerId` is derived deterministically from a peer's Ed25519 public key,
//! so any verifier holding the key can re-compute the id and reject envelopes
//! whose claimed sender does not match the embedded key. A `MachineId` names
//! one physical host of a peer; a peer may run several machines concurrently,
//! and endpoints are always indexed by the `(PeerId, MachineId)` pair.

use core::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use displaydoc::Display;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Public-key hash bytes kept in a peer id (32 lowercase hex chars).
const PEER_ID_HASH_BYTES: usize = 16;

/// Potential parse errors
#[derive(Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd, thiserror::Error)]
pub enum PeerIdParseError {
    /// Peer id has wrong length or non-hex characters: {0}
    InvalidFormat(String),
    /// Machine id is empty
    EmptyMachineId,
}

/// Unique peer identifier, re-derivable from the peer's public key.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id for an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode(&digest[..PEER_ID_HASH_BYTES]))
    }

    /// True iff this id is the derivation of `public_key`.
    pub fn matches_public_key(&self, public_key: &[u8; 32]) -> bool {
        *self == Self::from_public_key(public_key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(src: &str) -> Result<PeerId, Self::Err> {
        if src.len() != PEER_ID_HASH_BYTES * 2
            || !src.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(PeerIdParseError::InvalidFormat(src.to_string()));
        }
        Ok(Self(src.to_string()))
    }
}

/// Identifier of one physical host of a peer.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Generate a fresh random machine id.
    pub fn from_random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 8];
        rng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = PeerIdParseError;

    fn from_str(src: &str) -> Result<MachineId, Self::Err> {
        if src.is_empty() {
            return Err(PeerIdParseError::EmptyMachineId);
        }
        Ok(Self(src.to_string()))
    }
}
