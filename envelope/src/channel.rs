// Copyright (c) 2026 The Omerta Project

//! 16-bit channel tags.
//!
//! On the wire a channel is always the truncated FNV-1a hash of its name;
//! zero is reserved for the built-in mesh protocol (the hash of the empty
//! name). Nodes keep a local `ChannelRegistry` mapping hashes back to names
//! for logging only — the registry never appears in packets.

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LEN: usize = 64;

/// Channel naming errors.
#[derive(Clone, Debug, Display, Eq, Error, PartialEq)]
pub enum ChannelError {
    /// Channel name is empty or contains invalid characters: {0}
    InvalidName(String),
    /// Channel name hashes to the reserved mesh tag: {0}
    ReservedHash(String),
}

/// The 16-bit tag identifying a logical destination within a peer.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct ChannelHash(u16);

impl ChannelHash {
    /// The built-in mesh protocol channel.
    pub const MESH: ChannelHash = ChannelHash(0);

    /// FNV-1a over the name, truncated to 16 bits. The empty name is pinned
    /// to zero so the mesh channel needs no name at all.
    pub fn of(name: &str) -> Self {
        if name.is_empty() {
            return Self::MESH;
        }
        let mut hash = FNV_OFFSET_BASIS;
        for byte in name.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self((hash & 0xffff) as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn is_mesh(&self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for ChannelHash {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Local `hash -> name` map, kept for logging.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    names: HashMap<ChannelHash, String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a name and record its hash.
    pub fn register(&mut self, name: &str) -> Result<ChannelHash, ChannelError> {
        if !is_valid_channel_name(name) {
            return Err(ChannelError::InvalidName(name.to_string()));
        }
        let hash = ChannelHash::of(name);
        if hash.is_mesh() {
            return Err(ChannelError::ReservedHash(name.to_string()));
        }
        self.names.insert(hash, name.to_string());
        Ok(hash)
    }

    pub fn name_of(&self, hash: ChannelHash) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }

    /// Render a hash for logs, preferring the registered name.
    pub fn describe(&self, hash: ChannelHash) -> String {
        match self.name_of(hash) {
            Some(name) => format!("{name} ({hash})"),
            None if hash.is_mesh() => "mesh".to_string(),
            None => hash.to_string(),
        }
    }
}
