// Copyright (c) 2026 The Omerta Project

//! Network key material and the envelope key schedule.
//!
//! Joining a network means possessing its 32-byte key. Two independent AEAD
//! keys are expanded from it with domain-separated HKDF info strings, so the
//! header and payload layers share no keystream. The first eight bytes of
//! SHA-256 over the raw key identify the network inside the encrypted header.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string for the header layer key.
pub const HEADER_KEY_INFO: &[u8] = b"omerta-header-v2";

/// HKDF info string for the payload layer key.
pub const PAYLOAD_KEY_INFO: &[u8] = b"omerta-payload-v2";

/// The 32-byte symmetric key shared by all members of one mesh network.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKey([u8; 32]);

impl NetworkKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random network key.
    pub fn from_random<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// First eight bytes of SHA-256 over the raw key.
    pub fn network_hash(&self) -> [u8; 8] {
        let digest = Sha256::digest(self.0);
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&digest[..8]);
        hash
    }

    /// Expand the header-layer AEAD key.
    pub fn header_key(&self) -> [u8; 32] {
        self.expand(HEADER_KEY_INFO)
    }

    /// Expand the payload-layer AEAD key.
    pub fn payload_key(&self) -> [u8; 32] {
        self.expand(PAYLOAD_KEY_INFO)
    }

    fn expand(&self, info: &[u8]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; 32];
        hk.expand(info, &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

impl core::fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // Never log key material; the network hash is enough to tell keys apart.
        write!(f, "NetworkKey({})", hex::encode(self.network_hash()))
    }
}
