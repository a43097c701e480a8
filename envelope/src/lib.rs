// Copyright (c) 2026 The Omerta Project

//! The Omerta wire format: one datagram is one authenticated envelope.
//!
//! Every envelope is tied to a specific network by a 32-byte shared key. The
//! framing uses two ChaCha20-Poly1305 layers derived from that key: a header
//! layer whose tag is truncated to eight bytes (enough to reject foreign or
//! corrupted traffic cheaply) and a payload layer with the full sixteen-byte
//! tag. Routing fields live in the header so forwarders never touch payload
//! plaintext.

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod keys;

pub use channel::{ChannelError, ChannelHash, ChannelRegistry};
pub use codec::EnvelopeCodec;
pub use envelope::Envelope;
pub use error::EnvelopeError;
pub use keys::NetworkKey;
