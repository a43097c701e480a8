// Copyright (c) 2026 The Omerta Project

//! Envelope codec error types.
//!
//! Decode errors are ordered: a decoder reports the first failure it hits
//! while walking the packet front to back, so callers can count rejection
//! causes without ambiguity.

use displaydoc::Display;
use thiserror::Error;

/// Errors from envelope encoding and decoding.
#[derive(Clone, Debug, Display, Eq, Error, PartialEq)]
pub enum EnvelopeError {
    /// Packet does not start with the protocol magic
    InvalidMagic,

    /// Unsupported envelope version: {0}
    UnsupportedVersion(u8),

    /// Packet is shorter than its declared layout
    TruncatedPacket,

    /// Header authentication tag mismatch
    HeaderTagMismatch,

    /// Envelope belongs to a different network
    NetworkMismatch,

    /// Payload authentication tag mismatch
    PayloadTagMismatch,

    /// Decrypted header is malformed
    MalformedHeader,

    /// Field {0} exceeds its length prefix
    FieldTooLong(&'static str),
}

/// Result type for codec operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
