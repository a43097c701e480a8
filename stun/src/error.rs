// Copyright (c) 2026 The Omerta Project

//! STUN client error types.

use displaydoc::Display;
use thiserror::Error;

/// Errors from the STUN client and NAT classifier.
#[derive(Debug, Display, Error)]
pub enum StunError {
    /// No response from {server} within {timeout_ms}ms
    Timeout { server: String, timeout_ms: u64 },

    /// Could not bind the probe socket: {0}
    BindFailed(#[source] std::io::Error),

    /// Probe socket I/O failed: {0}
    Io(#[source] std::io::Error),

    /// Response carried no XOR-MAPPED-ADDRESS attribute
    NoMappedAddress,

    /// Response transaction id does not match the request
    TransactionIdMismatch,

    /// Response is not a well-formed STUN binding success
    MalformedResponse,

    /// Classification needs at least two servers, {available} configured
    InsufficientServers { available: usize },

    /// Server address {0} did not resolve
    ServerUnresolvable(String),
}

/// Result type for STUN operations.
pub type StunResult<T> = Result<T, StunError>;
