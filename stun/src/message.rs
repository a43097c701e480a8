// Copyright (c) 2026 The Omerta Project

//! STUN message building and parsing, limited to the binding method.
//!
//! A binding request is a bare 20-byte header. The only attribute the
//! classifier reads back is XOR-MAPPED-ADDRESS; everything else is skipped
//! over by its declared (4-byte padded) length.

use crate::error::{StunError, StunResult};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// RFC 5389 magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request message type.
pub const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type.
pub const BINDING_SUCCESS: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute type.
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const HEADER_LEN: usize = 20;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// The 96-bit transaction id tying a response to its request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Serialize a binding request with no attributes.
pub fn encode_binding_request(transaction_id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut packet = [0u8; HEADER_LEN];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // message length excludes the header and we carry no attributes
    packet[2..4].copy_from_slice(&0u16.to_be_bytes());
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(transaction_id.as_bytes());
    packet
}

/// Parse a binding success response and extract the XOR-MAPPED-ADDRESS.
pub fn parse_binding_response(
    bytes: &[u8],
    transaction_id: &TransactionId,
) -> StunResult<SocketAddr> {
    if bytes.len() < HEADER_LEN {
        return Err(StunError::MalformedResponse);
    }
    let message_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let message_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if message_type != BINDING_SUCCESS || cookie != MAGIC_COOKIE {
        return Err(StunError::MalformedResponse);
    }
    if bytes[8..20] != transaction_id.0 {
        return Err(StunError::TransactionIdMismatch);
    }
    if bytes.len() < HEADER_LEN + message_len {
        return Err(StunError::MalformedResponse);
    }

    let mut attributes = &bytes[HEADER_LEN..HEADER_LEN + message_len];
    while attributes.len() >= 4 {
        let attr_type = u16::from_be_bytes([attributes[0], attributes[1]]);
        let attr_len = u16::from_be_bytes([attributes[2], attributes[3]]) as usize;
        let padded_len = (attr_len + 3) & !3;
        if attributes.len() < 4 + attr_len {
            return Err(StunError::MalformedResponse);
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return decode_xor_mapped_address(&attributes[4..4 + attr_len], transaction_id);
        }
        if attributes.len() < 4 + padded_len {
            break;
        }
        attributes = &attributes[4 + padded_len..];
    }
    Err(StunError::NoMappedAddress)
}

fn decode_xor_mapped_address(
    value: &[u8],
    transaction_id: &TransactionId,
) -> StunResult<SocketAddr> {
    if value.len() < 4 {
        return Err(StunError::MalformedResponse);
    }
    let family = value[1];
    let xor_port = u16::from_be_bytes([value[2], value[3]]);
    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        FAMILY_IPV4 => {
            if value.len() < 8 {
                return Err(StunError::MalformedResponse);
            }
            let xor_addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let addr = Ipv4Addr::from(xor_addr ^ MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(addr), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::MalformedResponse);
            }
            // IPv6 addresses are XORed with cookie || transaction id
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id.as_bytes());
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::MalformedResponse),
    }
}

/// Serialize a binding success response carrying one XOR-MAPPED-ADDRESS.
/// The classifier never sends these; test harnesses acting as a STUN server do.
pub fn encode_binding_response(
    transaction_id: &TransactionId,
    mapped: SocketAddr,
) -> Vec<u8> {
    let (family, addr_bytes): (u8, Vec<u8>) = match mapped.ip() {
        IpAddr::V4(v4) => {
            let xored = u32::from(v4) ^ MAGIC_COOKIE;
            (FAMILY_IPV4, xored.to_be_bytes().to_vec())
        }
        IpAddr::V6(v6) => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id.as_bytes());
            let bytes = v6
                .octets()
                .iter()
                .zip(mask.iter())
                .map(|(a, m)| a ^ m)
                .collect();
            (FAMILY_IPV6, bytes)
        }
    };
    let xor_port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let attr_len = 4 + addr_bytes.len();

    let mut packet = Vec::with_capacity(HEADER_LEN + 4 + attr_len);
    packet.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    packet.extend_from_slice(&((4 + attr_len) as u16).to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id.as_bytes());
    packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    packet.extend_from_slice(&(attr_len as u16).to_be_bytes());
    packet.push(0); // reserved
    packet.push(family);
    packet.extend_from_slice(&xor_port.to_be_bytes());
    packet.extend_from_slice(&addr_bytes);
    packet
}
