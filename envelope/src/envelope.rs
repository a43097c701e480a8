// Copyright (c) 2026 The Omerta Project

//! The decoded envelope and its deterministic header encoding.
//!
//! Header fields are concatenated in a fixed order with one-byte length
//! prefixes on the variable-length identifiers. The Ed25519 signature covers
//! the same concatenation minus the network hash (a framing field derived
//! from the network key, already authenticated by both AEAD tags) and minus
//! the hop count, which forwarders increment in flight without re-signing.

use crate::{
    channel::ChannelHash,
    error::{EnvelopeError, EnvelopeResult},
};
use om_common::{identity::verify_signature, time, MachineId, NodeIdentity, PeerId};
use uuid::Uuid;

const FLAG_HAS_TO_PEER_ID: u8 = 0b0000_0001;

/// One authenticated datagram, decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub message_id: Uuid,
    pub from_peer_id: PeerId,
    pub public_key: [u8; 32],
    pub machine_id: MachineId,
    pub to_peer_id: Option<PeerId>,
    pub channel: ChannelHash,
    pub hop_count: u8,
    pub timestamp_millis: u64,
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

impl Envelope {
    /// Build and sign an envelope originating at this node.
    pub fn new_signed(
        identity: &NodeIdentity,
        machine_id: MachineId,
        to_peer_id: Option<PeerId>,
        channel: ChannelHash,
        payload: Vec<u8>,
    ) -> Self {
        let mut envelope = Self {
            message_id: Uuid::new_v4(),
            from_peer_id: identity.peer_id(),
            public_key: identity.public_key_bytes(),
            machine_id,
            to_peer_id,
            channel,
            hop_count: 0,
            timestamp_millis: time::now_millis(),
            payload,
            signature: [0u8; 64],
        };
        envelope.signature = identity.sign(&envelope.signing_bytes());
        envelope
    }

    /// The canonical signing preimage: every field except the signature
    /// itself and the mutable hop count.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128 + self.payload.len());
        let mut flags = 0u8;
        if self.to_peer_id.is_some() {
            flags |= FLAG_HAS_TO_PEER_ID;
        }
        bytes.push(flags);
        push_prefixed_infallible(&mut bytes, self.from_peer_id.as_str());
        if let Some(to) = &self.to_peer_id {
            push_prefixed_infallible(&mut bytes, to.as_str());
        }
        bytes.extend_from_slice(&self.channel.as_u16().to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        bytes.extend_from_slice(self.message_id.as_bytes());
        push_prefixed_infallible(&mut bytes, self.machine_id.as_str());
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// True iff the claimed sender id is the derivation of the embedded key.
    pub fn peer_id_is_derived(&self) -> bool {
        self.from_peer_id.matches_public_key(&self.public_key)
    }

    /// Verify the signature against the embedded public key. Callers must
    /// check `peer_id_is_derived` first; a valid signature under a key that
    /// does not derive the claimed id proves nothing about the sender.
    pub fn signature_is_valid(&self) -> bool {
        verify_signature(&self.public_key, &self.signing_bytes(), &self.signature)
    }

    /// Serialize the header plaintext, leading with the network hash.
    pub(crate) fn write_header(&self, network_hash: &[u8; 8]) -> EnvelopeResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(160);
        bytes.extend_from_slice(network_hash);
        let mut flags = 0u8;
        if self.to_peer_id.is_some() {
            flags |= FLAG_HAS_TO_PEER_ID;
        }
        bytes.push(flags);
        push_prefixed(&mut bytes, self.from_peer_id.as_str(), "fromPeerId")?;
        if let Some(to) = &self.to_peer_id {
            push_prefixed(&mut bytes, to.as_str(), "toPeerId")?;
        }
        bytes.extend_from_slice(&self.channel.as_u16().to_be_bytes());
        bytes.push(self.hop_count);
        bytes.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        bytes.extend_from_slice(self.message_id.as_bytes());
        push_prefixed(&mut bytes, self.machine_id.as_str(), "machineId")?;
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&self.signature);
        Ok(bytes)
    }

    /// Parse a decrypted header, attaching the already-decrypted payload.
    /// Returns the envelope and the embedded network hash.
    pub(crate) fn from_header(header: &[u8], payload: Vec<u8>) -> EnvelopeResult<(Self, [u8; 8])> {
        let mut reader = HeaderReader::new(header);
        let network_hash: [u8; 8] = reader
            .take(8)?
            .try_into()
            .map_err(|_| EnvelopeError::MalformedHeader)?;
        let flags = reader.take_u8()?;
        let from_peer_id = reader.take_peer_id()?;
        let to_peer_id = if flags & FLAG_HAS_TO_PEER_ID != 0 {
            Some(reader.take_peer_id()?)
        } else {
            None
        };
        let channel = ChannelHash::from_raw(reader.take_u16()?);
        let hop_count = reader.take_u8()?;
        let timestamp_millis = reader.take_u64()?;
        let message_id = Uuid::from_slice(reader.take(16)?)
            .map_err(|_| EnvelopeError::MalformedHeader)?;
        let machine_id = reader
            .take_prefixed()?
            .parse::<MachineId>()
            .map_err(|_| EnvelopeError::MalformedHeader)?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(reader.take(32)?);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(reader.take(64)?);
        reader.expect_empty()?;

        Ok((
            Self {
                message_id,
                from_peer_id,
                public_key,
                machine_id,
                to_peer_id,
                channel,
                hop_count,
                timestamp_millis,
                payload,
                signature,
            },
            network_hash,
        ))
    }
}

fn push_prefixed(bytes: &mut Vec<u8>, value: &str, field: &'static str) -> EnvelopeResult<()> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(EnvelopeError::FieldTooLong(field));
    }
    bytes.push(len as u8);
    bytes.extend_from_slice(value.as_bytes());
    Ok(())
}

// Signing preimages reuse the prefixed form; identifiers longer than a prefix
// are caught by `write_header` before any signature leaves the node.
fn push_prefixed_infallible(bytes: &mut Vec<u8>, value: &str) {
    bytes.push(value.len().min(u8::MAX as usize) as u8);
    bytes.extend_from_slice(value.as_bytes());
}

struct HeaderReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> EnvelopeResult<&'a [u8]> {
        if self.offset + n > self.bytes.len() {
            return Err(EnvelopeError::MalformedHeader);
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> EnvelopeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> EnvelopeResult<u16> {
        let slice = self.take(2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    fn take_u64(&mut self) -> EnvelopeResult<u64> {
        let slice = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Ok(u64::from_be_bytes(buf))
    }

    fn take_prefixed(&mut self) -> EnvelopeResult<&'a str> {
        let len = self.take_u8()? as usize;
        let slice = self.take(len)?;
        core::str::from_utf8(slice).map_err(|_| EnvelopeError::MalformedHeader)
    }

    fn take_peer_id(&mut self) -> EnvelopeResult<PeerId> {
        self.take_prefixed()?
            .parse::<PeerId>()
            .map_err(|_| EnvelopeError::MalformedHeader)
    }

    fn expect_empty(&self) -> EnvelopeResult<()> {
        if self.offset == self.bytes.len() {
            Ok(())
        } else {
            Err(EnvelopeError::MalformedHeader)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn test_envelope(to: Option<PeerId>) -> Envelope {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        Envelope::new_signed(
            &identity,
            "machine-1".parse().unwrap(),
            to,
            ChannelHash::of("chat"),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn test_header_roundtrip_without_recipient() {
        let envelope = test_envelope(None);
        let header = envelope.write_header(&[0xAA; 8]).unwrap();
        let (parsed, hash) = Envelope::from_header(&header, envelope.payload.clone()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(hash, [0xAA; 8]);
    }

    #[test]
    fn test_header_roundtrip_with_recipient() {
        let to = PeerId::from_public_key(&[9u8; 32]);
        let envelope = test_envelope(Some(to));
        let header = envelope.write_header(&[1u8; 8]).unwrap();
        let (parsed, _) = Envelope::from_header(&header, envelope.payload.clone()).unwrap();
        assert_eq!(parsed.to_peer_id, envelope.to_peer_id);
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_new_signed_verifies() {
        let envelope = test_envelope(None);
        assert!(envelope.peer_id_is_derived());
        assert!(envelope.signature_is_valid());
    }

    #[test]
    fn test_signature_excludes_hop_count() {
        let mut envelope = test_envelope(None);
        envelope.hop_count = 7;
        assert!(envelope.signature_is_valid());
    }

    #[test]
    fn test_signature_covers_payload() {
        let mut envelope = test_envelope(None);
        envelope.payload = b"tampered".to_vec();
        assert!(!envelope.signature_is_valid());
    }

    #[test]
    fn test_foreign_key_does_not_derive_peer_id() {
        let mut envelope = test_envelope(None);
        envelope.public_key = [0u8; 32];
        assert!(!envelope.peer_id_is_derived());
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let envelope = test_envelope(None);
        let header = envelope.write_header(&[0u8; 8]).unwrap();
        for cut in [0, 8, 9, header.len() - 1] {
            assert_eq!(
                Envelope::from_header(&header[..cut], Vec::new()).unwrap_err(),
                EnvelopeError::MalformedHeader,
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let envelope = test_envelope(None);
        let mut header = envelope.write_header(&[0u8; 8]).unwrap();
        header.push(0);
        assert_eq!(
            Envelope::from_header(&header, Vec::new()).unwrap_err(),
            EnvelopeError::MalformedHeader,
        );
    }

    #[test]
    fn test_overlong_machine_id_fails_encode() {
        let machine = "m".repeat(300).parse::<MachineId>().unwrap();
        let envelope = Envelope {
            machine_id: machine,
            ..test_envelope(None)
        };
        assert_eq!(
            envelope.write_header(&[0u8; 8]).unwrap_err(),
            EnvelopeError::FieldTooLong("machineId"),
        );
    }
}
