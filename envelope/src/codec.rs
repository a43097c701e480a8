// Copyright (c) 2026 The Omerta Project

//! Wire framing: two AEAD layers under one magic/version prefix.
//!
//! ```text
//! offset            bytes  field
//! 0                 4      magic "OMRT"
//! 4                 1      version 0x02
//! 5                 12     header nonce (random per packet)
//! 17                2      header ciphertext length L_h (BE)
//! 19                L_h    header ciphertext
//! 19+L_h            8      truncated Poly1305 tag over the header
//! 27+L_h            4      payload ciphertext length L_p (BE)
//! 31+L_h            L_p    payload ciphertext
//! 31+L_h+L_p        16     Poly1305 tag over the payload
//! ```
//!
//! The header layer is the raw RFC 8439 construction (ChaCha20 keystream,
//! Poly1305 over the ciphertext) because the AEAD API cannot verify a
//! truncated tag. The payload layer is the standard ChaCha20-Poly1305 AEAD
//! under the sibling key, with the header nonce's last byte flipped so the
//! two layers never share keystream. Decoding walks the packet front to back
//! and reports the first failure; everything up to the network-hash check
//! runs without touching payload plaintext.

use crate::{
    envelope::Envelope,
    error::{EnvelopeError, EnvelopeResult},
    keys::NetworkKey,
};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use poly1305::{
    universal_hash::{KeyInit as MacKeyInit, UniversalHash},
    Poly1305,
};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Protocol magic, first on the wire.
pub const MAGIC: [u8; 4] = *b"OMRT";

/// Envelope format version.
pub const VERSION: u8 = 0x02;

const NONCE_LEN: usize = 12;
const HEADER_TAG_LEN: usize = 8;
const PAYLOAD_TAG_LEN: usize = 16;

// magic + version + nonce + L_h + header tag + L_p + payload tag
const MIN_PACKET_LEN: usize = 4 + 1 + NONCE_LEN + 2 + HEADER_TAG_LEN + 4 + PAYLOAD_TAG_LEN;

/// Stateless encoder/decoder bound to one network key.
pub struct EnvelopeCodec {
    header_key: [u8; 32],
    payload_key: [u8; 32],
    network_hash: [u8; 8],
}

impl EnvelopeCodec {
    pub fn new(network_key: &NetworkKey) -> Self {
        Self {
            header_key: network_key.header_key(),
            payload_key: network_key.payload_key(),
            network_hash: network_key.network_hash(),
        }
    }

    /// Encode with a fresh random header nonce.
    pub fn encode(&self, envelope: &Envelope) -> EnvelopeResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.encode_with_nonce(envelope, nonce)
    }

    /// Encode with a caller-supplied header nonce. Deterministic: the same
    /// envelope and nonce always produce the same bytes.
    pub fn encode_with_nonce(
        &self,
        envelope: &Envelope,
        header_nonce: [u8; NONCE_LEN],
    ) -> EnvelopeResult<Vec<u8>> {
        let header_plain = envelope.write_header(&self.network_hash)?;
        if header_plain.len() > u16::MAX as usize {
            return Err(EnvelopeError::FieldTooLong("header"));
        }
        let (header_ct, header_tag) = seal_header(&self.header_key, &header_nonce, &header_plain);

        let payload_nonce = payload_nonce(&header_nonce);
        let cipher = ChaCha20Poly1305::new((&self.payload_key).into());
        // encrypt() appends the 16-byte tag to the ciphertext
        let sealed_payload = cipher
            .encrypt((&payload_nonce).into(), envelope.payload.as_slice())
            .map_err(|_| EnvelopeError::FieldTooLong("payload"))?;
        let payload_ct_len = sealed_payload.len() - PAYLOAD_TAG_LEN;

        let mut packet = Vec::with_capacity(MIN_PACKET_LEN + header_ct.len() + payload_ct_len);
        packet.extend_from_slice(&MAGIC);
        packet.push(VERSION);
        packet.extend_from_slice(&header_nonce);
        packet.extend_from_slice(&(header_ct.len() as u16).to_be_bytes());
        packet.extend_from_slice(&header_ct);
        packet.extend_from_slice(&header_tag);
        packet.extend_from_slice(&(payload_ct_len as u32).to_be_bytes());
        packet.extend_from_slice(&sealed_payload);
        Ok(packet)
    }

    /// Decode a datagram. Failures are reported in wire order: magic,
    /// version, truncation, header tag, network hash, payload tag.
    pub fn decode(&self, bytes: &[u8]) -> EnvelopeResult<Envelope> {
        if bytes.len() < 4 || bytes[..4] != MAGIC {
            return Err(EnvelopeError::InvalidMagic);
        }
        if bytes.len() < 5 {
            return Err(EnvelopeError::TruncatedPacket);
        }
        if bytes[4] != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(bytes[4]));
        }
        if bytes.len() < MIN_PACKET_LEN {
            return Err(EnvelopeError::TruncatedPacket);
        }

        let mut header_nonce = [0u8; NONCE_LEN];
        header_nonce.copy_from_slice(&bytes[5..5 + NONCE_LEN]);

        let header_len = u16::from_be_bytes([bytes[17], bytes[18]]) as usize;
        let header_ct_start = 19;
        let header_tag_start = header_ct_start + header_len;
        let payload_len_start = header_tag_start + HEADER_TAG_LEN;
        let payload_ct_start = payload_len_start + 4;
        if bytes.len() < payload_ct_start {
            return Err(EnvelopeError::TruncatedPacket);
        }

        let payload_len = u32::from_be_bytes([
            bytes[payload_len_start],
            bytes[payload_len_start + 1],
            bytes[payload_len_start + 2],
            bytes[payload_len_start + 3],
        ]) as usize;
        // One datagram is exactly one envelope; trailing bytes are as bad as
        // missing ones.
        if bytes.len() != payload_ct_start + payload_len + PAYLOAD_TAG_LEN {
            return Err(EnvelopeError::TruncatedPacket);
        }

        let header_ct = &bytes[header_ct_start..header_tag_start];
        let header_tag = &bytes[header_tag_start..payload_len_start];
        let header_plain = open_header(&self.header_key, &header_nonce, header_ct, header_tag)?;

        if header_plain.len() < 8 {
            return Err(EnvelopeError::MalformedHeader);
        }
        if header_plain[..8] != self.network_hash {
            return Err(EnvelopeError::NetworkMismatch);
        }

        let payload_nonce = payload_nonce(&header_nonce);
        let cipher = ChaCha20Poly1305::new((&self.payload_key).into());
        let sealed_payload = &bytes[payload_ct_start..];
        let payload = cipher
            .decrypt((&payload_nonce).into(), sealed_payload)
            .map_err(|_| EnvelopeError::PayloadTagMismatch)?;

        Envelope::from_header(&header_plain, payload).map(|(envelope, _)| envelope)
    }
}

impl Drop for EnvelopeCodec {
    fn drop(&mut self) {
        self.header_key.zeroize();
        self.payload_key.zeroize();
    }
}

/// Payload nonce: header nonce XOR 0x00..01 — a distinct stream with no
/// shared suffix.
fn payload_nonce(header_nonce: &[u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = *header_nonce;
    nonce[NONCE_LEN - 1] ^= 0x01;
    nonce
}

fn seal_header(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; HEADER_TAG_LEN]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    let mut mac_key_block = [0u8; 64];
    cipher.apply_keystream(&mut mac_key_block);
    let mut ciphertext = plaintext.to_vec();
    cipher.apply_keystream(&mut ciphertext);
    let tag = header_tag(&mac_key_block[..32], &ciphertext);
    mac_key_block.zeroize();
    let mut truncated = [0u8; HEADER_TAG_LEN];
    truncated.copy_from_slice(&tag[..HEADER_TAG_LEN]);
    (ciphertext, truncated)
}

fn open_header(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8],
) -> EnvelopeResult<Vec<u8>> {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    let mut mac_key_block = [0u8; 64];
    cipher.apply_keystream(&mut mac_key_block);
    let expected = header_tag(&mac_key_block[..32], ciphertext);
    mac_key_block.zeroize();
    if expected[..HEADER_TAG_LEN].ct_eq(tag).unwrap_u8() != 1 {
        return Err(EnvelopeError::HeaderTagMismatch);
    }
    let mut plaintext = ciphertext.to_vec();
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// RFC 8439 Poly1305 over the ciphertext with no associated data: padded
/// ciphertext, then the `len(aad)=0 || len(ct)` block.
fn header_tag(mac_key: &[u8], ciphertext: &[u8]) -> [u8; 16] {
    let mut mac = <Poly1305 as MacKeyInit>::new(poly1305::Key::from_slice(mac_key));
    mac.update_padded(ciphertext);
    let mut lengths = [0u8; 16];
    lengths[8..].copy_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    mac.update_padded(&lengths);
    mac.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHash;
    use assert_matches::assert_matches;
    use om_common::NodeIdentity;
    use rand::thread_rng;

    fn codec_pair() -> (EnvelopeCodec, EnvelopeCodec) {
        (
            EnvelopeCodec::new(&NetworkKey::from_bytes([0x11; 32])),
            EnvelopeCodec::new(&NetworkKey::from_bytes([0x22; 32])),
        )
    }

    fn signed_envelope(payload: &[u8]) -> Envelope {
        let identity = NodeIdentity::from_random(&mut thread_rng());
        Envelope::new_signed(
            &identity,
            "machine-a".parse().unwrap(),
            None,
            ChannelHash::of("chat"),
            payload.to_vec(),
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"round trip");
        let packet = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&packet).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.signature_is_valid());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"");
        let packet = codec.encode(&envelope).unwrap();
        assert_eq!(codec.decode(&packet).unwrap(), envelope);
    }

    #[test]
    fn test_encode_is_deterministic_under_fixed_nonce() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"fixed");
        let a = codec.encode_with_nonce(&envelope, [7u8; 12]).unwrap();
        let b = codec.encode_with_nonce(&envelope, [7u8; 12]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_nonce_varies_packets() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"vary");
        let a = codec.encode(&envelope).unwrap();
        let b = codec.encode(&envelope).unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decode(&a).unwrap(), codec.decode(&b).unwrap());
    }

    #[test]
    fn test_cross_network_rejection() {
        let (k1, k2) = codec_pair();
        let envelope = signed_envelope(b"secret");
        let packet = k1.encode(&envelope).unwrap();
        // The header tag is keyed from the network key, so a foreign decoder
        // fails authentication before it can even read the network hash.
        assert_matches!(
            k2.decode(&packet).unwrap_err(),
            EnvelopeError::HeaderTagMismatch | EnvelopeError::NetworkMismatch
        );
    }

    #[test]
    fn test_invalid_magic_is_cheap() {
        let (codec, _) = codec_pair();
        assert_eq!(codec.decode(b"").unwrap_err(), EnvelopeError::InvalidMagic);
        assert_eq!(
            codec.decode(b"XXXX").unwrap_err(),
            EnvelopeError::InvalidMagic
        );
        let mut blob = [0u8; 256];
        rand::thread_rng().fill_bytes(&mut blob);
        blob[0] = b'X';
        assert_eq!(codec.decode(&blob).unwrap_err(), EnvelopeError::InvalidMagic);
    }

    #[test]
    fn test_unsupported_version() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"v");
        let mut packet = codec.encode(&envelope).unwrap();
        packet[4] = 0x01;
        assert_eq!(
            codec.decode(&packet).unwrap_err(),
            EnvelopeError::UnsupportedVersion(0x01)
        );
    }

    #[test]
    fn test_truncated_packet() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"cut me");
        let packet = codec.encode(&envelope).unwrap();
        for cut in [5, 17, 20, packet.len() - 1] {
            assert_eq!(
                codec.decode(&packet[..cut]).unwrap_err(),
                EnvelopeError::TruncatedPacket,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"exact");
        let mut packet = codec.encode(&envelope).unwrap();
        packet.push(0);
        assert_eq!(
            codec.decode(&packet).unwrap_err(),
            EnvelopeError::TruncatedPacket
        );
    }

    #[test]
    fn test_header_tamper_detected() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"tamper");
        let mut packet = codec.encode(&envelope).unwrap();
        packet[21] ^= 0x01; // inside header ciphertext
        assert_eq!(
            codec.decode(&packet).unwrap_err(),
            EnvelopeError::HeaderTagMismatch
        );
    }

    #[test]
    fn test_payload_tamper_detected() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"tamper payload");
        let mut packet = codec.encode(&envelope).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01; // inside the payload tag
        assert_eq!(
            codec.decode(&packet).unwrap_err(),
            EnvelopeError::PayloadTagMismatch
        );
    }

    #[test]
    fn test_every_bit_flip_after_prefix_fails() {
        let (codec, _) = codec_pair();
        let envelope = signed_envelope(b"bitflip");
        let packet = codec.encode(&envelope).unwrap();
        // Flipping the nonce changes both keystreams; flipping anything else
        // breaks a tag, a length, or the signature.
        for offset in 5..packet.len() {
            let mut corrupted = packet.clone();
            corrupted[offset] ^= 0x01;
            let survives_codec = match codec.decode(&corrupted) {
                Err(_) => false,
                Ok(decoded) => decoded.signature_is_valid() && decoded == envelope,
            };
            assert!(!survives_codec, "bit flip at offset {offset} went unnoticed");
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // decode(encode(E, K), K) == E for arbitrary payloads and keys
            #[test]
            fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048),
                              key in any::<[u8; 32]>()) {
                let codec = EnvelopeCodec::new(&NetworkKey::from_bytes(key));
                let envelope = signed_envelope(&payload);
                let packet = codec.encode(&envelope).unwrap();
                prop_assert_eq!(codec.decode(&packet).unwrap(), envelope);
            }

            // distinct keys never decode each other's packets
            #[test]
            fn prop_network_isolation(k1 in any::<[u8; 32]>(), k2 in any::<[u8; 32]>()) {
                prop_assume!(k1 != k2);
                let c1 = EnvelopeCodec::new(&NetworkKey::from_bytes(k1));
                let c2 = EnvelopeCodec::new(&NetworkKey::from_bytes(k2));
                let packet = c1.encode(&signed_envelope(b"isolated")).unwrap();
                prop_assert!(matches!(
                    c2.decode(&packet),
                    Err(EnvelopeError::HeaderTagMismatch) | Err(EnvelopeError::NetworkMismatch)
                ));
            }

            // random blobs are rejected before any AEAD work
            #[test]
            fn prop_fast_rejection(blob in proptest::collection::vec(any::<u8>(), 0..256)) {
                let codec = EnvelopeCodec::new(&NetworkKey::from_bytes([0x55; 32]));
                prop_assume!(blob.len() < 4 || blob[..4] != MAGIC || blob.get(4) != Some(&VERSION));
                prop_assert!(matches!(
                    codec.decode(&blob),
                    Err(EnvelopeError::InvalidMagic)
                        | Err(EnvelopeError::UnsupportedVersion(_))
                        | Err(EnvelopeError::TruncatedPacket)
                ));
            }

            // flipping any single bit after the prefix makes decode fail or
            // leaves an envelope whose signature no longer verifies
            #[test]
            fn prop_tamper_detection(offset_seed in any::<prop::sample::Index>(),
                                     bit in 0u8..8) {
                let codec = EnvelopeCodec::new(&NetworkKey::from_bytes([0x66; 32]));
                let envelope = signed_envelope(b"property tamper");
                let packet = codec.encode(&envelope).unwrap();
                let offset = 5 + offset_seed.index(packet.len() - 5);
                let mut corrupted = packet;
                corrupted[offset] ^= 1 << bit;
                let intact = match codec.decode(&corrupted) {
                    Err(_) => false,
                    Ok(decoded) => decoded == envelope,
                };
                prop_assert!(!intact);
            }
        }
    }
}
