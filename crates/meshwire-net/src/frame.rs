//! Frame coder — encrypts and authenticates session traffic.
//!
//! ```text
//! +-------------------+------------+----------------------+-----------+
//! | header ciphertext | header MAC | body ciphertext      | frame MAC |
//! | 16 bytes          | 16 bytes   | padded to 16 bytes   | 16 bytes  |
//! +-------------------+------------+----------------------+-----------+
//! ```
//!
//! Each direction runs one AES-256-CTR keystream across headers and bodies
//! and one running Keccak-256 MAC chain. Frames must therefore be decoded
//! in the order they were encoded; a MAC computed against any other chain
//! state fails verification.
//!
//! The plaintext body is a big-endian u16 message id followed by the
//! payload.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshwire_core::wire::{
    padded_len, FrameHeader, WireError, FRAME_HEADER_SIZE, FRAME_MAC_SIZE, MAX_FRAME_SIZE,
};
use sha3::{Digest, Keccak256};
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::{AsBytes, FromBytes};

use crate::handshake::Secrets;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Largest payload a single frame carries: the body also holds the u16 id.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - 2;

/// Most the decoder grows its buffer by while waiting for a body.
const RESERVE_STEP: usize = 64 * 1024;

/// Plaintext frame: capability hint plus `[message id (u16 BE) | payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub capability_hint: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(capability_hint: u16, message_id: u16, payload: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(2 + payload.len());
        body.put_u16(message_id);
        body.put_slice(payload);
        Self {
            capability_hint,
            body: body.freeze(),
        }
    }

    /// `None` when the body is too short to carry an id.
    pub fn message_id(&self) -> Option<u16> {
        (self.body.len() >= 2).then(|| u16::from_be_bytes([self.body[0], self.body[1]]))
    }

    pub fn payload(&self) -> Bytes {
        if self.body.len() < 2 {
            return Bytes::new();
        }
        self.body.slice(2..)
    }
}

// ── MAC chain ─────────────────────────────────────────────────────────────────

struct MacChain {
    mac: Keccak256,
    block: Aes256,
}

impl MacChain {
    fn new(mac: Keccak256, mac_secret: &[u8; 32]) -> Self {
        Self {
            mac,
            block: Aes256::new(GenericArray::from_slice(mac_secret)),
        }
    }

    fn digest16(&self) -> [u8; 16] {
        let full = self.mac.clone().finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        out
    }

    fn mix(&mut self, seed: &[u8; 16]) {
        let mut enc = self.digest16();
        self.block.encrypt_block(GenericArray::from_mut_slice(&mut enc[..]));
        for (e, s) in enc.iter_mut().zip(seed) {
            *e ^= s;
        }
        self.mac.update(enc);
    }

    fn header(&mut self, header_ct: &[u8; 16]) -> [u8; 16] {
        self.mix(header_ct);
        self.digest16()
    }

    fn body(&mut self, body_ct: &[u8]) -> [u8; 16] {
        self.mac.update(body_ct);
        let seed = self.digest16();
        self.mix(&seed);
        self.digest16()
    }
}

fn mac_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Split session secrets into the two coder halves.
pub fn split(secrets: Secrets) -> (EgressCoder, IngressCoder) {
    let Secrets {
        aes_secret,
        mac_secret,
        egress_mac,
        ingress_mac,
        ..
    } = secrets;
    let key = GenericArray::from_slice(&aes_secret[..]);
    let iv = GenericArray::from_slice(&[0u8; 16]);
    let egress = EgressCoder {
        cipher: Aes256Ctr::new(key, iv),
        mac: MacChain::new(egress_mac, &mac_secret),
    };
    let ingress = IngressCoder {
        cipher: Aes256Ctr::new(key, iv),
        mac: MacChain::new(ingress_mac, &mac_secret),
        pending: None,
    };
    (egress, ingress)
}

// ── Egress ────────────────────────────────────────────────────────────────────

pub struct EgressCoder {
    cipher: Aes256Ctr,
    mac: MacChain,
}

impl Encoder<Frame> for EgressCoder {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = frame.body.len();
        let header = FrameHeader::new(size, frame.capability_hint)?;

        let mut head = [0u8; FRAME_HEADER_SIZE];
        head.copy_from_slice(header.as_bytes());
        self.cipher.apply_keystream(&mut head);
        let head_mac = self.mac.header(&head);

        let padded = padded_len(size);
        dst.reserve(FRAME_HEADER_SIZE + FRAME_MAC_SIZE + padded + FRAME_MAC_SIZE);
        dst.put_slice(&head);
        dst.put_slice(&head_mac);

        let start = dst.len();
        dst.put_slice(&frame.body);
        dst.resize(start + padded, 0);
        self.cipher.apply_keystream(&mut dst[start..]);
        let frame_mac = self.mac.body(&dst[start..]);
        dst.put_slice(&frame_mac);
        Ok(())
    }
}

// ── Ingress ───────────────────────────────────────────────────────────────────

pub struct IngressCoder {
    cipher: Aes256Ctr,
    mac: MacChain,
    /// (body size, capability hint) of a header already consumed.
    pending: Option<(usize, u16)>,
}

impl Decoder for IngressCoder {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let (size, hint) = match self.pending {
            Some(p) => p,
            None => {
                if src.len() < FRAME_HEADER_SIZE + FRAME_MAC_SIZE {
                    return Ok(None);
                }
                let mut head = [0u8; FRAME_HEADER_SIZE];
                head.copy_from_slice(&src[..FRAME_HEADER_SIZE]);
                let expected = self.mac.header(&head);
                let received = &src[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + FRAME_MAC_SIZE];
                if !mac_eq(&expected, received) {
                    return Err(FrameError::HeaderMac);
                }
                src.advance(FRAME_HEADER_SIZE + FRAME_MAC_SIZE);

                self.cipher.apply_keystream(&mut head);
                let header = FrameHeader::read_from(&head[..]).ok_or(FrameError::HeaderMac)?;
                let size = header.body_size();
                if size > MAX_FRAME_SIZE {
                    return Err(FrameError::Wire(WireError::FrameTooLarge(size)));
                }
                let p = (size, header.capability_hint.get());
                self.pending = Some(p);
                p
            }
        };

        let needed = padded_len(size) + FRAME_MAC_SIZE;
        if src.len() < needed {
            src.reserve((needed - src.len()).min(RESERVE_STEP));
            return Ok(None);
        }

        let mut body = src.split_to(padded_len(size));
        let received_mac = src.split_to(FRAME_MAC_SIZE);
        let expected = self.mac.body(&body);
        if !mac_eq(&expected, &received_mac) {
            return Err(FrameError::FrameMac);
        }
        self.cipher.apply_keystream(&mut body);
        body.truncate(size);
        self.pending = None;

        Ok(Some(Frame {
            capability_hint: hint,
            body: body.freeze(),
        }))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("header MAC mismatch")]
    HeaderMac,
    #[error("frame MAC mismatch")]
    FrameMac,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Initiator, Responder};
    use meshwire_core::crypto::Keypair;

    fn pair() -> ((EgressCoder, IngressCoder), (EgressCoder, IngressCoder)) {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let init = Initiator::new(&a, &b.id()).unwrap();
        let (sb, ack) = Responder::accept(&b, init.auth()).unwrap();
        let sa = init.finish(&a, &ack).unwrap();
        (split(sa), split(sb))
    }

    #[test]
    fn frames_cross_in_both_directions() {
        let ((mut a_out, mut a_in), (mut b_out, mut b_in)) = pair();
        let mut wire = BytesMut::new();

        a_out.encode(Frame::new(1, 0x10, b"hello"), &mut wire).unwrap();
        let got = b_in.decode(&mut wire).unwrap().unwrap();
        assert_eq!(got.capability_hint, 1);
        assert_eq!(got.message_id(), Some(0x10));
        assert_eq!(&got.payload()[..], b"hello");
        assert!(wire.is_empty());

        b_out.encode(Frame::new(0, 0x02, &[]), &mut wire).unwrap();
        let got = a_in.decode(&mut wire).unwrap().unwrap();
        assert_eq!(got.message_id(), Some(0x02));
        assert!(got.payload().is_empty());
    }

    #[test]
    fn encoded_size_is_padded() {
        let ((mut a_out, _), _) = pair();
        let mut wire = BytesMut::new();
        a_out.encode(Frame::new(0, 0x10, &[7u8; 15]), &mut wire).unwrap();
        // 17-byte body pads to 32.
        assert_eq!(wire.len(), 16 + 16 + 32 + 16);
    }

    #[test]
    fn byte_at_a_time_delivery_decodes() {
        let ((mut a_out, _), (_, mut b_in)) = pair();
        let mut encoded = BytesMut::new();
        for i in 0..3u16 {
            a_out
                .encode(Frame::new(1, 0x10 + i, &vec![i as u8; 40]), &mut encoded)
                .unwrap();
        }

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in encoded.iter() {
            buf.put_u8(*byte);
            while let Some(f) = b_in.decode(&mut buf).unwrap() {
                frames.push(f);
            }
        }
        let ids: Vec<_> = frames.iter().filter_map(Frame::message_id).collect();
        assert_eq!(ids, vec![0x10, 0x11, 0x12]);
    }

    #[test]
    fn announced_size_does_not_drive_allocation() {
        let ((mut a_out, _), (_, mut b_in)) = pair();
        let mut encoded = BytesMut::new();
        a_out
            .encode(Frame::new(1, 0x10, &vec![3u8; MAX_PAYLOAD_SIZE]), &mut encoded)
            .unwrap();

        // Header and header MAC only; the body is still in flight.
        let mut buf = BytesMut::from(&encoded[..FRAME_HEADER_SIZE + FRAME_MAC_SIZE]);
        assert!(b_in.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() <= 2 * RESERVE_STEP);

        buf.extend_from_slice(&encoded[FRAME_HEADER_SIZE + FRAME_MAC_SIZE..]);
        let got = b_in.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got.payload().len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn replayed_frame_fails_header_mac() {
        let ((mut a_out, _), (_, mut b_in)) = pair();
        let mut wire = BytesMut::new();
        a_out.encode(Frame::new(1, 0x10, b"once"), &mut wire).unwrap();
        let copy = wire.clone();

        assert!(b_in.decode(&mut wire).unwrap().is_some());
        let mut replay = copy;
        assert!(matches!(b_in.decode(&mut replay), Err(FrameError::HeaderMac)));
    }

    #[test]
    fn tampered_body_fails_frame_mac() {
        let ((mut a_out, _), (_, mut b_in)) = pair();
        let mut wire = BytesMut::new();
        a_out.encode(Frame::new(1, 0x10, b"payload"), &mut wire).unwrap();
        wire[33] ^= 0x01;
        assert!(matches!(b_in.decode(&mut wire), Err(FrameError::FrameMac)));
    }

    #[test]
    fn frames_from_another_session_are_rejected() {
        let ((mut a_out, _), _) = pair();
        let (_, (_, mut other_in)) = pair();
        let mut wire = BytesMut::new();
        a_out.encode(Frame::new(0, 0x10, b"x"), &mut wire).unwrap();
        assert!(matches!(other_in.decode(&mut wire), Err(FrameError::HeaderMac)));
    }

    #[test]
    fn short_body_has_no_message_id() {
        let f = Frame {
            capability_hint: 0,
            body: Bytes::from_static(&[1]),
        };
        assert_eq!(f.message_id(), None);
        assert!(f.payload().is_empty());
    }
}
