//! Cryptographic primitives for meshwire.
//!
//! Provides:
//!   1. Keccak-256 hashing, used for packet hashes, distances and the
//!      session MAC chain
//!   2. secp256k1 keypairs, recoverable signatures and ECDH
//!   3. ECIES encryption of handshake messages
//!
//! Secret keys are erased on drop and exported only wrapped in `Zeroizing`.
//! The secp256k1 context is the library's immutable global context.
//! There is no unsafe code in this module.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::identity::NodeId;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

// ── Keccak ────────────────────────────────────────────────────────────────────

/// Keccak-256 of a byte slice.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Keccak-256 over the concatenation of `parts`, without allocating.
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Keccak256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

pub fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term secp256k1 keypair. Its public half is the `NodeId`.
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
    id: NodeId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret(secret)
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self {
            secret,
            public,
            id: NodeId::from_public_key(&public),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Serialize the secret key for persistent storage.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }

    pub fn sign(&self, digest: &[u8; 32]) -> [u8; 65] {
        sign_recoverable(&self.secret, digest)
    }

    pub fn agree(&self, remote: &NodeId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        ecdh(&self.secret, remote)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        ecies_decrypt(&self.secret, data)
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Generate a cryptographically random 32-byte nonce.
pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

// ── Signatures ────────────────────────────────────────────────────────────────

/// Sign a 32-byte digest. Output is `r || s || v` with `v` the recovery id.
pub fn sign_recoverable(secret: &SecretKey, digest: &[u8; 32]) -> [u8; 65] {
    let msg = Message::from_digest(*digest);
    let (rec, compact) = SECP256K1
        .sign_ecdsa_recoverable(&msg, secret)
        .serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = rec.to_i32() as u8;
    out
}

/// Recover the signer's id from a signature over `digest`.
pub fn recover(signature: &[u8; 65], digest: &[u8; 32]) -> Result<NodeId, CryptoError> {
    let rec = RecoveryId::from_i32(i32::from(signature[64])).map_err(|_| CryptoError::BadSignature)?;
    let sig = RecoverableSignature::from_compact(&signature[..64], rec)
        .map_err(|_| CryptoError::BadSignature)?;
    let key = SECP256K1
        .recover_ecdsa(&Message::from_digest(*digest), &sig)
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(NodeId::from_public_key(&key))
}

// ── ECDH ──────────────────────────────────────────────────────────────────────

/// X coordinate of `secret * remote`.
pub fn ecdh(secret: &SecretKey, remote: &NodeId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let point = remote.to_public_key().map_err(|_| CryptoError::InvalidPublicKey)?;
    let xy = Zeroizing::new(secp256k1::ecdh::shared_secret_point(&point, secret));
    let mut x = Zeroizing::new([0u8; 32]);
    x.copy_from_slice(&xy[..32]);
    Ok(x)
}

// ── ECIES ─────────────────────────────────────────────────────────────────────

/// Bytes ECIES adds to a plaintext: ephemeral key (65), IV (16), tag (32).
pub const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// NIST SP 800-56 concat KDF with SHA-256, one round (32 bytes of output).
fn concat_kdf(z: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut h = <Sha256 as Digest>::new();
    Digest::update(&mut h, 1u32.to_be_bytes());
    Digest::update(&mut h, z);
    Zeroizing::new(h.finalize().into())
}

/// Split KDF output into the AES key and the HMAC key (SHA-256 of the
/// second half).
fn ecies_keys(shared: &[u8; 32]) -> (Zeroizing<[u8; 16]>, Zeroizing<[u8; 32]>) {
    let k = concat_kdf(shared);
    let mut ke = Zeroizing::new([0u8; 16]);
    ke.copy_from_slice(&k[..16]);
    let km = Zeroizing::new(<Sha256 as Digest>::digest(&k[16..]).into());
    (ke, km)
}

/// Encrypt `plain` to `remote`: `0x04 || R || iv || AES-128-CTR(c) || HMAC(iv || c)`.
pub fn ecies_encrypt(remote: &NodeId, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::new(&mut rand::thread_rng());
    let ephemeral_pub = PublicKey::from_secret_key(SECP256K1, &ephemeral);
    let shared = ecdh(&ephemeral, remote)?;
    let (ke, km) = ecies_keys(&shared);

    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(plain.len() + ECIES_OVERHEAD);
    out.extend_from_slice(&ephemeral_pub.serialize_uncompressed());
    out.extend_from_slice(&iv);
    let body_start = out.len();
    out.extend_from_slice(plain);

    let mut cipher =
        Aes128Ctr::new_from_slices(&ke[..], &iv).map_err(|_| CryptoError::KeyLength)?;
    cipher.apply_keystream(&mut out[body_start..]);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&km[..]).map_err(|_| CryptoError::KeyLength)?;
    mac.update(&out[65..]);
    out.extend_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Decrypt an ECIES message addressed to `secret`.
pub fn ecies_decrypt(secret: &SecretKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < ECIES_OVERHEAD {
        return Err(CryptoError::TooShort);
    }
    if data[0] != 0x04 {
        return Err(CryptoError::InvalidPublicKey);
    }
    let sender = NodeId::from_slice(&data[1..65]).map_err(|_| CryptoError::InvalidPublicKey)?;
    let shared = ecdh(secret, &sender)?;
    let (ke, km) = ecies_keys(&shared);

    let tag_start = data.len() - 32;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&km[..]).map_err(|_| CryptoError::KeyLength)?;
    mac.update(&data[65..tag_start]);
    mac.verify_slice(&data[tag_start..])
        .map_err(|_| CryptoError::MacMismatch)?;

    let iv = &data[65..81];
    let mut plain = data[81..tag_start].to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&ke[..], iv).map_err(|_| CryptoError::KeyLength)?;
    cipher.apply_keystream(&mut plain);
    Ok(plain)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature invalid or unrecoverable")]
    BadSignature,
    #[error("ciphertext too short")]
    TooShort,
    #[error("message authentication failed")]
    MacMismatch,
    #[error("bad cipher key length")]
    KeyLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_empty_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn keccak_concat_matches_oneshot() {
        assert_eq!(keccak256_concat(&[b"hello ", b"world"]), keccak256(b"hello world"));
    }

    #[test]
    fn keypair_roundtrip_via_secret_bytes() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes()[..]).unwrap();
        assert_eq!(kp.id(), restored.id());
    }

    #[test]
    fn keypair_rejects_zero_secret() {
        assert!(Keypair::from_secret_bytes(&[0u8; 32]).is_err());
        assert!(Keypair::from_secret_bytes(&[1u8; 31]).is_err());
    }

    #[test]
    fn signature_recovers_signer() {
        let kp = Keypair::generate();
        let digest = keccak256(b"payload");
        let sig = kp.sign(&digest);
        assert_eq!(recover(&sig, &digest).unwrap(), kp.id());

        let other = keccak256(b"other");
        assert_ne!(recover(&sig, &other).ok(), Some(kp.id()));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let mut sig = [0u8; 65];
        sig[64] = 9;
        assert!(recover(&sig, &[1u8; 32]).is_err());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(*a.agree(&b.id()).unwrap(), *b.agree(&a.id()).unwrap());
    }

    #[test]
    fn ecies_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"the auth body goes here";
        let sealed = ecies_encrypt(&kp.id(), msg).unwrap();
        assert_eq!(sealed.len(), msg.len() + ECIES_OVERHEAD);
        assert_eq!(kp.decrypt(&sealed).unwrap(), msg);
    }

    #[test]
    fn ecies_tampered_ciphertext_is_rejected() {
        let kp = Keypair::generate();
        let mut sealed = ecies_encrypt(&kp.id(), b"secret").unwrap();
        sealed[90] ^= 0x01;
        assert!(matches!(kp.decrypt(&sealed), Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn ecies_wrong_recipient_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sealed = ecies_encrypt(&kp.id(), b"secret").unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn ecies_short_input_is_error() {
        let kp = Keypair::generate();
        assert!(matches!(kp.decrypt(&[4u8; 50]), Err(CryptoError::TooShort)));
    }
}
