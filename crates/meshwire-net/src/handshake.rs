//! Session handshake — authenticated key agreement over a fresh stream.
//!
//! Initiator → responder: `auth`, an ECIES-sealed `AuthBody` carrying the
//! initiator's static key, a nonce, and a signature by its ephemeral key
//! over `static_shared XOR nonce`. The responder recovers the ephemeral key
//! from that signature.
//!
//! Responder → initiator: `ack`, an ECIES-sealed `AckBody` carrying the
//! responder's ephemeral key and nonce.
//!
//! Both sides then derive the same frame secrets. The handshake either
//! produces `Secrets` or an error; nothing partial escapes.

use meshwire_core::crypto::{
    ecies_encrypt, generate_nonce, keccak256, keccak256_concat, recover, xor32, CryptoError,
    Keypair,
};
use meshwire_core::wire::{AckBody, AuthBody, ACK_SIZE, AUTH_SIZE};
use meshwire_core::NodeId;
use sha3::{Digest, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroizing;

/// Everything the frame coder needs, plus who we are talking to.
pub struct Secrets {
    pub remote: NodeId,
    pub aes_secret: Zeroizing<[u8; 32]>,
    pub mac_secret: Zeroizing<[u8; 32]>,
    pub egress_mac: Keccak256,
    pub ingress_mac: Keccak256,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

struct Exchange<'a> {
    initiator: bool,
    ephemeral: &'a Keypair,
    remote_ephemeral: &'a NodeId,
    local_nonce: &'a [u8; 32],
    remote_nonce: &'a [u8; 32],
    /// Handshake ciphertext we sent.
    sent: &'a [u8],
    /// Handshake ciphertext we received.
    received: &'a [u8],
}

fn derive_secrets(remote: NodeId, x: Exchange<'_>) -> Result<Secrets, HandshakeError> {
    let ephemeral_shared = x.ephemeral.agree(x.remote_ephemeral)?;
    let (recipient_nonce, initiator_nonce) = if x.initiator {
        (x.remote_nonce, x.local_nonce)
    } else {
        (x.local_nonce, x.remote_nonce)
    };

    let nonce_hash = keccak256_concat(&[&recipient_nonce[..], &initiator_nonce[..]]);
    let shared = Zeroizing::new(keccak256_concat(&[&ephemeral_shared[..], &nonce_hash[..]]));
    let aes_secret = Zeroizing::new(keccak256_concat(&[&ephemeral_shared[..], &shared[..]]));
    let mac_secret = Zeroizing::new(keccak256_concat(&[&ephemeral_shared[..], &aes_secret[..]]));

    let mut egress_mac = Keccak256::new();
    egress_mac.update(xor32(&mac_secret, x.remote_nonce));
    egress_mac.update(x.sent);

    let mut ingress_mac = Keccak256::new();
    ingress_mac.update(xor32(&mac_secret, x.local_nonce));
    ingress_mac.update(x.received);

    Ok(Secrets {
        remote,
        aes_secret,
        mac_secret,
        egress_mac,
        ingress_mac,
    })
}

// ── Initiator ─────────────────────────────────────────────────────────────────

/// The dialing side.
pub struct Initiator {
    ephemeral: Keypair,
    nonce: [u8; 32],
    remote: NodeId,
    auth: Vec<u8>,
}

impl Initiator {
    /// Build the auth message for `remote`.
    pub fn new(keypair: &Keypair, remote: &NodeId) -> Result<Self, HandshakeError> {
        let ephemeral = Keypair::generate();
        let nonce = generate_nonce();
        let static_shared = keypair.agree(remote)?;

        let body = AuthBody {
            signature: ephemeral.sign(&xor32(&static_shared, &nonce)),
            ephemeral_hash: keccak256(&ephemeral.id().0),
            public_key: keypair.id().0,
            nonce,
            token_flag: 0,
        };
        let auth = ecies_encrypt(remote, body.as_bytes())?;

        Ok(Self {
            ephemeral,
            nonce,
            remote: *remote,
            auth,
        })
    }

    /// Bytes to write to the stream.
    pub fn auth(&self) -> &[u8] {
        &self.auth
    }

    /// Process the responder's ack and derive the session secrets.
    pub fn finish(self, keypair: &Keypair, ack: &[u8]) -> Result<Secrets, HandshakeError> {
        let plain = Zeroizing::new(keypair.decrypt(ack)?);
        let body = AckBody::read_from(&plain[..]).ok_or(HandshakeError::Malformed("ack"))?;
        let remote_ephemeral = NodeId(body.ephemeral_public);
        let remote_nonce = body.nonce;

        derive_secrets(
            self.remote,
            Exchange {
                initiator: true,
                ephemeral: &self.ephemeral,
                remote_ephemeral: &remote_ephemeral,
                local_nonce: &self.nonce,
                remote_nonce: &remote_nonce,
                sent: &self.auth,
                received: ack,
            },
        )
    }
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// The accepting side.
pub struct Responder;

impl Responder {
    /// Verify an auth message. Returns the session secrets and the ack to send.
    pub fn accept(keypair: &Keypair, auth: &[u8]) -> Result<(Secrets, Vec<u8>), HandshakeError> {
        let plain = Zeroizing::new(keypair.decrypt(auth)?);
        let body = AuthBody::read_from(&plain[..]).ok_or(HandshakeError::Malformed("auth"))?;

        let remote = NodeId(body.public_key);
        let remote_nonce = body.nonce;
        let static_shared = keypair.agree(&remote)?;
        let signature = body.signature;
        let remote_ephemeral = recover(&signature, &xor32(&static_shared, &remote_nonce))?;
        if keccak256(&remote_ephemeral.0) != body.ephemeral_hash {
            return Err(HandshakeError::EphemeralMismatch);
        }

        let ephemeral = Keypair::generate();
        let nonce = generate_nonce();
        let ack_body = AckBody {
            ephemeral_public: ephemeral.id().0,
            nonce,
            token_flag: 0,
        };
        let ack = ecies_encrypt(&remote, ack_body.as_bytes())?;

        let secrets = derive_secrets(
            remote,
            Exchange {
                initiator: false,
                ephemeral: &ephemeral,
                remote_ephemeral: &remote_ephemeral,
                local_nonce: &nonce,
                remote_nonce: &remote_nonce,
                sent: &ack,
                received: auth,
            },
        )?;
        Ok((secrets, ack))
    }
}

// ── Stream drivers ────────────────────────────────────────────────────────────

/// Run the initiator side over `stream`. The caller bounds it with a timeout.
pub async fn initiate<S>(
    stream: &mut S,
    keypair: &Keypair,
    remote: &NodeId,
) -> Result<Secrets, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let initiator = Initiator::new(keypair, remote)?;
    stream.write_all(initiator.auth()).await?;
    stream.flush().await?;

    let mut ack = vec![0u8; ACK_SIZE];
    stream.read_exact(&mut ack).await?;
    initiator.finish(keypair, &ack)
}

/// Run the responder side over `stream`. The remote id is in the result.
pub async fn respond<S>(stream: &mut S, keypair: &Keypair) -> Result<Secrets, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth = vec![0u8; AUTH_SIZE];
    stream.read_exact(&mut auth).await?;

    let (secrets, ack) = Responder::accept(keypair, &auth)?;
    stream.write_all(&ack).await?;
    stream.flush().await?;
    Ok(secrets)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("ephemeral key does not match its hash")]
    EphemeralMismatch,
    #[error("handshake timed out")]
    Timeout,
}
