//! Per-peer session state and the envelope wire format.
//!
//! Sessions are established with X3DH over X25519 (identity keys derived from
//! Ed25519) and advanced with a symmetric HKDF chain per direction. Every
//! operation returns the successor state instead of mutating in place, so the
//! caller decides when (and whether) it is persisted.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::prekeys::PreKey;

const WIRE_VERSION: u8 = 1;
const KIND_PREKEY: u8 = 1;
const KIND_CIPHER: u8 = 2;

const STATE_VERSION: u8 = 2;
/// Everything before the variable-length list of seen base keys.
const STATE_FIXED_LEN: usize = 1 + 32 * 6 + 8 + 8 + 1 + 2 + 1;

/// Base keys of the peer's prekey messages remembered per session, newest last.
const MAX_SEEN_BASE_KEYS: usize = 32;

/// Upper bound on messages skipped over when a counter jumps ahead.
const MAX_SKIP: u64 = 1000;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionState {
    root_key: [u8; 32],
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    /// Initiator: our ephemeral public key. Responder: the prekey used.
    our_base_key: [u8; 32],
    /// Initiator: the peer's prekey. Responder: the peer's ephemeral key.
    their_base_key: [u8; 32],
    /// Ed25519 identity of the peer this session is bound to.
    their_identity_key: [u8; 32],
    send_counter: u64,
    recv_counter: u64,
    /// Prekey we initiated with; outgoing messages carry it until the peer replies.
    pending_prekey: Option<u16>,
    /// Base keys of prekey messages already accepted from this peer, carried
    /// over when the session is replaced so old first messages stay rejected.
    seen_base_keys: Vec<[u8; 32]>,
}

/// Routing data carried by the first messages of an initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PreKeyHeader {
    pub prekey_id: u16,
    pub identity_key: [u8; 32],
    pub base_key: [u8; 32],
}

/// A parsed envelope borrowing from the received bytes.
pub(crate) struct Envelope<'a> {
    pub prekey: Option<PreKeyHeader>,
    counter: u64,
    nonce: [u8; 12],
    header: &'a [u8],
    ciphertext: &'a [u8],
}

impl SessionState {
    /// Initiator side: start a session from a peer's published prekey.
    pub fn initiate(
        ours: &Identity,
        their_identity_key: &[u8],
        their_prekey: &PreKey,
    ) -> Result<Self, CryptoError> {
        their_prekey.verify(their_identity_key)?;

        let their_identity = Identity::peer_ed25519_to_x25519(their_identity_key)?;
        let their_identity_key = <[u8; 32]>::try_from(their_identity_key)
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        let their_prekey_public = X25519Public::from(
            <[u8; 32]>::try_from(their_prekey.public_key.as_slice())
                .map_err(|_| CryptoError::InvalidKey("prekey wrong length".into()))?,
        );

        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral);

        let okm = derive_session_keys(&[
            ours.to_x25519_secret().diffie_hellman(&their_prekey_public),
            ephemeral.diffie_hellman(&their_identity),
            ephemeral.diffie_hellman(&their_prekey_public),
        ])?;

        Ok(Self {
            root_key: slice32(&okm[..32]),
            sending_chain_key: slice32(&okm[32..64]),
            receiving_chain_key: slice32(&okm[64..96]),
            our_base_key: ephemeral_public.to_bytes(),
            their_base_key: their_prekey_public.to_bytes(),
            their_identity_key,
            send_counter: 0,
            recv_counter: 0,
            pending_prekey: Some(their_prekey.id),
            seen_base_keys: Vec::new(),
        })
    }

    /// Responder side: mirror the initiator's key agreement from a prekey message.
    pub fn respond(
        ours: &Identity,
        prekey_secret: &StaticSecret,
        header: &PreKeyHeader,
    ) -> Result<Self, CryptoError> {
        let their_identity = Identity::peer_ed25519_to_x25519(&header.identity_key)?;
        let their_base = X25519Public::from(header.base_key);

        let okm = derive_session_keys(&[
            prekey_secret.diffie_hellman(&their_identity),
            ours.to_x25519_secret().diffie_hellman(&their_base),
            prekey_secret.diffie_hellman(&their_base),
        ])?;

        Ok(Self {
            root_key: slice32(&okm[..32]),
            // Chains are swapped relative to the initiator.
            sending_chain_key: slice32(&okm[64..96]),
            receiving_chain_key: slice32(&okm[32..64]),
            our_base_key: X25519Public::from(prekey_secret).to_bytes(),
            their_base_key: header.base_key,
            their_identity_key: header.identity_key,
            send_counter: 0,
            recv_counter: 0,
            pending_prekey: None,
            seen_base_keys: vec![header.base_key],
        })
    }

    pub fn their_base_key(&self) -> &[u8; 32] {
        &self.their_base_key
    }

    pub fn their_identity_key(&self) -> &[u8; 32] {
        &self.their_identity_key
    }

    /// Whether a prekey message with this base key was accepted before.
    pub fn has_seen_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.seen_base_keys.contains(base_key)
    }

    /// Keep the base-key history of the session this one replaces.
    pub fn inherit_history(&mut self, previous: &SessionState) {
        let mut seen = previous.seen_base_keys.clone();
        seen.append(&mut self.seen_base_keys);
        let excess = seen.len().saturating_sub(MAX_SEEN_BASE_KEYS);
        seen.drain(..excess);
        self.seen_base_keys = seen;
    }

    /// Encrypt one message; returns the envelope and the advanced state.
    pub fn seal(&self, identity_key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Self), CryptoError> {
        let mut next = self.clone();
        let (message_key, chain_key) = chain_step(&self.sending_chain_key)?;
        next.sending_chain_key = chain_key;
        next.send_counter += 1;

        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&next.send_counter.to_be_bytes());

        let mut envelope = Vec::with_capacity(2 + 66 + 20 + plaintext.len() + 16);
        envelope.push(WIRE_VERSION);
        match self.pending_prekey {
            Some(prekey_id) => {
                envelope.push(KIND_PREKEY);
                envelope.extend_from_slice(&prekey_id.to_be_bytes());
                envelope.extend_from_slice(identity_key);
                envelope.extend_from_slice(&self.our_base_key);
            }
            None => envelope.push(KIND_CIPHER),
        }
        envelope.extend_from_slice(&next.send_counter.to_be_bytes());
        envelope.extend_from_slice(&nonce);

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::EncryptionFailure(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &envelope,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailure(e.to_string()))?;
        envelope.extend_from_slice(&ciphertext);

        Ok((envelope, next))
    }

    /// Decrypt one envelope; returns the plaintext and the advanced state.
    ///
    /// `self` is untouched on failure.
    pub fn open(&self, envelope: &Envelope<'_>) -> Result<(Vec<u8>, Self), CryptoError> {
        if envelope.counter <= self.recv_counter {
            return Err(CryptoError::DecryptionFailure(format!(
                "stale or replayed message (counter {}, last {})",
                envelope.counter, self.recv_counter
            )));
        }
        let skipped = envelope.counter - self.recv_counter - 1;
        if skipped > MAX_SKIP {
            return Err(CryptoError::DecryptionFailure(format!(
                "counter jumped {skipped} messages ahead"
            )));
        }

        let mut chain_key = self.receiving_chain_key;
        let mut message_key = [0u8; 32];
        for _ in 0..=skipped {
            let (mk, ck) = chain_step(&chain_key)?;
            message_key = mk;
            chain_key = ck;
        }

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: envelope.ciphertext,
                    aad: envelope.header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailure("authentication tag mismatch".into()))?;
        message_key.zeroize();

        let mut next = self.clone();
        next.receiving_chain_key = chain_key;
        next.recv_counter = envelope.counter;
        next.pending_prekey = None;
        Ok((plaintext, next))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(STATE_FIXED_LEN + 32 * self.seen_base_keys.len());
        data.push(STATE_VERSION);
        data.extend_from_slice(&self.root_key);
        data.extend_from_slice(&self.sending_chain_key);
        data.extend_from_slice(&self.receiving_chain_key);
        data.extend_from_slice(&self.our_base_key);
        data.extend_from_slice(&self.their_base_key);
        data.extend_from_slice(&self.their_identity_key);
        data.extend_from_slice(&self.send_counter.to_be_bytes());
        data.extend_from_slice(&self.recv_counter.to_be_bytes());
        match self.pending_prekey {
            Some(id) => {
                data.push(1);
                data.extend_from_slice(&id.to_be_bytes());
            }
            None => data.extend_from_slice(&[0, 0, 0]),
        }
        // Bounded by MAX_SEEN_BASE_KEYS, which fits a byte.
        data.push(u8::try_from(self.seen_base_keys.len()).unwrap_or(u8::MAX));
        for key in &self.seen_base_keys {
            data.extend_from_slice(key);
        }
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let corrupt = || CryptoError::SessionError("corrupt session state".into());
        if data.len() < STATE_FIXED_LEN {
            return Err(corrupt());
        }
        let mut r = Reader::new(data);
        if r.u8().ok_or_else(corrupt)? != STATE_VERSION {
            return Err(CryptoError::SessionError("unsupported session state version".into()));
        }
        let root_key = r.array().ok_or_else(corrupt)?;
        let sending_chain_key = r.array().ok_or_else(corrupt)?;
        let receiving_chain_key = r.array().ok_or_else(corrupt)?;
        let our_base_key = r.array().ok_or_else(corrupt)?;
        let their_base_key = r.array().ok_or_else(corrupt)?;
        let their_identity_key = r.array().ok_or_else(corrupt)?;
        let send_counter = r.u64().ok_or_else(corrupt)?;
        let recv_counter = r.u64().ok_or_else(corrupt)?;
        let pending_flag = r.u8().ok_or_else(corrupt)?;
        let pending_id = r.u16().ok_or_else(corrupt)?;
        let pending_prekey = match pending_flag {
            0 => None,
            1 => Some(pending_id),
            _ => return Err(corrupt()),
        };
        let seen_count = usize::from(r.u8().ok_or_else(corrupt)?);
        if seen_count > MAX_SEEN_BASE_KEYS || data.len() != STATE_FIXED_LEN + 32 * seen_count {
            return Err(corrupt());
        }
        let seen_base_keys = (0..seen_count)
            .map(|_| r.array().ok_or_else(corrupt))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root_key,
            sending_chain_key,
            receiving_chain_key,
            our_base_key,
            their_base_key,
            their_identity_key,
            send_counter,
            recv_counter,
            pending_prekey,
            seen_base_keys,
        })
    }
}

impl<'a> Envelope<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, CryptoError> {
        let truncated = || CryptoError::DecryptionFailure("truncated envelope".into());
        let mut r = Reader::new(data);

        if r.u8().ok_or_else(truncated)? != WIRE_VERSION {
            return Err(CryptoError::DecryptionFailure("unsupported envelope version".into()));
        }
        let prekey = match r.u8().ok_or_else(truncated)? {
            KIND_PREKEY => Some(PreKeyHeader {
                prekey_id: r.u16().ok_or_else(truncated)?,
                identity_key: r.array().ok_or_else(truncated)?,
                base_key: r.array().ok_or_else(truncated)?,
            }),
            KIND_CIPHER => None,
            kind => {
                return Err(CryptoError::DecryptionFailure(format!(
                    "unknown envelope kind {kind}"
                )))
            }
        };
        let counter = r.u64().ok_or_else(truncated)?;
        let nonce = r.array().ok_or_else(truncated)?;
        let (header, ciphertext) = data.split_at(r.pos);
        if ciphertext.len() < 16 {
            return Err(truncated());
        }

        Ok(Self {
            prekey,
            counter,
            nonce,
            header,
            ciphertext,
        })
    }
}

fn derive_session_keys(secrets: &[SharedSecret]) -> Result<[u8; 96], CryptoError> {
    let mut ikm = Vec::with_capacity(32 * secrets.len());
    for secret in secrets {
        ikm.extend_from_slice(secret.as_bytes());
    }
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 96];
    hk.expand(b"BotvaultX3DH", &mut okm)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    ikm.zeroize();
    Ok(okm)
}

/// Advance a chain key, yielding `(message_key, next_chain_key)`.
fn chain_step(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(b"BotvaultMsgKey", &mut message_key)
        .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;
    hk.expand(b"BotvaultChainKey", &mut next_chain_key)
        .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

fn slice32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }
}
