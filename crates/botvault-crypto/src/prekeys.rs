//! Prekeys and the bundles bots publish so peers can open sessions
//! without an interactive handshake.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::Identity;

/// Reserved index of the last-resort prekey. One-time prekeys use `0..0xFFFF`.
pub const LAST_RESORT_PREKEY_ID: u16 = u16::MAX;

/// A public prekey, signed by the owning identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u16,
    /// X25519 public key.
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `id || public_key`.
    pub signature: Vec<u8>,
}

impl PreKey {
    /// Derive the public half of `secret` and sign it with `identity`.
    pub(crate) fn from_secret(id: u16, secret: &StaticSecret, identity: &Identity) -> Self {
        let public_key = X25519Public::from(secret).as_bytes().to_vec();
        let signature = identity.sign(&signed_payload(id, &public_key)).to_bytes().to_vec();
        Self {
            id,
            public_key,
            signature,
        }
    }

    pub fn is_last_resort(&self) -> bool {
        self.id == LAST_RESORT_PREKEY_ID
    }

    /// Check the signature against the publishing identity's key.
    pub fn verify(&self, identity_key: &[u8]) -> Result<(), CryptoError> {
        Identity::verify(
            identity_key,
            &signed_payload(self.id, &self.public_key),
            &self.signature,
        )
    }
}

fn signed_payload(id: u16, public_key: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + public_key.len());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(public_key);
    payload
}

/// Snapshot of an identity's public key material handed to the network.
///
/// Stateless: regenerating it never touches the stored secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    /// Present once the last-resort prekey has been generated.
    pub last_resort: Option<PreKey>,
    pub prekeys: Vec<PreKey>,
}

impl PreKeyBundle {
    /// First one-time prekey, falling back to the last-resort key.
    pub fn pick(&self) -> Option<&PreKey> {
        self.prekeys.first().or(self.last_resort.as_ref())
    }
}
