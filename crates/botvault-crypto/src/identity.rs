use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A bot's long-term cryptographic identity.
///
/// The Ed25519 key pair signs published prekeys; its X25519 counterpart
/// takes part in session key agreement. Generated exactly once per bot
/// identifier and persisted by the [`KeyStore`](crate::store::KeyStore).
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its persisted 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Ed25519 public key, as published in prekey bundles.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Secret key bytes for persistence. Never log or publish these.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify `signature` over `message` against a raw Ed25519 public key.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let public_key = <[u8; 32]>::try_from(public_key)
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidKey(format!("malformed signature: {e}")))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::InvalidKey(format!("signature rejected: {e}")))
    }

    /// X25519 secret sharing the Ed25519 scalar, so that
    /// [`peer_ed25519_to_x25519`](Self::peer_ed25519_to_x25519) of our public
    /// key yields the matching X25519 public key.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Map a peer's Ed25519 public key onto Montgomery form (RFC 7748).
    pub fn peer_ed25519_to_x25519(public_key: &[u8]) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let public_key = <[u8; 32]>::try_from(public_key)
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        Ok(x25519_dalek::PublicKey::from(
            verifying_key.to_montgomery().to_bytes(),
        ))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}
