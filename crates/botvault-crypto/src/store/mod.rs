//! Durable per-bot storage for key material and session state.
//!
//! A [`KeyStore`] is the backend; [`KeyStore::open`] hands out one
//! [`StorageHandle`] scoped to a single bot. Every write on a handle is atomic:
//! either the new value is fully visible afterwards or the old one still is.

pub mod file;
pub mod memory;

pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Storage backend shared by all bots of a process.
pub trait KeyStore: Send + Sync {
    /// Open (creating if needed) the storage scoped to `bot_id`.
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError>;

    /// Destroy everything persisted for `bot_id`. Only used for explicit
    /// tenant removal.
    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError>;

    /// Identifiers that currently have a persisted identity.
    fn identities(&self) -> Result<Vec<String>, CryptoError>;
}

/// Storage scoped to one bot, exclusively owned by its `CryptoEngine`.
pub trait StorageHandle: Send {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError>;

    fn save_identity(&mut self, record: &IdentityRecord) -> Result<(), CryptoError>;

    fn load_session(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    fn save_session(&mut self, peer: &str, state: &[u8]) -> Result<(), CryptoError>;

    /// Peers with a persisted session.
    fn sessions(&self) -> Result<Vec<String>, CryptoError>;

    /// Secret of an unconsumed one-time prekey.
    fn load_prekey(&self, id: u16) -> Result<Option<[u8; 32]>, CryptoError>;

    /// Store a batch of one-time prekey secrets in a single write.
    fn save_prekeys(&mut self, prekeys: &[(u16, [u8; 32])]) -> Result<(), CryptoError>;

    fn remove_prekey(&mut self, id: u16) -> Result<(), CryptoError>;

    fn prekey_ids(&self) -> Result<Vec<u16>, CryptoError>;

    /// Release backend resources. Never deletes data; safe to call twice.
    fn close(&mut self) -> Result<(), CryptoError>;
}

/// Everything persisted about a bot's own identity.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityRecord {
    /// Ed25519 identity secret.
    pub secret_key: [u8; 32],
    /// X25519 secret of the last-resort prekey, once generated.
    pub last_resort_secret: Option<[u8; 32]>,
    /// Lowest one-time prekey index never handed out.
    pub next_prekey_id: u16,
}

impl IdentityRecord {
    pub fn new(secret_key: [u8; 32]) -> Self {
        Self {
            secret_key,
            last_resort_secret: None,
            next_prekey_id: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self)
            .map_err(|e| CryptoError::StorageUnavailable(format!("encode identity: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(data)
            .map_err(|e| CryptoError::SessionError(format!("corrupt identity record: {e}")))
    }
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("has_last_resort", &self.last_resort_secret.is_some())
            .field("next_prekey_id", &self.next_prekey_id)
            .finish_non_exhaustive()
    }
}

/// Reject identifiers a backend could not address safely (path separators,
/// relative components, control characters).
pub fn validate_identifier(id: &str) -> Result<(), CryptoError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(CryptoError::InvalidIdentifier(id.to_string()))
    }
}
