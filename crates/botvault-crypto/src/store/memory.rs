//! In-memory [`KeyStore`], for tests and ephemeral deployments.
//!
//! Data is lost on process exit. Clones share the same underlying map.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{validate_identifier, IdentityRecord, KeyStore, StorageHandle};
use crate::CryptoError;

#[derive(Default)]
struct BotRecords {
    identity: Option<IdentityRecord>,
    sessions: HashMap<String, Vec<u8>>,
    prekeys: BTreeMap<u16, [u8; 32]>,
}

type SharedBots = Arc<Mutex<HashMap<String, BotRecords>>>;

#[derive(Clone)]
pub struct MemoryKeyStore {
    bots: SharedBots,
    available: Arc<AtomicBool>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            bots: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    /// While unavailable every call fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CryptoError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CryptoError::StorageUnavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        validate_identifier(bot_id)?;
        self.check_available()?;
        self.bots.lock().entry(bot_id.to_string()).or_default();
        Ok(Box::new(MemoryHandle {
            bot_id: bot_id.to_string(),
            store: self.clone(),
            closed: false,
        }))
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        self.check_available()?;
        self.bots.lock().remove(bot_id);
        Ok(())
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        self.check_available()?;
        let mut ids: Vec<String> = self
            .bots
            .lock()
            .iter()
            .filter(|(_, records)| records.identity.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

struct MemoryHandle {
    bot_id: String,
    store: MemoryKeyStore,
    closed: bool,
}

impl MemoryHandle {
    fn read<T>(&self, f: impl FnOnce(Option<&BotRecords>) -> T) -> Result<T, CryptoError> {
        self.check()?;
        Ok(f(self.store.bots.lock().get(&self.bot_id)))
    }

    fn write(&mut self, f: impl FnOnce(&mut BotRecords)) -> Result<(), CryptoError> {
        self.check()?;
        f(self.store.bots.lock().entry(self.bot_id.clone()).or_default());
        Ok(())
    }

    fn check(&self) -> Result<(), CryptoError> {
        if self.closed {
            return Err(CryptoError::StorageUnavailable(format!(
                "storage handle for {} is closed",
                self.bot_id
            )));
        }
        self.store.check_available()
    }
}

impl StorageHandle for MemoryHandle {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        self.read(|r| r.and_then(|r| r.identity.clone()))
    }

    fn save_identity(&mut self, record: &IdentityRecord) -> Result<(), CryptoError> {
        let record = record.clone();
        self.write(|r| r.identity = Some(record))
    }

    fn load_session(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.read(|r| r.and_then(|r| r.sessions.get(peer).cloned()))
    }

    fn save_session(&mut self, peer: &str, state: &[u8]) -> Result<(), CryptoError> {
        self.write(|r| {
            r.sessions.insert(peer.to_string(), state.to_vec());
        })
    }

    fn sessions(&self) -> Result<Vec<String>, CryptoError> {
        self.read(|r| {
            let mut peers: Vec<String> = r.map(|r| r.sessions.keys().cloned().collect()).unwrap_or_default();
            peers.sort();
            peers
        })
    }

    fn load_prekey(&self, id: u16) -> Result<Option<[u8; 32]>, CryptoError> {
        self.read(|r| r.and_then(|r| r.prekeys.get(&id).copied()))
    }

    fn save_prekeys(&mut self, prekeys: &[(u16, [u8; 32])]) -> Result<(), CryptoError> {
        self.write(|r| r.prekeys.extend(prekeys.iter().copied()))
    }

    fn remove_prekey(&mut self, id: u16) -> Result<(), CryptoError> {
        self.write(|r| {
            r.prekeys.remove(&id);
        })
    }

    fn prekey_ids(&self) -> Result<Vec<u16>, CryptoError> {
        self.read(|r| r.map(|r| r.prekeys.keys().copied().collect()).unwrap_or_default())
    }

    fn close(&mut self) -> Result<(), CryptoError> {
        self.closed = true;
        Ok(())
    }
}
