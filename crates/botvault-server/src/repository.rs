//! Registry of live bots: one engine and one network client per identifier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use botvault_crypto::{CryptoEngine, CryptoEngineFactory, CryptoError, PreKeyBundle};
use parking_lot::Mutex;

use crate::error::ServerError;
use crate::health::HEALTHCHECK_PREFIX;
use crate::network::{BotClient, ClientFactory};

/// One-time prekeys generated for a newly created bot.
pub const INITIAL_PREKEYS: u16 = 8;

/// A registered bot. Cheap to clone; every clone shares the same engine.
#[derive(Clone)]
pub struct BotEntry {
    engine: Arc<CryptoEngine>,
    client: Arc<dyn BotClient>,
}

impl std::fmt::Debug for BotEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotEntry").finish_non_exhaustive()
    }
}

impl BotEntry {
    pub fn engine(&self) -> &Arc<CryptoEngine> {
        &self.engine
    }

    pub fn client(&self) -> &Arc<dyn BotClient> {
        &self.client
    }
}

/// Empty while the entry is being created. Creation happens with the slot
/// locked, so callers racing on a new identifier queue on the slot instead of
/// on the whole map.
#[derive(Default)]
struct Slot {
    entry: Mutex<Option<BotEntry>>,
    /// Set once `entry` is populated, readable without waiting on a creation.
    ready: AtomicBool,
}

impl Slot {
    fn install(&self, guard: &mut Option<BotEntry>, entry: BotEntry) {
        *guard = Some(entry);
        self.ready.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<BotEntry> {
        let mut guard = self.entry.lock();
        self.ready.store(false, Ordering::Release);
        guard.take()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Consistent point-in-time list of registered identifiers. Iterate it as
/// many times as needed; later registry changes are not reflected.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    ids: Vec<String>,
}

impl RegistrySnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl IntoIterator for RegistrySnapshot {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

impl<'a> IntoIterator for &'a RegistrySnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Maps bot identifiers to their engine and client.
///
/// The map lock is only held to find or insert a slot, never across engine
/// creation or any crypto operation, so bots never wait on each other.
pub struct SessionRepository {
    factory: CryptoEngineFactory,
    clients: Arc<dyn ClientFactory>,
    bots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl SessionRepository {
    pub fn new(factory: CryptoEngineFactory, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients,
            bots: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &CryptoEngineFactory {
        &self.factory
    }

    /// Return the bot's entry, opening its engine on first access.
    ///
    /// Concurrent first accesses create exactly one engine; everyone else
    /// waits for it and receives the same instance.
    pub fn get_or_create(&self, bot_id: &str) -> Result<BotEntry, ServerError> {
        loop {
            let slot = Arc::clone(self.bots.lock().entry(bot_id.to_string()).or_default());

            let mut entry = slot.entry.lock();
            if let Some(existing) = entry.as_ref() {
                return Ok(existing.clone());
            }
            // Removed (or abandoned after a failed create) while we waited.
            if !self.is_registered(bot_id, &slot) {
                continue;
            }

            return match self.open_entry(bot_id) {
                Ok(created) => {
                    slot.install(&mut entry, created.clone());
                    tracing::info!(bot = %bot_id, "bot registered");
                    Ok(created)
                }
                Err(e) => {
                    self.unregister(bot_id, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Entry of an already registered bot. Bots still being created are
    /// reported as absent.
    pub fn get(&self, bot_id: &str) -> Option<BotEntry> {
        let slot = self.bots.lock().get(bot_id).cloned()?;
        if !slot.is_ready() {
            return None;
        }
        let entry = slot.entry.lock().clone();
        entry
    }

    /// Close the bot's engine and forget it. Persisted keys are kept.
    pub fn remove(&self, bot_id: &str) -> bool {
        let Some(slot) = self.bots.lock().remove(bot_id) else {
            return false;
        };
        let Some(entry) = slot.take() else {
            return false;
        };
        entry.engine.close();
        tracing::info!(bot = %bot_id, "bot removed");
        true
    }

    /// Remove the bot and destroy all of its key material and network state.
    ///
    /// The bot's slot stays locked until the data is gone, so a concurrent
    /// `get_or_create` waits and then starts from an empty identity instead of
    /// reopening one that is being deleted.
    pub fn purge(&self, bot_id: &str) -> Result<(), ServerError> {
        let slot = Arc::clone(self.bots.lock().entry(bot_id.to_string()).or_default());
        let mut entry = slot.entry.lock();
        slot.ready.store(false, Ordering::Release);
        if let Some(existing) = entry.take() {
            existing.engine.close();
        }
        let deleted = self
            .factory
            .store()
            .delete_all(bot_id)
            .map_err(ServerError::from)
            .and_then(|()| self.clients.forget(bot_id));
        self.unregister(bot_id, &slot);
        drop(entry);
        deleted?;
        tracing::warn!(bot = %bot_id, "bot purged");
        Ok(())
    }

    /// Identifiers registered right now. Never waits on a bot being created.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut ids: Vec<String> = self
            .bots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_ready())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        RegistrySnapshot { ids }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the bot, give it a last-resort key and a first batch of
    /// one-time prekeys, and publish them.
    pub fn create_bot(&self, bot_id: &str) -> Result<PreKeyBundle, ServerError> {
        let entry = self.get_or_create(bot_id)?;
        entry.engine.new_last_pre_key()?;
        let bundle = entry.engine.next_pre_keys(INITIAL_PREKEYS)?;
        entry.client.publish_prekeys(&bundle)?;
        tracing::info!(
            bot = %bot_id,
            prekeys = bundle.prekeys.len(),
            "bot created and prekeys published"
        );
        Ok(bundle)
    }

    /// Inbound path: decrypt an envelope `peer` sent to `bot_id`.
    pub fn decrypt(&self, bot_id: &str, peer: &str, envelope: &[u8]) -> Result<Vec<u8>, ServerError> {
        let entry = self.get_or_create(bot_id)?;
        entry.engine.decrypt(peer, envelope).map_err(|e| {
            if matches!(e, CryptoError::DecryptionFailure(_)) {
                tracing::warn!(bot = %bot_id, peer = %peer, error = %e, "dropping undecryptable envelope");
            }
            ServerError::from(e)
        })
    }

    /// Encrypt for `peer` and hand the envelope to the bot's client, first
    /// opening a session from the peer's published prekeys if there is none.
    pub fn send(&self, bot_id: &str, peer: &str, plaintext: &[u8]) -> Result<(), ServerError> {
        let entry = self.get_or_create(bot_id)?;
        if !entry.engine.has_session(peer)? {
            open_session(&entry, peer)?;
        }
        let envelope = entry.engine.encrypt(peer, plaintext)?;
        entry.client.deliver(peer, &envelope)?;
        tracing::debug!(bot = %bot_id, peer = %peer, bytes = envelope.len(), "envelope sent");
        Ok(())
    }

    /// Re-register every bot with a persisted identity. Failures are logged
    /// and skipped; returns how many bots are registered afterwards.
    pub fn restore(&self) -> Result<usize, ServerError> {
        let ids = self.factory.store().identities()?;
        for id in ids.iter().filter(|id| !id.starts_with(HEALTHCHECK_PREFIX)) {
            if let Err(e) = self.get_or_create(id) {
                tracing::error!(bot = %id, error = %e, "failed to restore bot");
            }
        }
        let restored = self.len();
        tracing::info!(restored, "bots restored from key storage");
        Ok(restored)
    }

    /// Close every engine and empty the registry.
    pub fn shutdown(&self) {
        let slots: Vec<(String, Arc<Slot>)> = self.bots.lock().drain().collect();
        for (id, slot) in slots {
            if let Some(entry) = slot.take() {
                entry.engine.close();
                tracing::debug!(bot = %id, "bot closed on shutdown");
            }
        }
    }

    fn open_entry(&self, bot_id: &str) -> Result<BotEntry, ServerError> {
        let engine = self.factory.create(bot_id)?;
        let client = self.clients.connect(bot_id)?;
        Ok(BotEntry {
            engine: Arc::new(engine),
            client,
        })
    }

    fn is_registered(&self, bot_id: &str, slot: &Arc<Slot>) -> bool {
        self.bots
            .lock()
            .get(bot_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn unregister(&self, bot_id: &str, slot: &Arc<Slot>) {
        let mut bots = self.bots.lock();
        if bots.get(bot_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            bots.remove(bot_id);
        }
    }
}

/// Start a session with `peer` from a prekey it published.
pub(crate) fn open_session(entry: &BotEntry, peer: &str) -> Result<(), ServerError> {
    let remote = entry
        .client
        .fetch_prekey(peer)?
        .ok_or_else(|| ServerError::Network(format!("{peer} has no published prekeys")))?;
    entry
        .engine
        .init_session(peer, &remote.identity_key, &remote.prekey)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use botvault_crypto::{KeyStore, MemoryKeyStore, OpenPolicy};

    use super::*;
    use crate::network::LocalNetwork;

    fn repository() -> (MemoryKeyStore, LocalNetwork, SessionRepository) {
        let store = MemoryKeyStore::new();
        let network = LocalNetwork::new();
        let factory = CryptoEngineFactory::new(Arc::new(store.clone())).with_policy(OpenPolicy::FailFast);
        let repo = SessionRepository::new(factory, Arc::new(network.clone()));
        (store, network, repo)
    }

    #[test]
    fn get_or_create_returns_the_same_engine() {
        let (_, _, repo) = repository();
        let first = repo.get_or_create("bot-1").unwrap();
        let second = repo.get_or_create("bot-1").unwrap();
        assert!(Arc::ptr_eq(first.engine(), second.engine()));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn remove_closes_engine_but_keeps_identity() {
        let (_, _, repo) = repository();
        let entry = repo.get_or_create("bot-1").unwrap();
        let identity = entry.engine().identity_key().unwrap();

        assert!(repo.remove("bot-1"));
        assert!(entry.engine().is_closed());
        assert!(!repo.remove("bot-1"));
        assert!(repo.get("bot-1").is_none());

        let reopened = repo.get_or_create("bot-1").unwrap();
        assert_eq!(reopened.engine().identity_key().unwrap(), identity);
    }

    #[test]
    fn failed_creation_leaves_no_entry() {
        let (store, _, repo) = repository();
        store.set_available(false);
        let err = repo.get_or_create("bot-1").unwrap_err();
        assert!(err.is_retryable());
        assert!(repo.is_empty());

        store.set_available(true);
        repo.get_or_create("bot-1").unwrap();
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        let (_, _, repo) = repository();
        assert!(matches!(
            repo.get_or_create("../etc"),
            Err(ServerError::Crypto(CryptoError::InvalidIdentifier(_)))
        ));
        assert!(repo.is_empty());
    }

    #[test]
    fn snapshot_is_not_a_live_view() {
        let (_, _, repo) = repository();
        repo.get_or_create("bot-b").unwrap();
        repo.get_or_create("bot-a").unwrap();

        let snapshot = repo.snapshot();
        repo.remove("bot-a");
        repo.get_or_create("bot-c").unwrap();

        let ids: Vec<&String> = snapshot.iter().collect();
        assert_eq!(ids, vec!["bot-a", "bot-b"]);
        // Restartable.
        assert_eq!(snapshot.iter().count(), 2);
        assert_eq!(repo.snapshot().into_iter().collect::<Vec<_>>(), vec!["bot-b", "bot-c"]);
    }

    #[test]
    fn create_bot_publishes_initial_prekeys() {
        let (_, network, repo) = repository();
        let bundle = repo.create_bot("bot-7").unwrap();
        assert!(bundle.last_resort.is_some());
        assert_eq!(bundle.prekeys.len(), usize::from(INITIAL_PREKEYS));
        assert_eq!(network.published_prekeys("bot-7"), usize::from(INITIAL_PREKEYS));

        // Creating again hands out fresh indices.
        let again = repo.create_bot("bot-7").unwrap();
        assert_eq!(again.prekeys[0].id, INITIAL_PREKEYS);
    }

    #[test]
    fn bots_exchange_messages_through_the_network() {
        let (_, network, repo) = repository();
        repo.create_bot("bot-1").unwrap();
        repo.create_bot("bot-2").unwrap();

        repo.send("bot-1", "bot-2", b"ping").unwrap();
        let outbox = network.take_outbox("bot-1");
        assert_eq!(outbox.len(), 1);
        assert_eq!(repo.decrypt("bot-2", "bot-1", &outbox[0].envelope).unwrap(), b"ping");

        repo.send("bot-2", "bot-1", b"pong").unwrap();
        let reply = network.take_outbox("bot-2");
        assert_eq!(repo.decrypt("bot-1", "bot-2", &reply[0].envelope).unwrap(), b"pong");
    }

    #[test]
    fn send_to_unknown_peer_is_a_network_error() {
        let (_, _, repo) = repository();
        repo.create_bot("bot-1").unwrap();
        assert!(matches!(
            repo.send("bot-1", "nobody", b"hi"),
            Err(ServerError::Network(_))
        ));
    }

    #[test]
    fn decryption_failure_is_returned_to_the_caller() {
        let (_, _, repo) = repository();
        repo.create_bot("bot-1").unwrap();
        assert!(matches!(
            repo.decrypt("bot-1", "peer-1", &[1, 2, 0, 0]),
            Err(ServerError::Crypto(CryptoError::DecryptionFailure(_)))
        ));
    }

    #[test]
    fn purge_destroys_key_material() {
        let (store, network, repo) = repository();
        let identity = repo.create_bot("bot-1").unwrap().identity_key;

        repo.purge("bot-1").unwrap();
        assert!(repo.is_empty());
        assert!(store.identities().unwrap().is_empty());
        assert_eq!(network.published_prekeys("bot-1"), 0);

        let fresh = repo.get_or_create("bot-1").unwrap();
        assert_ne!(fresh.engine().identity_key().unwrap().to_vec(), identity);
    }

    #[test]
    fn restore_skips_health_check_identities() {
        let (_, _, repo) = repository();
        let factory = repo.factory().clone();
        drop(factory.create("bot-1").unwrap());
        drop(factory.create(&format!("{HEALTHCHECK_PREFIX}dead")).unwrap());

        assert_eq!(repo.restore().unwrap(), 1);
        assert!(repo.get("bot-1").is_some());
    }

    #[test]
    fn shutdown_closes_every_engine() {
        let (_, _, repo) = repository();
        let a = repo.get_or_create("bot-a").unwrap();
        let b = repo.get_or_create("bot-b").unwrap();
        repo.shutdown();
        assert!(repo.is_empty());
        assert!(a.engine().is_closed());
        assert!(b.engine().is_closed());
        assert!(!repo.factory().is_open("bot-a"));
    }
}
