use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use botvault_crypto::{
    CryptoEngineFactory, CryptoError, FileKeyStore, KeyStore, MemoryKeyStore, OpenPolicy, StorageHandle,
};
use botvault_server::{LocalNetwork, ServerError, SessionRepository};

/// Counts storage opens and holds each one long enough for racing callers to pile up.
struct CountingStore {
    inner: MemoryKeyStore,
    opens: AtomicUsize,
}

impl KeyStore for CountingStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.inner.open(bot_id)
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        self.inner.delete_all(bot_id)
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        self.inner.identities()
    }
}

/// Blocks opening `bot-slow` until released.
struct GatedStore {
    inner: MemoryKeyStore,
    release: parking_lot::Mutex<mpsc::Receiver<()>>,
}

impl KeyStore for GatedStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        if bot_id == "bot-slow" {
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
        }
        self.inner.open(bot_id)
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        self.inner.delete_all(bot_id)
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        self.inner.identities()
    }
}

/// Holds `delete_all` until released, announcing when it starts.
struct SlowDeleteStore {
    inner: MemoryKeyStore,
    deleting: parking_lot::Mutex<mpsc::Sender<()>>,
    release: parking_lot::Mutex<mpsc::Receiver<()>>,
}

impl KeyStore for SlowDeleteStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        self.inner.open(bot_id)
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        let _ = self.deleting.lock().send(());
        let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
        self.inner.delete_all(bot_id)
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        self.inner.identities()
    }
}

#[test]
fn fifty_concurrent_first_accesses_create_one_engine() {
    let store = Arc::new(CountingStore {
        inner: MemoryKeyStore::new(),
        opens: AtomicUsize::new(0),
    });
    let repo = SessionRepository::new(
        CryptoEngineFactory::new(store.clone()).with_policy(OpenPolicy::FailFast),
        Arc::new(LocalNetwork::new()),
    );
    let barrier = Barrier::new(50);

    let entries: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..50)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    repo.get_or_create("bot-new").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(store.opens.load(Ordering::SeqCst), 1);
    let first = entries[0].engine();
    assert!(entries.iter().all(|e| Arc::ptr_eq(e.engine(), first)));
    assert_eq!(repo.len(), 1);
}

#[test]
fn slow_creation_does_not_block_other_bots() {
    let (release_tx, release_rx) = mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryKeyStore::new(),
        release: parking_lot::Mutex::new(release_rx),
    });
    let repo = SessionRepository::new(CryptoEngineFactory::new(store), Arc::new(LocalNetwork::new()));

    thread::scope(|s| {
        let slow = s.spawn(|| repo.get_or_create("bot-slow").map(|_| ()));
        thread::sleep(Duration::from_millis(50));

        repo.get_or_create("bot-fast").unwrap();
        repo.get_or_create("bot-fast").unwrap().engine().new_last_pre_key().unwrap();
        assert!(!slow.is_finished());
        // Still being created, so not yet part of a snapshot.
        assert_eq!(repo.snapshot().into_iter().collect::<Vec<_>>(), vec!["bot-fast"]);

        release_tx.send(()).unwrap();
        slow.join().unwrap().unwrap();
    });
    assert_eq!(repo.len(), 2);
}

#[test]
fn bot_7_decrypts_hello_from_peer_1() {
    let dir = tempfile::tempdir().unwrap();
    let network = LocalNetwork::new();
    let repo = SessionRepository::new(
        CryptoEngineFactory::new(Arc::new(FileKeyStore::new(dir.path()))),
        Arc::new(network.clone()),
    );

    let bot = repo.get_or_create("bot-7").unwrap();
    let last_resort = bot.engine().new_last_pre_key().unwrap();
    let bundle = bot.engine().new_pre_keys(0, 8).unwrap();
    assert_eq!(bundle.last_resort.as_ref(), Some(&last_resort));

    // The peer lives elsewhere with its own storage.
    let peer_factory = CryptoEngineFactory::new(Arc::new(MemoryKeyStore::new()));
    let peer = peer_factory.create("peer-1").unwrap();
    peer.init_session("bot-7", &bundle.identity_key, bundle.pick().unwrap())
        .unwrap();

    let hello = peer.encrypt("bot-7", b"hello").unwrap();
    assert_eq!(repo.decrypt("bot-7", "peer-1", &hello).unwrap(), b"hello");

    repo.send("bot-7", "peer-1", b"hi peer").unwrap();
    let outbox = network.take_outbox("bot-7");
    assert_eq!(outbox.len(), 1);
    assert_eq!(peer.decrypt("bot-7", &outbox[0].envelope).unwrap(), b"hi peer");
}

#[test]
fn garbled_envelope_is_dropped_without_poisoning_the_session() {
    let network = LocalNetwork::new();
    let repo = SessionRepository::new(
        CryptoEngineFactory::new(Arc::new(MemoryKeyStore::new())),
        Arc::new(network.clone()),
    );
    repo.create_bot("bot-1").unwrap();
    repo.create_bot("bot-2").unwrap();

    repo.send("bot-1", "bot-2", b"first").unwrap();
    repo.send("bot-1", "bot-2", b"second").unwrap();
    let outbox = network.take_outbox("bot-1");

    assert_eq!(repo.decrypt("bot-2", "bot-1", &outbox[0].envelope).unwrap(), b"first");

    let mut garbled = outbox[1].envelope.clone();
    let last = garbled.len() - 1;
    garbled[last] ^= 0xff;
    assert!(matches!(
        repo.decrypt("bot-2", "bot-1", &garbled),
        Err(ServerError::Crypto(CryptoError::DecryptionFailure(_)))
    ));

    assert_eq!(repo.decrypt("bot-2", "bot-1", &outbox[1].envelope).unwrap(), b"second");
}

#[test]
fn one_bad_peer_does_not_affect_other_peers_or_bots() {
    let network = LocalNetwork::new();
    let repo = SessionRepository::new(
        CryptoEngineFactory::new(Arc::new(MemoryKeyStore::new())),
        Arc::new(network.clone()),
    );
    for bot in ["bot-1", "bot-2", "bot-3"] {
        repo.create_bot(bot).unwrap();
    }

    assert!(repo.decrypt("bot-1", "mallory", b"\x01\x02garbage").is_err());

    repo.send("bot-2", "bot-1", b"from two").unwrap();
    repo.send("bot-3", "bot-1", b"from three").unwrap();
    let two = network.take_outbox("bot-2");
    let three = network.take_outbox("bot-3");
    assert_eq!(repo.decrypt("bot-1", "bot-2", &two[0].envelope).unwrap(), b"from two");
    assert_eq!(repo.decrypt("bot-1", "bot-3", &three[0].envelope).unwrap(), b"from three");
}

#[test]
fn get_or_create_is_idempotent_across_removal() {
    let dir = tempfile::tempdir().unwrap();
    let repo = SessionRepository::new(
        CryptoEngineFactory::new(Arc::new(FileKeyStore::new(dir.path()))),
        Arc::new(LocalNetwork::new()),
    );

    let identity = repo.get_or_create("bot-1").unwrap().engine().identity_key().unwrap();
    for _ in 0..3 {
        assert!(repo.remove("bot-1"));
        let entry = repo.get_or_create("bot-1").unwrap();
        assert_eq!(entry.engine().identity_key().unwrap(), identity);
    }
}

#[test]
fn reopening_waits_for_purge_to_finish() {
    let (deleting_tx, deleting_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let store = Arc::new(SlowDeleteStore {
        inner: MemoryKeyStore::new(),
        deleting: parking_lot::Mutex::new(deleting_tx),
        release: parking_lot::Mutex::new(release_rx),
    });
    let repo = SessionRepository::new(CryptoEngineFactory::new(store.clone()), Arc::new(LocalNetwork::new()));
    let purged_identity = repo.create_bot("bot-1").unwrap().identity_key;

    thread::scope(|s| {
        let purge = s.spawn(|| repo.purge("bot-1"));
        deleting_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let reopen = s.spawn(|| repo.get_or_create("bot-1").map(|entry| entry.engine().identity_key()));
        thread::sleep(Duration::from_millis(50));
        assert!(!reopen.is_finished());
        assert!(repo.get("bot-1").is_none());

        release_tx.send(()).unwrap();
        purge.join().unwrap().unwrap();
        let fresh = reopen.join().unwrap().unwrap().unwrap();
        assert_ne!(fresh.to_vec(), purged_identity);
    });

    // The identity created after the purge was not deleted with the old one.
    assert_eq!(store.identities().unwrap(), vec!["bot-1"]);
    assert_eq!(repo.snapshot().into_iter().collect::<Vec<_>>(), vec!["bot-1"]);
}
