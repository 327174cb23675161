//! `SQLite`-backed [`KeyStore`]: every bot shares one database file.

use std::path::Path;
use std::sync::Arc;

use botvault_crypto::store::validate_identifier;
use botvault_crypto::{CryptoError, IdentityRecord, KeyStore, StorageHandle};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::server_state::timestamp_now_secs;

/// Key store schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    bot_id TEXT PRIMARY KEY,
    record BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    bot_id TEXT NOT NULL,
    peer TEXT NOT NULL,
    state BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (bot_id, peer)
);

CREATE TABLE IF NOT EXISTS prekeys (
    bot_id TEXT NOT NULL,
    prekey_id INTEGER NOT NULL,
    secret BLOB NOT NULL,
    PRIMARY KEY (bot_id, prekey_id)
);
";

#[derive(Clone)]
pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    /// Open (or create) the key database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| unavailable(&format!("open {}", path.display()), &e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| unavailable("set WAL mode", &e))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, CryptoError> {
        let conn = Connection::open_in_memory().map_err(|e| unavailable("open in-memory db", &e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, CryptoError> {
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| unavailable("read schema version", &e))?;

        match current {
            0 => {
                conn.execute_batch(SCHEMA)
                    .map_err(|e| unavailable("create schema", &e))?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                    .map_err(|e| unavailable("set schema version", &e))?;
                tracing::info!(version = SCHEMA_VERSION, "created key store schema");
            }
            SCHEMA_VERSION => {}
            // Never recreate: the tables hold private keys.
            other => {
                return Err(CryptoError::StorageUnavailable(format!(
                    "key store schema version {other} is not supported (expected {SCHEMA_VERSION})"
                )));
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl KeyStore for SqliteKeyStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        validate_identifier(bot_id)?;
        Ok(Box::new(SqliteHandle {
            bot_id: bot_id.to_string(),
            conn: Arc::clone(&self.conn),
            closed: false,
        }))
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| unavailable("begin delete", &e))?;
        for table in ["identities", "sessions", "prekeys"] {
            tx.execute(&format!("DELETE FROM {table} WHERE bot_id = ?1"), params![bot_id])
                .map_err(|e| unavailable(&format!("delete from {table}"), &e))?;
        }
        tx.commit().map_err(|e| unavailable("commit delete", &e))
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT bot_id FROM identities ORDER BY bot_id")
            .map_err(|e| unavailable("list identities", &e))?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| unavailable("list identities", &e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| unavailable("list identities", &e))?;
        Ok(ids)
    }
}

struct SqliteHandle {
    bot_id: String,
    conn: Arc<Mutex<Connection>>,
    closed: bool,
}

impl SqliteHandle {
    fn check(&self) -> Result<(), CryptoError> {
        if self.closed {
            return Err(CryptoError::StorageUnavailable(format!(
                "storage handle for {} is closed",
                self.bot_id
            )));
        }
        Ok(())
    }
}

impl StorageHandle for SqliteHandle {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        self.check()?;
        let data: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT record FROM identities WHERE bot_id = ?1",
                params![self.bot_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unavailable("load identity", &e))?;
        data.map(|data| IdentityRecord::from_bytes(&data)).transpose()
    }

    fn save_identity(&mut self, record: &IdentityRecord) -> Result<(), CryptoError> {
        self.check()?;
        let data = record.to_bytes()?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO identities (bot_id, record, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bot_id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
                params![self.bot_id, data, now_secs()],
            )
            .map_err(|e| unavailable("save identity", &e))?;
        Ok(())
    }

    fn load_session(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.check()?;
        self.conn
            .lock()
            .query_row(
                "SELECT state FROM sessions WHERE bot_id = ?1 AND peer = ?2",
                params![self.bot_id, peer],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unavailable("load session", &e))
    }

    fn save_session(&mut self, peer: &str, state: &[u8]) -> Result<(), CryptoError> {
        self.check()?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO sessions (bot_id, peer, state, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(bot_id, peer) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![self.bot_id, peer, state, now_secs()],
            )
            .map_err(|e| unavailable("save session", &e))?;
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<String>, CryptoError> {
        self.check()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT peer FROM sessions WHERE bot_id = ?1 ORDER BY peer")
            .map_err(|e| unavailable("list sessions", &e))?;
        let peers = stmt
            .query_map(params![self.bot_id], |row| row.get(0))
            .map_err(|e| unavailable("list sessions", &e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| unavailable("list sessions", &e))?;
        Ok(peers)
    }

    fn load_prekey(&self, id: u16) -> Result<Option<[u8; 32]>, CryptoError> {
        self.check()?;
        let secret: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT secret FROM prekeys WHERE bot_id = ?1 AND prekey_id = ?2",
                params![self.bot_id, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unavailable("load prekey", &e))?;
        secret
            .map(|secret| {
                <[u8; 32]>::try_from(secret.as_slice())
                    .map_err(|_| CryptoError::SessionError(format!("corrupt prekey {id}")))
            })
            .transpose()
    }

    fn save_prekeys(&mut self, prekeys: &[(u16, [u8; 32])]) -> Result<(), CryptoError> {
        self.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| unavailable("begin prekeys", &e))?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO prekeys (bot_id, prekey_id, secret) VALUES (?1, ?2, ?3)")
                .map_err(|e| unavailable("save prekeys", &e))?;
            for (id, secret) in prekeys {
                stmt.execute(params![self.bot_id, id, &secret[..]])
                    .map_err(|e| unavailable("save prekeys", &e))?;
            }
        }
        tx.commit().map_err(|e| unavailable("commit prekeys", &e))
    }

    fn remove_prekey(&mut self, id: u16) -> Result<(), CryptoError> {
        self.check()?;
        self.conn
            .lock()
            .execute(
                "DELETE FROM prekeys WHERE bot_id = ?1 AND prekey_id = ?2",
                params![self.bot_id, id],
            )
            .map_err(|e| unavailable("remove prekey", &e))?;
        Ok(())
    }

    fn prekey_ids(&self) -> Result<Vec<u16>, CryptoError> {
        self.check()?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT prekey_id FROM prekeys WHERE bot_id = ?1 ORDER BY prekey_id")
            .map_err(|e| unavailable("list prekeys", &e))?;
        let ids = stmt
            .query_map(params![self.bot_id], |row| row.get(0))
            .map_err(|e| unavailable("list prekeys", &e))?
            .collect::<Result<Vec<u16>, _>>()
            .map_err(|e| unavailable("list prekeys", &e))?;
        Ok(ids)
    }

    fn close(&mut self) -> Result<(), CryptoError> {
        self.closed = true;
        Ok(())
    }
}

fn unavailable(context: &str, e: &rusqlite::Error) -> CryptoError {
    CryptoError::StorageUnavailable(format!("{context}: {e}"))
}

fn now_secs() -> i64 {
    i64::try_from(timestamp_now_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use botvault_crypto::{CryptoEngineFactory, OpenPolicy};

    use super::*;

    #[test]
    fn records_roundtrip_per_bot() {
        let store = SqliteKeyStore::in_memory().unwrap();
        let mut handle = store.open("bot-1").unwrap();
        assert!(handle.load_identity().unwrap().is_none());

        handle.save_identity(&IdentityRecord::new([3u8; 32])).unwrap();
        handle.save_session("peer-b", b"b").unwrap();
        handle.save_session("peer-a", b"a").unwrap();
        handle.save_session("peer-a", b"a2").unwrap();
        handle.save_prekeys(&[(2, [2u8; 32]), (1, [1u8; 32])]).unwrap();
        handle.remove_prekey(2).unwrap();

        assert_eq!(handle.load_identity().unwrap().unwrap().secret_key, [3u8; 32]);
        assert_eq!(handle.load_session("peer-a").unwrap().as_deref(), Some(&b"a2"[..]));
        assert_eq!(handle.sessions().unwrap(), vec!["peer-a", "peer-b"]);
        assert_eq!(handle.prekey_ids().unwrap(), vec![1]);
        assert_eq!(handle.load_prekey(1).unwrap(), Some([1u8; 32]));

        let other = store.open("bot-2").unwrap();
        assert!(other.load_session("peer-a").unwrap().is_none());
        assert_eq!(store.identities().unwrap(), vec!["bot-1"]);
    }

    #[test]
    fn delete_all_removes_only_that_bot() {
        let store = SqliteKeyStore::in_memory().unwrap();
        for id in ["bot-1", "bot-2"] {
            let mut handle = store.open(id).unwrap();
            handle.save_identity(&IdentityRecord::new([1u8; 32])).unwrap();
            handle.save_prekeys(&[(0, [0u8; 32])]).unwrap();
        }
        store.delete_all("bot-1").unwrap();
        assert_eq!(store.identities().unwrap(), vec!["bot-2"]);
        assert!(store.open("bot-1").unwrap().prekey_ids().unwrap().is_empty());
    }

    #[test]
    fn closed_handle_rejects_calls() {
        let store = SqliteKeyStore::in_memory().unwrap();
        let mut handle = store.open("bot-1").unwrap();
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(matches!(handle.sessions(), Err(CryptoError::StorageUnavailable(_))));
    }

    #[test]
    fn engine_state_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        let identity = {
            let store = SqliteKeyStore::open(&path).unwrap();
            let factory = CryptoEngineFactory::new(Arc::new(store)).with_policy(OpenPolicy::FailFast);
            let engine = factory.create("bot-7").unwrap();
            engine.new_last_pre_key().unwrap();
            engine.new_pre_keys(0, 8).unwrap();
            engine.identity_key().unwrap()
        };

        let store = SqliteKeyStore::open(&path).unwrap();
        assert_eq!(store.identities().unwrap(), vec!["bot-7"]);
        let factory = CryptoEngineFactory::new(Arc::new(store));
        let engine = factory.create("bot-7").unwrap();
        assert_eq!(engine.identity_key().unwrap(), identity);
        assert_eq!(engine.remaining_prekeys().unwrap(), 8);
        assert_eq!(engine.next_prekey_id().unwrap(), 8);
    }

    #[test]
    fn unknown_schema_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        assert!(matches!(
            SqliteKeyStore::open(&path),
            Err(CryptoError::StorageUnavailable(_))
        ));
    }
}
