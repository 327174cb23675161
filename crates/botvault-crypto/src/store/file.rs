//! File-backed [`KeyStore`]: one directory per bot under a shared root.
//!
//! ```text
//! <root>/<bot_id>/identity.json
//! <root>/<bot_id>/prekeys.json
//! <root>/<bot_id>/sessions/<hex(peer)>
//! <root>/<bot_id>/sessions/sha256-<hex(sha256(peer))>       (long peer names)
//! <root>/<bot_id>/sessions/sha256-<hex(sha256(peer))>.peer  (the peer name)
//! ```
//!
//! Every file is replaced through a synced temp file and a rename, so a crash
//! leaves either the old or the new content, never a torn write.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{validate_identifier, IdentityRecord, KeyStore, StorageHandle};
use crate::CryptoError;

const IDENTITY_FILE: &str = "identity.json";
const PREKEYS_FILE: &str = "prekeys.json";
const SESSIONS_DIR: &str = "sessions";
const HASHED_PREFIX: &str = "sha256-";
const PEER_EXTENSION: &str = "peer";
/// Longest hex-encoded peer used verbatim as a file name; common file
/// systems cap names at 255 bytes.
const MAX_HEX_NAME: usize = 200;

pub struct FileKeyStore {
    root: PathBuf,
}

impl FileKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bot_dir(&self, bot_id: &str) -> Result<PathBuf, CryptoError> {
        validate_identifier(bot_id)?;
        Ok(self.root.join(bot_id))
    }
}

impl KeyStore for FileKeyStore {
    fn open(&self, bot_id: &str) -> Result<Box<dyn StorageHandle>, CryptoError> {
        let dir = self.bot_dir(bot_id)?;
        std::fs::create_dir_all(dir.join(SESSIONS_DIR))
            .map_err(|e| unavailable(&format!("create {}", dir.display()), &e))?;
        tracing::debug!(bot = %bot_id, dir = %dir.display(), "opened file key storage");
        Ok(Box::new(FileHandle { dir, closed: false }))
    }

    fn delete_all(&self, bot_id: &str) -> Result<(), CryptoError> {
        let dir = self.bot_dir(bot_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&format!("remove {}", dir.display()), &e)),
        }
    }

    fn identities(&self) -> Result<Vec<String>, CryptoError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("list key store root", &e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(IDENTITY_FILE).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_identifier(name).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

struct FileHandle {
    dir: PathBuf,
    closed: bool,
}

impl FileHandle {
    fn check(&self) -> Result<(), CryptoError> {
        if self.closed {
            Err(CryptoError::StorageUnavailable(format!(
                "storage handle for {} is closed",
                self.dir.display()
            )))
        } else {
            Ok(())
        }
    }

    fn session_path(&self, peer: &str) -> PathBuf {
        self.dir.join(SESSIONS_DIR).join(session_file_name(peer))
    }

    /// Peer name behind a session file, reading the side file for hashed names.
    fn session_peer(&self, name: &str) -> Option<String> {
        if let Some(digest) = name.strip_prefix(HASHED_PREFIX) {
            if digest.contains('.') {
                return None;
            }
            let side = self.dir.join(SESSIONS_DIR).join(name).with_extension(PEER_EXTENSION);
            return std::fs::read_to_string(side).ok();
        }
        String::from_utf8(hex::decode(name).ok()?).ok()
    }

    fn load_prekey_map(&self) -> Result<BTreeMap<u16, [u8; 32]>, CryptoError> {
        let Some(data) = read_optional(&self.dir.join(PREKEYS_FILE))? else {
            return Ok(BTreeMap::new());
        };
        let encoded: BTreeMap<u16, String> = serde_json::from_slice(&data)
            .map_err(|e| CryptoError::SessionError(format!("corrupt prekey file: {e}")))?;
        encoded
            .into_iter()
            .map(|(id, secret)| -> Result<(u16, [u8; 32]), CryptoError> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(&secret, &mut bytes).map_err(|e| {
                    CryptoError::SessionError(format!("corrupt prekey {id}: {e}"))
                })?;
                Ok((id, bytes))
            })
            .collect()
    }

    fn store_prekey_map(&self, prekeys: &BTreeMap<u16, [u8; 32]>) -> Result<(), CryptoError> {
        let encoded: BTreeMap<u16, String> = prekeys
            .iter()
            .map(|(id, secret)| (*id, hex::encode(secret)))
            .collect();
        let data = serde_json::to_vec(&encoded)
            .map_err(|e| CryptoError::StorageUnavailable(format!("encode prekeys: {e}")))?;
        write_atomic(&self.dir.join(PREKEYS_FILE), &data)
    }
}

impl StorageHandle for FileHandle {
    fn load_identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        self.check()?;
        read_optional(&self.dir.join(IDENTITY_FILE))?
            .map(|data| IdentityRecord::from_bytes(&data))
            .transpose()
    }

    fn save_identity(&mut self, record: &IdentityRecord) -> Result<(), CryptoError> {
        self.check()?;
        write_atomic(&self.dir.join(IDENTITY_FILE), &record.to_bytes()?)
    }

    fn load_session(&self, peer: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.check()?;
        read_optional(&self.session_path(peer))
    }

    fn save_session(&mut self, peer: &str, state: &[u8]) -> Result<(), CryptoError> {
        self.check()?;
        let path = self.session_path(peer);
        if is_hashed(peer) {
            let side = path.with_extension(PEER_EXTENSION);
            if !side.is_file() {
                write_atomic(&side, peer.as_bytes())?;
            }
        }
        write_atomic(&path, state)
    }

    fn sessions(&self) -> Result<Vec<String>, CryptoError> {
        self.check()?;
        let entries = std::fs::read_dir(self.dir.join(SESSIONS_DIR))
            .map_err(|e| unavailable("list sessions", &e))?;
        let mut peers: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| self.session_peer(&name))
            .collect();
        peers.sort();
        Ok(peers)
    }

    fn load_prekey(&self, id: u16) -> Result<Option<[u8; 32]>, CryptoError> {
        self.check()?;
        Ok(self.load_prekey_map()?.get(&id).copied())
    }

    fn save_prekeys(&mut self, prekeys: &[(u16, [u8; 32])]) -> Result<(), CryptoError> {
        self.check()?;
        let mut map = self.load_prekey_map()?;
        map.extend(prekeys.iter().copied());
        self.store_prekey_map(&map)
    }

    fn remove_prekey(&mut self, id: u16) -> Result<(), CryptoError> {
        self.check()?;
        let mut map = self.load_prekey_map()?;
        if map.remove(&id).is_some() {
            self.store_prekey_map(&map)?;
        }
        Ok(())
    }

    fn prekey_ids(&self) -> Result<Vec<u16>, CryptoError> {
        self.check()?;
        Ok(self.load_prekey_map()?.into_keys().collect())
    }

    fn close(&mut self) -> Result<(), CryptoError> {
        self.closed = true;
        Ok(())
    }
}

fn is_hashed(peer: &str) -> bool {
    peer.len() * 2 > MAX_HEX_NAME
}

fn session_file_name(peer: &str) -> String {
    if is_hashed(peer) {
        format!("{HASHED_PREFIX}{}", hex::encode(Sha256::digest(peer.as_bytes())))
    } else {
        hex::encode(peer)
    }
}

fn unavailable(context: &str, e: &std::io::Error) -> CryptoError {
    CryptoError::StorageUnavailable(format!("{context}: {e}"))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CryptoError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(unavailable(&format!("read {}", path.display()), &e)),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    let dir = path
        .parent()
        .ok_or_else(|| CryptoError::StorageUnavailable(format!("no parent for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| unavailable("create temp file", &e))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| unavailable(&format!("write {}", path.display()), &e))?;
    tmp.persist(path)
        .map_err(|e| unavailable(&format!("replace {}", path.display()), &e.error))?;
    Ok(())
}
