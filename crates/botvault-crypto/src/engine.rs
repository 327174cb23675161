use parking_lot::Mutex;
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::factory::Lease;
use crate::identity::Identity;
use crate::prekeys::{PreKey, PreKeyBundle, LAST_RESORT_PREKEY_ID};
use crate::ratchet::{Envelope, PreKeyHeader, SessionState};
use crate::store::{IdentityRecord, StorageHandle};

/// One bot's identity, prekeys and peer sessions bound to its storage.
///
/// All operations on an engine are serialized by an internal lock that is held
/// through the storage write, so a ratchet step is always persisted before the
/// next operation observes it. Obtain engines from
/// [`CryptoEngineFactory`](crate::CryptoEngineFactory), which guarantees at
/// most one open engine per bot identifier.
pub struct CryptoEngine {
    bot_id: String,
    state: Mutex<Option<EngineState>>,
}

struct EngineState {
    storage: Box<dyn StorageHandle>,
    identity: Identity,
    record: IdentityRecord,
    /// Released (and the identifier reopenable) when the state is dropped.
    _lease: Lease,
}

impl CryptoEngine {
    /// Load the bot's identity from `storage`, generating and persisting one
    /// on first use.
    pub(crate) fn open(
        bot_id: &str,
        mut storage: Box<dyn StorageHandle>,
        lease: Lease,
    ) -> Result<Self, CryptoError> {
        let record = match storage.load_identity()? {
            Some(record) => record,
            None => {
                let identity = Identity::generate();
                let record = IdentityRecord::new(*identity.secret_key_bytes());
                storage.save_identity(&record)?;
                tracing::info!(
                    bot = %bot_id,
                    identity = %identity.public_key_hex(),
                    "generated new bot identity"
                );
                record
            }
        };
        let identity = Identity::from_secret_bytes(&record.secret_key);

        Ok(Self {
            bot_id: bot_id.to_string(),
            state: Mutex::new(Some(EngineState {
                storage,
                identity,
                record,
                _lease: lease,
            })),
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Ed25519 identity public key.
    pub fn identity_key(&self) -> Result<[u8; 32], CryptoError> {
        self.with_state(|s| Ok(s.identity.public_key_bytes()))
    }

    /// Return the last-resort prekey, generating it on the first call only.
    pub fn new_last_pre_key(&self) -> Result<PreKey, CryptoError> {
        self.with_state(|s| {
            let secret = match s.record.last_resort_secret {
                Some(secret) => StaticSecret::from(secret),
                None => {
                    let secret = StaticSecret::random_from_rng(OsRng);
                    let mut record = s.record.clone();
                    record.last_resort_secret = Some(secret.to_bytes());
                    s.storage.save_identity(&record)?;
                    s.record = record;
                    tracing::debug!(bot = %self.bot_id, "generated last-resort prekey");
                    secret
                }
            };
            Ok(PreKey::from_secret(LAST_RESORT_PREKEY_ID, &secret, &s.identity))
        })
    }

    /// Generate `count` one-time prekeys with indices `start..start + count`.
    ///
    /// Indices are allocated monotonically: `start` must not be below
    /// [`next_prekey_id`](Self::next_prekey_id), and the range may not reach
    /// the reserved last-resort index.
    pub fn new_pre_keys(&self, start: u16, count: u16) -> Result<PreKeyBundle, CryptoError> {
        self.with_state(|s| self.generate_prekeys(s, start, count))
    }

    /// Generate `count` one-time prekeys starting at the next free index,
    /// reading and advancing the allocation mark under one lock.
    pub fn next_pre_keys(&self, count: u16) -> Result<PreKeyBundle, CryptoError> {
        self.with_state(|s| {
            let start = s.record.next_prekey_id;
            self.generate_prekeys(s, start, count)
        })
    }

    /// Lowest one-time prekey index not yet allocated.
    pub fn next_prekey_id(&self) -> Result<u16, CryptoError> {
        self.with_state(|s| Ok(s.record.next_prekey_id))
    }

    /// Number of one-time prekeys generated but not yet consumed by a peer.
    pub fn remaining_prekeys(&self) -> Result<usize, CryptoError> {
        self.with_state(|s| Ok(s.storage.prekey_ids()?.len()))
    }

    /// Start a session with `peer` from one of its published prekeys,
    /// replacing any previous session with that peer.
    pub fn init_session(&self, peer: &str, identity_key: &[u8], prekey: &PreKey) -> Result<(), CryptoError> {
        self.with_state(|s| {
            let mut session = SessionState::initiate(&s.identity, identity_key, prekey)?;
            if let Ok(Some(previous)) = load_session(s.storage.as_ref(), peer) {
                session.inherit_history(&previous);
            }
            s.storage.save_session(peer, &session.to_bytes())?;
            tracing::debug!(bot = %self.bot_id, peer = %peer, prekey = prekey.id, "initiated session");
            Ok(())
        })
    }

    pub fn has_session(&self, peer: &str) -> Result<bool, CryptoError> {
        self.with_state(|s| Ok(s.storage.load_session(peer)?.is_some()))
    }

    /// Peers this bot holds a session with.
    pub fn sessions(&self) -> Result<Vec<String>, CryptoError> {
        self.with_state(|s| s.storage.sessions())
    }

    /// Encrypt for `peer`, persisting the advanced ratchet before returning.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.with_state(|s| {
            let session = load_session(s.storage.as_ref(), peer)?
                .ok_or_else(|| CryptoError::SessionError(format!("no session with {peer}")))?;
            let (envelope, next) = session.seal(&s.identity.public_key_bytes(), plaintext)?;
            s.storage.save_session(peer, &next.to_bytes())?;
            Ok(envelope)
        })
    }

    /// Decrypt an envelope from `peer`, persisting the advanced ratchet before
    /// returning. On failure the stored session is left exactly as it was.
    pub fn decrypt(&self, peer: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = Envelope::parse(ciphertext)?;
        self.with_state(|s| {
            let existing = match load_session(s.storage.as_ref(), peer) {
                Ok(existing) => existing,
                // A fresh prekey message can replace an unreadable session.
                Err(e @ CryptoError::SessionError(_)) if envelope.prekey.is_some() => {
                    tracing::warn!(bot = %self.bot_id, peer = %peer, error = %e, "replacing unreadable session");
                    None
                }
                Err(e) => return Err(e),
            };

            match (existing, envelope.prekey) {
                (Some(session), Some(header)) if session.their_base_key() != &header.base_key => {
                    if session.their_identity_key() != &header.identity_key {
                        return Err(CryptoError::DecryptionFailure(format!(
                            "prekey message for {peer} comes from a different identity"
                        )));
                    }
                    if session.has_seen_base_key(&header.base_key) {
                        return Err(CryptoError::DecryptionFailure(
                            "replayed prekey message".into(),
                        ));
                    }
                    self.accept_prekey_message(s, peer, &envelope, &header, Some(&session))
                }
                (Some(session), _) => {
                    let (plaintext, next) = session.open(&envelope)?;
                    s.storage.save_session(peer, &next.to_bytes())?;
                    Ok(plaintext)
                }
                (None, Some(header)) => self.accept_prekey_message(s, peer, &envelope, &header, None),
                (None, None) => Err(CryptoError::DecryptionFailure(format!(
                    "no session with {peer}"
                ))),
            }
        })
    }

    /// Release the storage handle and the per-bot open slot. Key material is
    /// kept. Safe to call more than once.
    pub fn close(&self) {
        let Some(mut state) = self.state.lock().take() else {
            return;
        };
        if let Err(e) = state.storage.close() {
            tracing::warn!(bot = %self.bot_id, error = %e, "failed to close key storage");
        }
        drop(state);
        tracing::debug!(bot = %self.bot_id, "crypto engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    fn generate_prekeys(
        &self,
        s: &mut EngineState,
        start: u16,
        count: u16,
    ) -> Result<PreKeyBundle, CryptoError> {
        if count == 0 {
            return Err(CryptoError::InvalidRange("count must be positive".into()));
        }
        let end = u32::from(start) + u32::from(count);
        let end = u16::try_from(end).map_err(|_| {
            CryptoError::InvalidRange(format!(
                "prekeys {start}..{end} would reach the reserved last-resort index"
            ))
        })?;
        if start < s.record.next_prekey_id {
            return Err(CryptoError::InvalidRange(format!(
                "index {start} already allocated, next free index is {}",
                s.record.next_prekey_id
            )));
        }

        // Burn the indices before storing any key so a crash can never
        // lead to them being handed out twice.
        let mut record = s.record.clone();
        record.next_prekey_id = end;
        s.storage.save_identity(&record)?;
        s.record = record;

        let mut secrets = Vec::with_capacity(usize::from(count));
        let mut prekeys = Vec::with_capacity(usize::from(count));
        for id in start..end {
            let secret = StaticSecret::random_from_rng(OsRng);
            prekeys.push(PreKey::from_secret(id, &secret, &s.identity));
            secrets.push((id, secret.to_bytes()));
        }
        let saved = s.storage.save_prekeys(&secrets);
        for (_, secret) in &mut secrets {
            secret.zeroize();
        }
        saved?;

        tracing::debug!(bot = %self.bot_id, start, count, "generated one-time prekeys");
        let last_resort = s.record.last_resort_secret.map(|secret| {
            PreKey::from_secret(LAST_RESORT_PREKEY_ID, &StaticSecret::from(secret), &s.identity)
        });
        Ok(PreKeyBundle {
            identity_key: s.identity.public_key_bytes().to_vec(),
            last_resort,
            prekeys,
        })
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut EngineState) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| CryptoError::EngineClosed(self.bot_id.clone()))?;
        f(state)
    }

    /// Build the responder session for a peer's first message. Nothing is
    /// written unless the message authenticates.
    ///
    /// The one-time prekey is removed before the session is stored and put
    /// back if that write fails, so it never backs two sessions.
    fn accept_prekey_message(
        &self,
        s: &mut EngineState,
        peer: &str,
        envelope: &Envelope<'_>,
        header: &PreKeyHeader,
        previous: Option<&SessionState>,
    ) -> Result<Vec<u8>, CryptoError> {
        let last_resort = header.prekey_id == LAST_RESORT_PREKEY_ID;
        let secret = if last_resort {
            s.record.last_resort_secret
        } else {
            s.storage.load_prekey(header.prekey_id)?
        }
        .ok_or_else(|| CryptoError::DecryptionFailure(format!("unknown prekey {}", header.prekey_id)))?;

        let session = SessionState::respond(&s.identity, &StaticSecret::from(secret), header)
            .map_err(|e| CryptoError::DecryptionFailure(e.to_string()))?;
        let (plaintext, mut next) = session.open(envelope)?;
        if let Some(previous) = previous {
            next.inherit_history(previous);
        }

        if !last_resort {
            s.storage.remove_prekey(header.prekey_id)?;
        }
        if let Err(e) = s.storage.save_session(peer, &next.to_bytes()) {
            if !last_resort {
                if let Err(restore) = s.storage.save_prekeys(&[(header.prekey_id, secret)]) {
                    tracing::warn!(bot = %self.bot_id, prekey = header.prekey_id, error = %restore, "one-time prekey lost after failed session write");
                }
            }
            return Err(e);
        }
        tracing::info!(bot = %self.bot_id, peer = %peer, prekey = header.prekey_id, "session established from prekey message");
        Ok(plaintext)
    }
}

impl Drop for CryptoEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("bot_id", &self.bot_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn load_session(storage: &dyn StorageHandle, peer: &str) -> Result<Option<SessionState>, CryptoError> {
    storage
        .load_session(peer)?
        .map(|data| SessionState::from_bytes(&data))
        .transpose()
}
