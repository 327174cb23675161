//! Outbound network capability consumed by the repository.
//!
//! The core only ever calls [`BotClient`]; transports plug in through a
//! [`ClientFactory`]. [`LocalNetwork`] is the in-process implementation the
//! daemon ships with: bots publish bundles into a shared directory, sealed
//! envelopes queue in per-sender outboxes until the IPC adapter drains them,
//! and conversations are plain member sets.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use botvault_crypto::{PreKey, PreKeyBundle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// A peer prekey fetched from the directory, ready for `init_session`.
#[derive(Debug, Clone)]
pub struct RemotePreKey {
    pub identity_key: Vec<u8>,
    pub prekey: PreKey,
}

/// Per-bot handle onto the network.
pub trait BotClient: Send + Sync {
    /// Hand a sealed envelope to the transport for `peer`.
    fn deliver(&self, peer: &str, envelope: &[u8]) -> Result<(), ServerError>;

    /// Make freshly generated prekeys available to peers.
    fn publish_prekeys(&self, bundle: &PreKeyBundle) -> Result<(), ServerError>;

    /// Everyone the bot currently shares a conversation with, itself excluded.
    fn conversation_members(&self) -> Result<Vec<String>, ServerError>;

    /// Claim one prekey of `peer`, or `None` if it has published nothing.
    fn fetch_prekey(&self, peer: &str) -> Result<Option<RemotePreKey>, ServerError>;
}

/// Creates the [`BotClient`] paired with each engine in the repository.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, bot_id: &str) -> Result<Arc<dyn BotClient>, ServerError>;

    /// Drop everything the network holds for a purged bot.
    fn forget(&self, _bot_id: &str) -> Result<(), ServerError> {
        Ok(())
    }
}

/// An envelope waiting to be picked up by the external transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub from: String,
    pub to: String,
    pub envelope: Vec<u8>,
}

struct PublishedBundle {
    identity_key: Vec<u8>,
    last_resort: Option<PreKey>,
    prekeys: VecDeque<PreKey>,
}

#[derive(Default)]
struct Directory {
    bundles: HashMap<String, PublishedBundle>,
    outboxes: HashMap<String, Vec<OutboundEnvelope>>,
    conversations: HashMap<String, BTreeSet<String>>,
}

/// In-process directory shared by every client it hands out.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    directory: Arc<Mutex<Directory>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` to `conversation`, creating it if needed.
    pub fn join(&self, conversation: &str, member: &str) {
        self.directory
            .lock()
            .conversations
            .entry(conversation.to_string())
            .or_default()
            .insert(member.to_string());
    }

    pub fn leave(&self, conversation: &str, member: &str) {
        let mut dir = self.directory.lock();
        if let Some(members) = dir.conversations.get_mut(conversation) {
            members.remove(member);
            if members.is_empty() {
                dir.conversations.remove(conversation);
            }
        }
    }

    /// Drain the envelopes `bot_id` has sent since the last call.
    pub fn take_outbox(&self, bot_id: &str) -> Vec<OutboundEnvelope> {
        self.directory.lock().outboxes.remove(bot_id).unwrap_or_default()
    }

    /// Unclaimed one-time prekeys `bot_id` has published.
    pub fn published_prekeys(&self, bot_id: &str) -> usize {
        self.directory
            .lock()
            .bundles
            .get(bot_id)
            .map_or(0, |b| b.prekeys.len())
    }
}

impl ClientFactory for LocalNetwork {
    fn connect(&self, bot_id: &str) -> Result<Arc<dyn BotClient>, ServerError> {
        Ok(Arc::new(LocalClient {
            bot_id: bot_id.to_string(),
            network: self.clone(),
        }))
    }

    fn forget(&self, bot_id: &str) -> Result<(), ServerError> {
        let mut dir = self.directory.lock();
        dir.bundles.remove(bot_id);
        dir.outboxes.remove(bot_id);
        dir.conversations.retain(|_, members| {
            members.remove(bot_id);
            !members.is_empty()
        });
        Ok(())
    }
}

struct LocalClient {
    bot_id: String,
    network: LocalNetwork,
}

impl BotClient for LocalClient {
    fn deliver(&self, peer: &str, envelope: &[u8]) -> Result<(), ServerError> {
        self.network
            .directory
            .lock()
            .outboxes
            .entry(self.bot_id.clone())
            .or_default()
            .push(OutboundEnvelope {
                from: self.bot_id.clone(),
                to: peer.to_string(),
                envelope: envelope.to_vec(),
            });
        Ok(())
    }

    fn publish_prekeys(&self, bundle: &PreKeyBundle) -> Result<(), ServerError> {
        let mut dir = self.network.directory.lock();
        let published = dir
            .bundles
            .entry(self.bot_id.clone())
            .or_insert_with(|| PublishedBundle {
                identity_key: bundle.identity_key.clone(),
                last_resort: None,
                prekeys: VecDeque::new(),
            });

        // A new identity under the same name invalidates everything published before.
        if published.identity_key != bundle.identity_key {
            published.identity_key.clone_from(&bundle.identity_key);
            published.last_resort = None;
            published.prekeys.clear();
        }
        if bundle.last_resort.is_some() {
            published.last_resort.clone_from(&bundle.last_resort);
        }
        for prekey in &bundle.prekeys {
            if !published.prekeys.iter().any(|p| p.id == prekey.id) {
                published.prekeys.push_back(prekey.clone());
            }
        }
        Ok(())
    }

    fn conversation_members(&self) -> Result<Vec<String>, ServerError> {
        let dir = self.network.directory.lock();
        let members: BTreeSet<&String> = dir
            .conversations
            .values()
            .filter(|members| members.contains(&self.bot_id))
            .flatten()
            .filter(|member| **member != self.bot_id)
            .collect();
        Ok(members.into_iter().cloned().collect())
    }

    fn fetch_prekey(&self, peer: &str) -> Result<Option<RemotePreKey>, ServerError> {
        let mut dir = self.network.directory.lock();
        let Some(bundle) = dir.bundles.get_mut(peer) else {
            return Ok(None);
        };
        let prekey = bundle.prekeys.pop_front().or_else(|| bundle.last_resort.clone());
        Ok(prekey.map(|prekey| RemotePreKey {
            identity_key: bundle.identity_key.clone(),
            prekey,
        }))
    }
}
