use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::engine::CryptoEngine;
use crate::error::CryptoError;
use crate::store::KeyStore;

/// Default time a `create` waits for a competing engine to close.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// What `create` does when an engine for the identifier is already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Block until the open engine closes, failing with `AlreadyOpen` only
    /// once the timeout elapses.
    Wait(Duration),
    /// Fail immediately with `AlreadyOpen`.
    FailFast,
}

impl Default for OpenPolicy {
    fn default() -> Self {
        Self::Wait(DEFAULT_OPEN_TIMEOUT)
    }
}

/// Identifiers with a live engine, shared by all clones of a factory.
#[derive(Default)]
struct OpenTable {
    open: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Proof of exclusive ownership of one identifier. Dropping it lets the
/// next `create` for that identifier proceed.
pub(crate) struct Lease {
    bot_id: String,
    table: Arc<OpenTable>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.open.lock().remove(&self.bot_id);
        self.table.released.notify_all();
    }
}

/// Opens [`CryptoEngine`]s over a [`KeyStore`], allowing at most one open
/// engine per identifier at any instant.
#[derive(Clone)]
pub struct CryptoEngineFactory {
    store: Arc<dyn KeyStore>,
    table: Arc<OpenTable>,
    policy: OpenPolicy,
}

impl CryptoEngineFactory {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            table: Arc::new(OpenTable::default()),
            policy: OpenPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OpenPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn is_open(&self, bot_id: &str) -> bool {
        self.table.open.lock().contains(bot_id)
    }

    /// Open the engine for `bot_id`, creating its identity on first use.
    pub fn create(&self, bot_id: &str) -> Result<CryptoEngine, CryptoError> {
        let lease = self.acquire(bot_id)?;
        let storage = self.store.open(bot_id)?;
        CryptoEngine::open(bot_id, storage, lease)
    }

    fn acquire(&self, bot_id: &str) -> Result<Lease, CryptoError> {
        let deadline = match self.policy {
            OpenPolicy::Wait(timeout) => Some(Instant::now() + timeout),
            OpenPolicy::FailFast => None,
        };

        let mut open = self.table.open.lock();
        while open.contains(bot_id) {
            let Some(deadline) = deadline else {
                return Err(CryptoError::AlreadyOpen(bot_id.to_string()));
            };
            tracing::debug!(bot = %bot_id, "waiting for open crypto engine to close");
            if self.table.released.wait_until(&mut open, deadline).timed_out() && open.contains(bot_id) {
                return Err(CryptoError::AlreadyOpen(bot_id.to_string()));
            }
        }
        open.insert(bot_id.to_string());

        Ok(Lease {
            bot_id: bot_id.to_string(),
            table: Arc::clone(&self.table),
        })
    }
}
