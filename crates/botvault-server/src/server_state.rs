use std::sync::Arc;

use botvault_crypto::{CryptoEngineFactory, KeyStore, OpenPolicy};

use crate::health::HealthRegistry;
use crate::network::LocalNetwork;
use crate::repository::SessionRepository;

/// Central state for the daemon.
pub struct ServerState {
    /// Every live bot.
    pub repo: Arc<SessionRepository>,
    /// In-process network the bots' clients talk to.
    pub network: LocalNetwork,
    /// Liveness checks, run on demand over IPC.
    pub health: Arc<HealthRegistry>,
    /// Unix timestamp when the server started.
    pub started_at: u64,
}

impl ServerState {
    pub fn new(store: Arc<dyn KeyStore>, policy: OpenPolicy) -> Self {
        let factory = CryptoEngineFactory::new(store).with_policy(policy);
        let network = LocalNetwork::new();
        let health = HealthRegistry::with_defaults(&factory);
        let repo = SessionRepository::new(factory, Arc::new(network.clone()));
        Self {
            repo: Arc::new(repo),
            network,
            health: Arc::new(health),
            started_at: timestamp_now_secs(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        timestamp_now_secs().saturating_sub(self.started_at)
    }
}

pub fn timestamp_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
