//! Scheduled maintenance over every registered bot.
//!
//! The one-shot functions are synchronous and are what the loops call on
//! each tick; they only go through the repository and engine operations, so
//! any external scheduler can drive them too.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::repository::{open_session, BotEntry, SessionRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Replenish when fewer unconsumed one-time prekeys than this remain.
    pub prekey_threshold: usize,
    /// One-time prekeys generated per replenishment.
    pub prekey_batch: u16,
    pub prekey_interval: Duration,
    pub conversation_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            prekey_threshold: 20,
            prekey_batch: 50,
            prekey_interval: Duration::from_secs(300),
            conversation_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplenishReport {
    pub checked: usize,
    pub replenished: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub checked: usize,
    pub sessions_created: usize,
    pub failed: usize,
}

/// Top up every bot whose one-time prekeys run low and publish the new batch.
///
/// Safe to run repeatedly: indices are always allocated past everything
/// already handed out, and bots above the threshold are left alone.
pub fn replenish_prekeys(repo: &SessionRepository, config: &MaintenanceConfig) -> ReplenishReport {
    let mut report = ReplenishReport::default();
    for bot_id in &repo.snapshot() {
        // Removed since the snapshot was taken.
        let Some(entry) = repo.get(bot_id) else {
            continue;
        };
        report.checked += 1;
        match replenish_bot(&entry, config) {
            Ok(true) => report.replenished += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                tracing::warn!(bot = %bot_id, error = %e, "prekey replenishment failed");
            }
        }
    }
    tracing::debug!(
        checked = report.checked,
        replenished = report.replenished,
        failed = report.failed,
        "prekey replenishment pass complete"
    );
    report
}

fn replenish_bot(entry: &BotEntry, config: &MaintenanceConfig) -> Result<bool, ServerError> {
    let engine = entry.engine();
    let remaining = engine.remaining_prekeys()?;
    if remaining >= config.prekey_threshold {
        return Ok(false);
    }
    let bundle = engine.next_pre_keys(config.prekey_batch)?;
    entry.client().publish_prekeys(&bundle)?;
    tracing::info!(
        bot = %engine.bot_id(),
        remaining,
        generated = bundle.prekeys.len(),
        "replenished one-time prekeys"
    );
    Ok(true)
}

/// Make sure every bot has a session with everyone it shares a conversation
/// with. Membership itself lives in the network layer.
pub fn refresh_conversations(repo: &SessionRepository) -> RefreshReport {
    let mut report = RefreshReport::default();
    for bot_id in &repo.snapshot() {
        let Some(entry) = repo.get(bot_id) else {
            continue;
        };
        report.checked += 1;

        let members = match entry.client().conversation_members() {
            Ok(members) => members,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(bot = %bot_id, error = %e, "failed to fetch conversation members");
                continue;
            }
        };
        for member in &members {
            match ensure_session(&entry, member) {
                Ok(true) => report.sessions_created += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(bot = %bot_id, peer = %member, error = %e, "failed to open session");
                }
            }
        }
    }
    tracing::debug!(
        checked = report.checked,
        sessions_created = report.sessions_created,
        failed = report.failed,
        "conversation refresh pass complete"
    );
    report
}

fn ensure_session(entry: &BotEntry, peer: &str) -> Result<bool, ServerError> {
    if entry.engine().has_session(peer)? {
        return Ok(false);
    }
    open_session(entry, peer)?;
    Ok(true)
}

/// Periodically replenish prekeys until `shutdown_rx` fires.
pub async fn prekey_loop(
    repo: Arc<SessionRepository>,
    config: MaintenanceConfig,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(config.prekey_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let repo = Arc::clone(&repo);
                let result = tokio::task::spawn_blocking(move || replenish_prekeys(&repo, &config)).await;
                match result {
                    Ok(report) if report.replenished > 0 || report.failed > 0 => {
                        tracing::info!(
                            replenished = report.replenished,
                            failed = report.failed,
                            "prekey maintenance tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "prekey maintenance task panicked"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("prekey maintenance loop shutting down");
                break;
            }
        }
    }
}

/// Periodically refresh conversation sessions until `shutdown_rx` fires.
pub async fn conversation_loop(
    repo: Arc<SessionRepository>,
    config: MaintenanceConfig,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(config.conversation_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let repo = Arc::clone(&repo);
                let result = tokio::task::spawn_blocking(move || refresh_conversations(&repo)).await;
                match result {
                    Ok(report) if report.sessions_created > 0 || report.failed > 0 => {
                        tracing::info!(
                            sessions_created = report.sessions_created,
                            failed = report.failed,
                            "conversation refresh tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "conversation refresh task panicked"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("conversation refresh loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use botvault_crypto::{CryptoEngineFactory, MemoryKeyStore};

    use super::*;
    use crate::network::LocalNetwork;
    use crate::repository::INITIAL_PREKEYS;

    fn repository() -> (LocalNetwork, Arc<SessionRepository>) {
        let network = LocalNetwork::new();
        let factory = CryptoEngineFactory::new(Arc::new(MemoryKeyStore::new()));
        let repo = SessionRepository::new(factory, Arc::new(network.clone()));
        (network, Arc::new(repo))
    }

    fn config(threshold: usize, batch: u16) -> MaintenanceConfig {
        MaintenanceConfig {
            prekey_threshold: threshold,
            prekey_batch: batch,
            prekey_interval: Duration::from_millis(10),
            conversation_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn replenishes_only_bots_below_threshold() {
        let (network, repo) = repository();
        repo.create_bot("bot-low").unwrap();
        repo.create_bot("bot-high").unwrap();
        repo.get("bot-high").unwrap().engine().next_pre_keys(30).unwrap();

        let report = replenish_prekeys(&repo, &config(20, 50));
        assert_eq!(
            report,
            ReplenishReport {
                checked: 2,
                replenished: 1,
                failed: 0
            }
        );
        let low = repo.get("bot-low").unwrap();
        assert_eq!(low.engine().remaining_prekeys().unwrap(), usize::from(INITIAL_PREKEYS) + 50);
        assert_eq!(network.published_prekeys("bot-low"), usize::from(INITIAL_PREKEYS) + 50);

        // Second pass finds nothing to do and never reuses an index.
        let next = low.engine().next_prekey_id().unwrap();
        assert_eq!(replenish_prekeys(&repo, &config(20, 50)).replenished, 0);
        assert_eq!(low.engine().next_prekey_id().unwrap(), next);
    }

    #[test]
    fn exhausted_index_space_is_counted_as_failure() {
        let (_, repo) = repository();
        let entry = repo.get_or_create("bot-1").unwrap();
        // Allocates the very last one-time index.
        entry.engine().new_pre_keys(u16::MAX - 1, 1).unwrap();

        let report = replenish_prekeys(&repo, &config(usize::MAX, 1));
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn refresh_opens_sessions_with_conversation_members() {
        let (network, repo) = repository();
        repo.create_bot("bot-1").unwrap();
        repo.create_bot("bot-2").unwrap();
        network.join("room", "bot-1");
        network.join("room", "bot-2");
        network.join("room", "peer-without-keys");

        let report = refresh_conversations(&repo);
        assert_eq!(report.checked, 2);
        assert_eq!(report.sessions_created, 2);
        assert_eq!(report.failed, 2);
        assert!(repo.get("bot-1").unwrap().engine().has_session("bot-2").unwrap());

        let again = refresh_conversations(&repo);
        assert_eq!(again.sessions_created, 0);
    }

    #[tokio::test]
    async fn prekey_loop_runs_until_shutdown() {
        let (network, repo) = repository();
        repo.create_bot("bot-1").unwrap();

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(prekey_loop(Arc::clone(&repo), config(20, 50), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();

        assert_eq!(network.published_prekeys("bot-1"), usize::from(INITIAL_PREKEYS) + 50);
    }

    #[tokio::test]
    async fn conversation_loop_runs_until_shutdown() {
        let (network, repo) = repository();
        repo.create_bot("bot-1").unwrap();
        repo.create_bot("bot-2").unwrap();
        network.join("room", "bot-1");
        network.join("room", "bot-2");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(conversation_loop(Arc::clone(&repo), config(20, 50), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();

        assert!(repo.get("bot-2").unwrap().engine().has_session("bot-1").unwrap());
    }
}
