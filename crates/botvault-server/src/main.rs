use std::sync::Arc;

use anyhow::{Context, Result};
use botvault_crypto::{FileKeyStore, KeyStore, MemoryKeyStore};
use botvault_server::config::{Config, StorageBackend};
use botvault_server::db::SqliteKeyStore;
use botvault_server::server_state::ServerState;
use botvault_server::{ipc, tasks};
use clap::Parser;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let filter = match &config.log {
        Some(directives) => tracing_subscriber::EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter {directives:?}"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "botvault_server=info,botvault_crypto=info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("botvault-server starting");

    let store = open_key_store(&config)?;
    let state = Arc::new(ServerState::new(store, config.open_policy()));

    // Bring back every bot that has keys on disk before taking traffic.
    let repo = Arc::clone(&state.repo);
    let restored = tokio::task::spawn_blocking(move || repo.restore())
        .await
        .context("restore task failed")?
        .context("failed to list persisted bots")?;

    let maintenance = config.maintenance();
    let (prekey_shutdown_tx, prekey_shutdown_rx) = mpsc::channel(1);
    tokio::spawn(tasks::prekey_loop(
        Arc::clone(&state.repo),
        maintenance,
        prekey_shutdown_rx,
    ));
    let (conversation_shutdown_tx, conversation_shutdown_rx) = mpsc::channel(1);
    tokio::spawn(tasks::conversation_loop(
        Arc::clone(&state.repo),
        maintenance,
        conversation_shutdown_rx,
    ));

    let socket_path = config.socket_path();
    let listener = ipc::bind_ipc_socket(&socket_path)
        .with_context(|| format!("failed to bind IPC socket {}", socket_path.display()))?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    tokio::spawn(ipc::serve_ipc(listener, Arc::clone(&state), shutdown_tx));

    tracing::info!(socket = %socket_path.display(), restored, "botvault-server ready");

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
    }

    tracing::info!("botvault-server shutting down");

    let _ = prekey_shutdown_tx.send(()).await;
    let _ = conversation_shutdown_tx.send(()).await;

    let repo = Arc::clone(&state.repo);
    if let Err(e) = tokio::task::spawn_blocking(move || repo.shutdown()).await {
        tracing::warn!(error = %e, "engine shutdown task failed");
    }

    let _ = std::fs::remove_file(&socket_path);

    tracing::info!("botvault-server stopped");
    Ok(())
}

fn open_key_store(config: &Config) -> Result<Arc<dyn KeyStore>> {
    let store: Arc<dyn KeyStore> = match config.storage {
        StorageBackend::File => {
            let root = config.data_dir.join("keys");
            std::fs::create_dir_all(&root)
                .with_context(|| format!("failed to create {}", root.display()))?;
            Arc::new(FileKeyStore::new(root))
        }
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)
                .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
            let path = config.data_dir.join("keys.db");
            Arc::new(SqliteKeyStore::open(&path).with_context(|| format!("failed to open {}", path.display()))?)
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory key storage: bot keys will not survive a restart");
            Arc::new(MemoryKeyStore::new())
        }
    };
    tracing::info!(backend = ?config.storage, dir = %config.data_dir.display(), "key storage ready");
    Ok(store)
}
