use std::path::PathBuf;
use std::time::Duration;

use botvault_crypto::OpenPolicy;
use clap::{Parser, ValueEnum};

use crate::tasks::MaintenanceConfig;

/// Where bot key material is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// One directory per bot under the data directory.
    File,
    /// A single `SQLite` database in the data directory.
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "botvault-server", author, version, about = "botvault multi-tenant bot session daemon")]
pub struct Config {
    /// Directory holding key storage.
    #[arg(long, env = "BOTVAULT_DATA", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Unix socket for the IPC adapter. Defaults to botvault.sock in the temp dir.
    #[arg(long, env = "BOTVAULT_SOCKET")]
    pub socket: Option<PathBuf>,

    #[arg(long, env = "BOTVAULT_STORAGE", value_enum, default_value = "file")]
    pub storage: StorageBackend,

    /// Replenish a bot's prekeys once fewer than this remain.
    #[arg(long, env = "BOTVAULT_PREKEY_THRESHOLD", default_value_t = 20)]
    pub prekey_threshold: usize,

    /// One-time prekeys generated per replenishment.
    #[arg(
        long,
        env = "BOTVAULT_PREKEY_BATCH",
        default_value_t = 50,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub prekey_batch: u16,

    #[arg(
        long,
        env = "BOTVAULT_PREKEY_INTERVAL",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub prekey_interval_secs: u64,

    #[arg(
        long,
        env = "BOTVAULT_CONVERSATION_INTERVAL",
        default_value_t = 600,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub conversation_interval_secs: u64,

    /// How long opening a bot waits for another open engine to close. 0 fails fast.
    #[arg(long, env = "BOTVAULT_OPEN_TIMEOUT_MS", default_value_t = 5000)]
    pub open_timeout_ms: u64,

    /// Log filter, e.g. `botvault_server=debug`. Overrides `RUST_LOG`.
    #[arg(long)]
    pub log: Option<String>,
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("botvault.sock"))
    }

    pub fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            prekey_threshold: self.prekey_threshold,
            prekey_batch: self.prekey_batch,
            prekey_interval: Duration::from_secs(self.prekey_interval_secs),
            conversation_interval: Duration::from_secs(self.conversation_interval_secs),
        }
    }

    pub fn open_policy(&self) -> OpenPolicy {
        if self.open_timeout_ms == 0 {
            OpenPolicy::FailFast
        } else {
            OpenPolicy::Wait(Duration::from_millis(self.open_timeout_ms))
        }
    }
}
