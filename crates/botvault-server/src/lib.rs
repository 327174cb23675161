pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod ipc;
pub mod network;
pub mod repository;
pub mod server_state;
pub mod tasks;

pub use error::ServerError;
pub use health::{Alice2Bob, CryptoCheck, HealthCheck, HealthRegistry, HealthReport, StorageCheck, HEALTHCHECK_PREFIX};
pub use network::{BotClient, ClientFactory, LocalNetwork, OutboundEnvelope, RemotePreKey};
pub use repository::{BotEntry, RegistrySnapshot, SessionRepository};
pub use tasks::{MaintenanceConfig, RefreshReport, ReplenishReport};
