pub mod engine;
pub mod error;
pub mod factory;
pub mod identity;
pub mod prekeys;
mod ratchet;
pub mod store;

pub use engine::CryptoEngine;
pub use error::CryptoError;
pub use factory::{CryptoEngineFactory, OpenPolicy};
pub use identity::Identity;
pub use prekeys::{PreKey, PreKeyBundle, LAST_RESORT_PREKEY_ID};
pub use store::{FileKeyStore, IdentityRecord, KeyStore, MemoryKeyStore, StorageHandle};
