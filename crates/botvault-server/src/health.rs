//! Liveness checks for the crypto subsystem.
//!
//! Every check runs against throwaway identities named
//! `healthcheck-<role>-<random hex>`, which never collide with tenant
//! identifiers and are deleted again when the check returns, pass or fail.
//! No check ever touches a tenant's engine or its lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use botvault_crypto::{CryptoEngineFactory, IdentityRecord, KeyStore};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Identifier prefix reserved for throwaway health-check identities.
pub const HEALTHCHECK_PREFIX: &str = "healthcheck-";

const ALICE_TO_BOB: &[u8] = b"Hello Bob, this is Alice";
const BOB_TO_ALICE: &[u8] = b"Hello Alice, Bob here";

/// Prekeys generated by the crypto checks, matching a new bot's first batch.
const CHECK_PREKEYS: u16 = 8;

/// A synchronous, bounded probe of one subsystem.
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a short description of what was verified.
    fn check(&self) -> Result<String, ServerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage, crypto and round-trip checks over `factory`'s key store.
    pub fn with_defaults(factory: &CryptoEngineFactory) -> Self {
        let mut registry = Self::new();
        registry.register(StorageCheck::new(Arc::clone(factory.store())));
        registry.register(CryptoCheck::new(factory.clone()));
        registry.register(Alice2Bob::new(factory.clone()));
        registry
    }

    pub fn register(&mut self, check: impl HealthCheck + 'static) {
        self.checks.push(Box::new(check));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn run(&self, name: &str) -> Option<HealthReport> {
        self.checks
            .iter()
            .find(|c| c.name() == name)
            .map(|c| run_check(c.as_ref()))
    }

    pub fn run_all(&self) -> BTreeMap<String, HealthReport> {
        self.checks
            .iter()
            .map(|c| (c.name().to_string(), run_check(c.as_ref())))
            .collect()
    }
}

fn run_check(check: &dyn HealthCheck) -> HealthReport {
    let started = Instant::now();
    let result = check.check();
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(message) => HealthReport {
            healthy: true,
            message,
            elapsed_ms,
        },
        Err(e) => {
            tracing::warn!(check = check.name(), error = %e, elapsed_ms, "health check failed");
            HealthReport {
                healthy: false,
                message: e.to_string(),
                elapsed_ms,
            }
        }
    }
}

/// A throwaway identifier whose key material is deleted on drop.
struct Throwaway<'a> {
    store: &'a dyn KeyStore,
    id: String,
}

impl<'a> Throwaway<'a> {
    fn new(store: &'a dyn KeyStore, role: &str) -> Self {
        let id = format!(
            "{HEALTHCHECK_PREFIX}{role}-{}",
            hex::encode(rand::random::<[u8; 8]>())
        );
        Self { store, id }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Throwaway<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete_all(&self.id) {
            tracing::warn!(id = %self.id, error = %e, "failed to delete health-check identity");
        }
    }
}

/// Full session round trip between two throwaway identities.
pub struct Alice2Bob {
    factory: CryptoEngineFactory,
}

impl Alice2Bob {
    pub fn new(factory: CryptoEngineFactory) -> Self {
        Self { factory }
    }
}

impl HealthCheck for Alice2Bob {
    fn name(&self) -> &'static str {
        "Alice2Bob"
    }

    fn check(&self) -> Result<String, ServerError> {
        let store = self.factory.store().as_ref();
        // Guards are declared first so the engines close before deletion.
        let alice_id = Throwaway::new(store, "alice");
        let bob_id = Throwaway::new(store, "bob");
        let alice = self.factory.create(alice_id.id())?;
        let bob = self.factory.create(bob_id.id())?;

        bob.new_last_pre_key()?;
        let bundle = bob.new_pre_keys(0, CHECK_PREKEYS)?;
        let prekey = bundle
            .pick()
            .ok_or_else(|| ServerError::HealthCheck("bob produced no prekeys".into()))?;
        alice.init_session(bob_id.id(), &bundle.identity_key, prekey)?;

        let envelope = alice.encrypt(bob_id.id(), ALICE_TO_BOB)?;
        if bob.decrypt(alice_id.id(), &envelope)? != ALICE_TO_BOB {
            return Err(ServerError::HealthCheck("bob decrypted the wrong plaintext".into()));
        }
        let reply = bob.encrypt(alice_id.id(), BOB_TO_ALICE)?;
        if alice.decrypt(bob_id.id(), &reply)? != BOB_TO_ALICE {
            return Err(ServerError::HealthCheck("alice decrypted the wrong plaintext".into()));
        }

        Ok("alice and bob exchanged messages".into())
    }
}

/// Key generation on a throwaway identity.
pub struct CryptoCheck {
    factory: CryptoEngineFactory,
}

impl CryptoCheck {
    pub fn new(factory: CryptoEngineFactory) -> Self {
        Self { factory }
    }
}

impl HealthCheck for CryptoCheck {
    fn name(&self) -> &'static str {
        "Crypto"
    }

    fn check(&self) -> Result<String, ServerError> {
        let id = Throwaway::new(self.factory.store().as_ref(), "crypto");
        let engine = self.factory.create(id.id())?;

        let last_resort = engine.new_last_pre_key()?;
        if engine.new_last_pre_key()? != last_resort {
            return Err(ServerError::HealthCheck("last-resort prekey changed".into()));
        }
        let bundle = engine.new_pre_keys(0, CHECK_PREKEYS)?;
        if bundle.prekeys.len() != usize::from(CHECK_PREKEYS) {
            return Err(ServerError::HealthCheck(format!(
                "expected {CHECK_PREKEYS} prekeys, got {}",
                bundle.prekeys.len()
            )));
        }
        for prekey in bundle.prekeys.iter().chain(&bundle.last_resort) {
            prekey.verify(&bundle.identity_key)?;
        }

        Ok(format!("generated last-resort and {CHECK_PREKEYS} prekeys"))
    }
}

/// Write and read back an identity record through a throwaway handle.
pub struct StorageCheck {
    store: Arc<dyn KeyStore>,
}

impl StorageCheck {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }
}

impl HealthCheck for StorageCheck {
    fn name(&self) -> &'static str {
        "Storage"
    }

    fn check(&self) -> Result<String, ServerError> {
        let id = Throwaway::new(self.store.as_ref(), "storage");
        let mut handle = self.store.open(id.id())?;

        let record = IdentityRecord::new(rand::random());
        handle.save_identity(&record)?;
        let loaded = handle.load_identity()?;
        handle.close()?;

        match loaded {
            Some(loaded) if loaded.secret_key == record.secret_key => Ok("key storage is writable".into()),
            _ => Err(ServerError::HealthCheck("identity record did not read back".into())),
        }
    }
}
