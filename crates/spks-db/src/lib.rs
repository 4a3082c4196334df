//! # spks-db
//!
//! Storage layer for the SPKS keyserver. Engines persist OpenPGP entities
//! in two logical namespaces (`key:` for public keys, `sigkey:` for the
//! server's signing key) keyed by short fingerprint, with secondary
//! indexes on the denormalized `name` and `email` fields.
//!
//! Engines are selected by name through an explicit [`EngineRegistry`]
//! built at startup, so engine wiring is testable and order-independent.

pub mod default;
mod record;

use std::collections::BTreeMap;

use sequoia_openpgp::Cert;
use thiserror::Error;

pub use record::EntityRecord;

/// Key namespace selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Public keys submitted over HKP.
    PublicKey,
    /// The server-owned signing key, stored with its private material.
    SigningKey,
}

impl KeyType {
    /// Storage key prefix for this namespace.
    pub fn prefix(self) -> &'static str {
        match self {
            KeyType::PublicKey => "key:",
            KeyType::SigningKey => "sigkey:",
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fingerprint must be either 4, 8 or 20 bytes length")]
    FingerprintLength,

    #[error("invalid fingerprint {0:?}")]
    InvalidFingerprint(String),

    #[error("no suitable identity found")]
    NoIdentity,

    #[error("database engine is not connected")]
    NotConnected,

    #[error("could not use database directory {dir}: {reason}")]
    BadDirectory { dir: String, reason: String },

    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error(transparent)]
    Record(#[from] serde_json::Error),

    #[error(transparent)]
    OpenPgp(#[from] anyhow::Error),
}

/// Contract implemented by every storage engine.
///
/// `check_config` and `connect` run once at startup before the engine is
/// shared; the remaining operations must be callable concurrently. `add`
/// and `del` are atomic per call with last-writer-wins semantics per key.
pub trait Engine: Send + Sync {
    /// Validate configuration and apply environment overrides.
    /// Fails fast on unusable directories.
    fn check_config(&mut self) -> Result<(), StoreError>;

    /// Open the backing storage and ensure the secondary indexes exist.
    fn connect(&mut self) -> Result<(), StoreError>;

    /// Flush pending writes; the backing storage closes on drop.
    fn disconnect(&self) -> Result<(), StoreError>;

    /// Store the given entities. Entities carrying private key material
    /// are additionally written to the signing namespace; this path is
    /// reserved for the server's own signing key.
    fn add(&self, certs: &[Cert]) -> Result<(), StoreError>;

    /// Remove the given entities from both namespaces. Missing records
    /// are not an error.
    fn del(&self, certs: &[Cert]) -> Result<(), StoreError>;

    /// Retrieve entities matching the search pattern.
    ///
    /// With `is_fingerprint`, `search` is a hex fingerprint of 4, 8 or 20
    /// bytes (the empty string enumerates the signing namespace). Without
    /// it, `search` is matched against the indexed `email` and `name`
    /// fields: equality with `exact`, substring otherwise.
    fn get(
        &self,
        search: &str,
        is_fingerprint: bool,
        exact: bool,
        kind: KeyType,
    ) -> Result<Vec<Cert>, StoreError>;
}

/// Factory building a configured engine from its `db-config` options.
pub type EngineFactory = fn(&BTreeMap<String, String>) -> Box<dyn Engine>;

/// Explicit name-to-factory registry of storage engines.
#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        EngineRegistry::default()
    }

    /// A registry holding the built-in engines.
    pub fn with_defaults() -> Self {
        let mut registry = EngineRegistry::new();
        registry.register(default::NAME, |options| {
            Box::new(default::SledEngine::new(options))
        });
        registry
    }

    /// Register an engine factory under a name, replacing any previous
    /// registration.
    pub fn register(&mut self, name: &str, factory: EngineFactory) {
        self.engines.insert(name.to_string(), factory);
    }

    /// Build the named engine, or `None` when unknown.
    pub fn create(
        &self,
        name: &str,
        options: &BTreeMap<String, String>,
    ) -> Option<Box<dyn Engine>> {
        self.engines.get(name).map(|factory| factory(options))
    }

    /// Registered engine names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_default_engine() {
        let registry = EngineRegistry::with_defaults();
        assert!(registry.names().any(|name| name == "default"));
        assert!(registry.create("default", &BTreeMap::new()).is_some());
        assert!(registry.create("missing", &BTreeMap::new()).is_none());
    }

    #[test]
    fn registration_is_explicit_and_overridable() {
        let mut registry = EngineRegistry::new();
        assert_eq!(registry.names().count(), 0);
        registry.register("default", |options| {
            Box::new(default::SledEngine::new(options))
        });
        assert_eq!(registry.names().count(), 1);
    }

    #[test]
    fn prefixes_select_the_namespace() {
        assert_eq!(KeyType::PublicKey.prefix(), "key:");
        assert_eq!(KeyType::SigningKey.prefix(), "sigkey:");
    }
}
