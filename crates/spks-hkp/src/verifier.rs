//! Key verifier contract.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sequoia_openpgp::Cert;
use spks_common::status::Status;
use spks_db::Engine;

/// Request information a verifier may act on.
#[derive(Debug, Clone, Default)]
pub struct SubmitContext {
    /// Username part of HTTP Basic credentials, when supplied.
    pub basic_username: Option<String>,
    /// Resolved remote address of the submitter.
    pub remote_ip: Option<IpAddr>,
}

/// Allows the HKP server to accept or reject submitted keys based on
/// custom criteria.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Called once at server startup with the connected store.
    fn init(&mut self, db: Arc<dyn Engine>) -> anyhow::Result<()>;

    /// Inspect submitted entities and decide their fate.
    ///
    /// Returns the entities to commit together with the status to write.
    /// A `None` status is a contract violation and is surfaced to the
    /// client as an internal error. An error status, or an empty entity
    /// list with a non-error status (the pending-confirmation path),
    /// prevents the commit.
    async fn verify(&self, keys: Vec<Cert>, request: &SubmitContext)
        -> (Vec<Cert>, Option<Status>);
}
