//! Persisted entity record.

use sequoia_openpgp::Cert;
use serde::{Deserialize, Serialize};
use spks_common::keyring;

use crate::StoreError;

/// JSON record stored per entity: the primary identity denormalized for
/// indexing plus the raw OpenPGP packet sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    pub email: String,
    pub key: Vec<u8>,
}

impl EntityRecord {
    /// Build a record from an entity. With `private`, the key bytes keep
    /// the secret material; this form is reserved for the signing
    /// namespace.
    pub fn from_cert(cert: &Cert, private: bool) -> Result<EntityRecord, StoreError> {
        let identity = keyring::primary_identity(cert).ok_or(StoreError::NoIdentity)?;
        let key = if private {
            keyring::serialize_secret(cert)?
        } else {
            keyring::serialize_public(cert)?
        };
        Ok(EntityRecord {
            name: identity.name,
            email: identity.email,
            key,
        })
    }

    /// Parse the stored packet sequence back into an entity.
    pub fn to_cert(&self) -> Result<Cert, StoreError> {
        Ok(keyring::parse_cert(&self.key)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<EntityRecord, StoreError> {
        Ok(serde_json::from_slice(data)?)
    }
}
