//! OpenPGP keyring helpers.
//!
//! Thin views over sequoia [`Cert`]s that the rest of the server relies
//! on: armored keyring IO, fingerprint forms, identity extraction,
//! revocation inspection, signing-key generation and identity
//! certification. The serialized byte form produced here is the canonical
//! representation stored by the database engines, so `read`/`serialize`
//! round-trips must be stable.

use sequoia_openpgp as openpgp;

use openpgp::armor;
use openpgp::cert::amalgamation::{ValidAmalgamation, ValidateAmalgamation};
use openpgp::cert::{CertBuilder, CertParser, CipherSuite};
use openpgp::packet::Packet;
use openpgp::packet::signature::SignatureBuilder;
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::{Serialize, SerializeInto};
use openpgp::types::{HashAlgorithm, KeyFlags, RevocationStatus, SignatureType};
use openpgp::{Cert, Result};

/// The primary identity of an entity, denormalized for storage indexing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    /// Whether the self-signature carries the primary-id flag.
    pub is_primary: bool,
}

/// Parse a keyring (armored or binary) into its entities.
///
/// An input containing no key material yields an empty vector only when
/// the framing itself is valid (e.g. an armored block without packets);
/// malformed input is an error.
pub fn read_keyring(data: &[u8]) -> Result<Vec<Cert>> {
    let mut certs = Vec::new();
    for cert in CertParser::from_bytes(data)? {
        certs.push(cert?);
    }
    Ok(certs)
}

/// Parse a single entity from its binary serialization.
pub fn parse_cert(data: &[u8]) -> Result<Cert> {
    Cert::from_bytes(data)
}

/// Serialize the public form of an entity (never contains secret material).
pub fn serialize_public(cert: &Cert) -> Result<Vec<u8>> {
    cert.to_vec()
}

/// Serialize an entity including its secret key material.
pub fn serialize_secret(cert: &Cert) -> Result<Vec<u8>> {
    cert.as_tsk().to_vec()
}

/// Write the entities as one armored `PGP PUBLIC KEY BLOCK`.
pub fn write_armored_keyring(certs: &[Cert]) -> Result<Vec<u8>> {
    let mut sink = Vec::new();
    let mut writer = armor::Writer::new(&mut sink, armor::Kind::PublicKey)?;
    for cert in certs {
        cert.serialize(&mut writer)?;
    }
    writer.finalize()?;
    Ok(sink)
}

/// Armored form as a string.
pub fn armored_keyring_string(certs: &[Cert]) -> Result<String> {
    let data = write_armored_keyring(certs)?;
    Ok(String::from_utf8(data)?)
}

/// Full fingerprint: 40 uppercase hex characters.
pub fn full_fingerprint(cert: &Cert) -> String {
    format!("{:X}", cert.fingerprint())
}

/// Long fingerprint: the last 8 bytes, 16 uppercase hex characters.
pub fn long_fingerprint(cert: &Cert) -> String {
    format!("{:X}", cert.keyid())
}

/// Short fingerprint: the last 4 bytes, 8 uppercase hex characters.
/// Database records are keyed by this form.
pub fn short_fingerprint(cert: &Cert) -> String {
    let full = full_fingerprint(cert);
    full[full.len() - 8..].to_string()
}

/// Does the entity carry secret key material?
pub fn has_secret(cert: &Cert) -> bool {
    cert.is_tsk()
}

/// Does the entity carry unencrypted secret material on its primary key?
pub fn has_unencrypted_secret(cert: &Cert) -> bool {
    cert.primary_key()
        .key()
        .parts_as_secret()
        .map(|key| !key.secret().is_encrypted())
        .unwrap_or(false)
}

/// Has the entity been revoked by its own key?
pub fn is_revoked(cert: &Cert) -> bool {
    let policy = StandardPolicy::new();
    matches!(
        cert.revocation_status(&policy, None),
        RevocationStatus::Revoked(_)
    )
}

/// Number of identities bound to the entity.
pub fn identity_count(cert: &Cert) -> usize {
    cert.userids().count()
}

/// The entity's primary identity: the user id flagged as primary by its
/// self-signature, or the first one otherwise. Entities without any user
/// id yield `None`.
pub fn primary_identity(cert: &Cert) -> Option<Identity> {
    let policy = StandardPolicy::new();
    let mut first: Option<Identity> = None;

    for ua in cert.userids() {
        let is_primary = ua
            .clone()
            .with_policy(&policy, None)
            .ok()
            .and_then(|valid| valid.binding_signature().primary_userid())
            .unwrap_or(false);

        let identity = Identity {
            name: ua.userid().name().ok().flatten().unwrap_or_default(),
            email: ua.userid().email().ok().flatten().unwrap_or_default(),
            is_primary,
        };

        if is_primary {
            return Some(identity);
        }
        if first.is_none() {
            first = Some(identity);
        }
    }

    first
}

/// Generate the server signing entity: 4096-bit RSA, certification and
/// signing capable, no expiry.
pub fn generate_signing_key(admin_email: &str) -> Result<Cert> {
    let (cert, _revocation) = CertBuilder::new()
        .set_cipher_suite(CipherSuite::RSA4k)
        .set_primary_key_flags(KeyFlags::empty().set_certification().set_signing())
        .add_userid(format!("Admin (Signing Key) <{admin_email}>"))
        .set_validity_period(None)
        .generate()?;
    Ok(cert)
}

/// Certify every identity of `cert` with the signing entity's primary
/// key, returning the entity with the certifications attached.
///
/// The signing entity must carry unencrypted secret material.
pub fn certify_identities(cert: &Cert, signing_key: &Cert) -> Result<Cert> {
    let mut signer = signing_key
        .primary_key()
        .key()
        .clone()
        .parts_into_secret()?
        .into_keypair()?;

    let mut certifications: Vec<Packet> = Vec::new();
    for ua in cert.userids() {
        let signature = SignatureBuilder::new(SignatureType::GenericCertification)
            .set_hash_algo(HashAlgorithm::SHA384)
            .sign_userid_binding(&mut signer, cert.primary_key().key(), ua.userid())?;
        certifications.push(signature.into());
    }

    cert.clone().insert_packets(certifications)
}
