//! Deterministic submission tokens.
//!
//! The token is the MD5 digest of the submitted entity's public
//! serialization pushed through a symmetric cipher keyed by the
//! verifier's per-run secrets. Without `session_key` and `passphrase`
//! the token cannot be precomputed, and it binds to the exact bytes that
//! were submitted. Both secrets change on every server start, which
//! intentionally invalidates outstanding tokens.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use sequoia_openpgp::Cert;
use spks_common::keyring;

type Aes256Ctr = Ctr128BE<Aes256>;

pub(crate) fn generate_token(
    session_key: &[u8; 64],
    passphrase: &[u8; 64],
    cert: &Cert,
) -> anyhow::Result<String> {
    let mut data = keyring::serialize_public(cert)?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&passphrase[..32]);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&session_key[..16]);

    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut data);

    Ok(hex::encode(Md5::digest(&data)))
}
