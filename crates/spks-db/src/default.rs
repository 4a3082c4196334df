//! Default storage engine backed by sled.
//!
//! Layout: the main tree holds JSON [`EntityRecord`]s keyed
//! `key:<shortfp>` / `sigkey:<shortfp>`; four index trees (`key:name`,
//! `key:email`, `sigkey:name`, `sigkey:email`) map the denormalized
//! identity fields back to the record key. With an empty `dir` option the
//! database is memory-only and vanishes on drop.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use parking_lot::Mutex;
use sequoia_openpgp::Cert;
use spks_common::keyring;
use tracing::debug;

use crate::{Engine, EntityRecord, KeyType, StoreError};

/// Name this engine registers under.
pub const NAME: &str = "default";

const DIR_ENV: &str = "SPKS_DBCONFIG_DIR";
const DB_FILE: &str = "db";

/// Separator between the indexed value and the record fingerprint in
/// index tree keys.
const INDEX_SEP: u8 = 0;

struct Trees {
    db: sled::Db,
    key_name: sled::Tree,
    key_email: sled::Tree,
    sigkey_name: sled::Tree,
    sigkey_email: sled::Tree,
}

impl Trees {
    fn name_index(&self, kind: KeyType) -> &sled::Tree {
        match kind {
            KeyType::PublicKey => &self.key_name,
            KeyType::SigningKey => &self.sigkey_name,
        }
    }

    fn email_index(&self, kind: KeyType) -> &sled::Tree {
        match kind {
            KeyType::PublicKey => &self.key_email,
            KeyType::SigningKey => &self.sigkey_email,
        }
    }
}

/// Sled-backed [`Engine`].
pub struct SledEngine {
    dir: String,
    trees: Option<Trees>,
    // serializes add/del so record and index trees stay consistent
    write_lock: Mutex<()>,
}

impl SledEngine {
    /// Build an engine from its `db-config` options (`dir`).
    pub fn new(options: &BTreeMap<String, String>) -> SledEngine {
        SledEngine {
            dir: options.get("dir").cloned().unwrap_or_default(),
            trees: None,
            write_lock: Mutex::new(()),
        }
    }

    fn trees(&self) -> Result<&Trees, StoreError> {
        self.trees.as_ref().ok_or(StoreError::NotConnected)
    }

    fn put_record(
        &self,
        trees: &Trees,
        kind: KeyType,
        fp: &str,
        record: &EntityRecord,
    ) -> Result<(), StoreError> {
        let key = record_key(kind, fp);
        if let Some(old) = trees.db.get(&key)? {
            let old = EntityRecord::decode(&old)?;
            trees.name_index(kind).remove(index_key(&old.name, fp))?;
            trees.email_index(kind).remove(index_key(&old.email, fp))?;
        }
        trees.db.insert(key, record.encode()?)?;
        trees
            .name_index(kind)
            .insert(index_key(&record.name, fp), fp.as_bytes())?;
        trees
            .email_index(kind)
            .insert(index_key(&record.email, fp), fp.as_bytes())?;
        Ok(())
    }

    fn remove_record(&self, trees: &Trees, kind: KeyType, fp: &str) -> Result<(), StoreError> {
        let key = record_key(kind, fp);
        if let Some(old) = trees.db.remove(&key)? {
            let old = EntityRecord::decode(&old)?;
            trees.name_index(kind).remove(index_key(&old.name, fp))?;
            trees.email_index(kind).remove(index_key(&old.email, fp))?;
        }
        Ok(())
    }

    fn record_by_fp(
        &self,
        trees: &Trees,
        kind: KeyType,
        fp: &[u8],
    ) -> Result<Option<EntityRecord>, StoreError> {
        let mut key = kind.prefix().as_bytes().to_vec();
        key.extend_from_slice(fp);
        match trees.db.get(key)? {
            Some(data) => Ok(Some(EntityRecord::decode(&data)?)),
            None => Ok(None),
        }
    }

    fn get_fingerprint(
        &self,
        trees: &Trees,
        search: &str,
        exact: bool,
        kind: KeyType,
    ) -> Result<Vec<Cert>, StoreError> {
        let needle = if search.is_empty() {
            // enumerating without a fingerprint is reserved for the
            // internal signing namespace
            if kind != KeyType::SigningKey {
                return Err(StoreError::FingerprintLength);
            }
            String::new()
        } else {
            let decoded = hex::decode(search)
                .map_err(|_| StoreError::InvalidFingerprint(search.to_string()))?;
            match decoded.len() {
                4 | 8 | 20 => search.to_ascii_uppercase(),
                _ => return Err(StoreError::FingerprintLength),
            }
        };

        if exact {
            if needle.len() < 8 {
                return Ok(Vec::new());
            }
            // records are keyed by the trailing 8 hex characters
            let short = &needle[needle.len() - 8..];
            return match self.record_by_fp(trees, kind, short.as_bytes())? {
                Some(record) => Ok(vec![record.to_cert()?]),
                None => Ok(Vec::new()),
            };
        }

        let prefix = kind.prefix().as_bytes();
        let mut certs = Vec::new();
        for item in trees.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let fp = match std::str::from_utf8(&key[prefix.len()..]) {
                Ok(fp) => fp,
                Err(_) => continue,
            };
            // suffix match: the stored short fingerprint closes any
            // longer form of the same fingerprint
            if needle.is_empty() || needle.ends_with(fp) {
                certs.push(EntityRecord::decode(&value)?.to_cert()?);
            }
        }
        Ok(certs)
    }

    fn get_text(
        &self,
        trees: &Trees,
        search: &str,
        exact: bool,
        kind: KeyType,
    ) -> Result<Vec<Cert>, StoreError> {
        if exact {
            // email index first, then name, first hit wins
            for index in [trees.email_index(kind), trees.name_index(kind)] {
                let mut prefix = search.as_bytes().to_vec();
                prefix.push(INDEX_SEP);
                if let Some(item) = index.scan_prefix(prefix).next() {
                    let (_, fp) = item?;
                    if let Some(record) = self.record_by_fp(trees, kind, &fp)? {
                        return Ok(vec![record.to_cert()?]);
                    }
                }
            }
            return Ok(Vec::new());
        }

        let mut certs = Vec::new();
        for item in trees.email_index(kind).iter() {
            let (_, fp) = item?;
            let record = match self.record_by_fp(trees, kind, &fp)? {
                Some(record) => record,
                None => continue,
            };
            if record.name.contains(search) || record.email.contains(search) {
                certs.push(record.to_cert()?);
            }
        }
        Ok(certs)
    }
}

impl Engine for SledEngine {
    fn check_config(&mut self) -> Result<(), StoreError> {
        if let Ok(dir) = env::var(DIR_ENV) {
            if !dir.is_empty() {
                self.dir = dir;
            }
        }
        if self.dir.is_empty() {
            return Ok(());
        }
        std::fs::metadata(&self.dir).map_err(|err| StoreError::BadDirectory {
            dir: self.dir.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), StoreError> {
        let db = if self.dir.is_empty() {
            debug!("opening memory-only key database");
            sled::Config::new().temporary(true).open()?
        } else {
            let path = Path::new(&self.dir).join(DB_FILE);
            debug!(path = %path.display(), "opening key database");
            sled::open(path)?
        };

        self.trees = Some(Trees {
            key_name: db.open_tree("key:name")?,
            key_email: db.open_tree("key:email")?,
            sigkey_name: db.open_tree("sigkey:name")?,
            sigkey_email: db.open_tree("sigkey:email")?,
            db,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(trees) = self.trees.as_ref() {
            trees.db.flush()?;
        }
        Ok(())
    }

    fn add(&self, certs: &[Cert]) -> Result<(), StoreError> {
        let trees = self.trees()?;
        let _guard = self.write_lock.lock();
        for cert in certs {
            let fp = keyring::short_fingerprint(cert);
            let record = EntityRecord::from_cert(cert, false)?;
            self.put_record(trees, KeyType::PublicKey, &fp, &record)?;
            // an entity with a private part is the server signing key
            if keyring::has_secret(cert) {
                let record = EntityRecord::from_cert(cert, true)?;
                self.put_record(trees, KeyType::SigningKey, &fp, &record)?;
            }
        }
        Ok(())
    }

    fn del(&self, certs: &[Cert]) -> Result<(), StoreError> {
        let trees = self.trees()?;
        let _guard = self.write_lock.lock();
        for cert in certs {
            let fp = keyring::short_fingerprint(cert);
            self.remove_record(trees, KeyType::SigningKey, &fp)?;
            self.remove_record(trees, KeyType::PublicKey, &fp)?;
        }
        Ok(())
    }

    fn get(
        &self,
        search: &str,
        is_fingerprint: bool,
        exact: bool,
        kind: KeyType,
    ) -> Result<Vec<Cert>, StoreError> {
        let trees = self.trees()?;
        if is_fingerprint {
            self.get_fingerprint(trees, search, exact, kind)
        } else {
            self.get_text(trees, search, exact, kind)
        }
    }
}

fn record_key(kind: KeyType, fp: &str) -> Vec<u8> {
    let mut key = kind.prefix().as_bytes().to_vec();
    key.extend_from_slice(fp.as_bytes());
    key
}

fn index_key(value: &str, fp: &str) -> Vec<u8> {
    let mut key = value.as_bytes().to_vec();
    key.push(INDEX_SEP);
    key.extend_from_slice(fp.as_bytes());
    key
}
