//! HKP textual index writer (draft-shaw-openpgp-hkp-00, section 5.2).
//!
//! ```text
//! info:1:<count>
//! pub:<fingerprint>:<algo>:<bits>:<creation>:<expiry>:<flags>
//! uid:<escaped uid>:<creation>:<expiry>:<flags>
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sequoia_openpgp as openpgp;

use openpgp::cert::amalgamation::{ValidAmalgamation, ValidateAmalgamation};
use openpgp::packet::Signature;
use openpgp::policy::StandardPolicy;
use openpgp::types::RevocationStatus;
use openpgp::{Cert, Result};
use spks_common::keyring;

/// Escaping applied to uid strings; `:` is the field separator and must
/// always be encoded.
const UID_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The self-signature steering the entity's expiry: the one bound to the
/// primary-flagged identity, or the first valid one otherwise.
fn primary_self_signature(cert: &Cert, policy: &StandardPolicy) -> Option<Signature> {
    let mut first: Option<Signature> = None;
    for ua in cert.userids() {
        let valid = match ua.clone().with_policy(policy, None) {
            Ok(valid) => valid,
            Err(_) => continue,
        };
        let signature = valid.binding_signature().clone();
        if signature.primary_userid().unwrap_or(false) {
            return Some(signature);
        }
        if first.is_none() {
            first = Some(signature);
        }
    }
    first
}

fn print_entity(out: &mut String, cert: &Cert, now: SystemTime) -> Result<()> {
    let policy = StandardPolicy::new();
    let key = cert.primary_key().key();
    let now_unix = unix(now);

    let creation = unix(key.creation_time());
    let self_sig = primary_self_signature(cert, &policy);
    let expiry = self_sig
        .as_ref()
        .and_then(|sig| sig.key_validity_period())
        .map(|lifetime| creation + lifetime.as_secs());

    let mut flags = String::new();
    if expiry.map(|at| at <= now_unix).unwrap_or(false) {
        flags.push('e');
    }
    if keyring::is_revoked(cert) {
        flags.push('r');
    }

    out.push_str(&format!(
        "pub:{}:{}:{}:{}:{}:{}\n",
        keyring::full_fingerprint(cert),
        u8::from(key.pk_algo()),
        key.mpis().bits().unwrap_or(0),
        creation,
        expiry.map(|at| at.to_string()).unwrap_or_default(),
        flags,
    ));

    for ua in cert.userids() {
        let valid = match ua.clone().with_policy(&policy, None) {
            Ok(valid) => valid,
            Err(_) => continue,
        };
        let signature = valid.binding_signature();

        let creation = signature
            .signature_creation_time()
            .map(unix)
            .unwrap_or_default();
        let expiry = signature
            .key_validity_period()
            .map(|lifetime| creation + lifetime.as_secs());

        let mut flags = String::new();
        if expiry.map(|at| at <= now_unix).unwrap_or(false) {
            flags.push('e');
        }
        if matches!(
            ua.revocation_status(&policy, None),
            RevocationStatus::Revoked(_)
        ) {
            flags.push('r');
        }

        let uid = String::from_utf8_lossy(ua.userid().value()).into_owned();
        out.push_str(&format!(
            "uid:{}:{}:{}:{}\n",
            utf8_percent_encode(&uid, UID_ESCAPE),
            creation,
            expiry.map(|at| at.to_string()).unwrap_or_default(),
            flags,
        ));
    }

    Ok(())
}

/// Serialize the textual index for the given entities.
pub fn write_index(certs: &[Cert], now: SystemTime) -> Result<String> {
    let mut out = format!("info:1:{}\n", certs.len());
    for cert in certs {
        print_entity(&mut out, cert, now)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openpgp::cert::CertBuilder;
    use std::time::Duration;

    fn test_cert(uid: &str) -> Cert {
        let (cert, _) = CertBuilder::general_purpose(None, Some(uid))
            .generate()
            .unwrap();
        cert
    }

    #[test]
    fn index_header_counts_entities() {
        let certs = vec![
            test_cert("Test0 <test0@example.com>"),
            test_cert("Test1 <test1@example.com>"),
        ];
        let index = write_index(&certs, SystemTime::now()).unwrap();
        assert!(index.starts_with("info:1:2\n"));
        assert_eq!(index.matches("pub:").count(), 2);
    }

    #[test]
    fn pub_line_carries_all_fields() {
        let cert = test_cert("Test0 <test0@example.com>");
        let index = write_index(std::slice::from_ref(&cert), SystemTime::now()).unwrap();
        let pub_line = index
            .lines()
            .find(|line| line.starts_with("pub:"))
            .unwrap();

        let fields: Vec<&str> = pub_line.split(':').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], keyring::full_fingerprint(&cert));
        assert!(fields[2].parse::<u8>().unwrap() > 0);
        assert!(fields[3].parse::<u64>().unwrap() > 0);
        assert!(fields[4].parse::<u64>().unwrap() > 0);
    }

    #[test]
    fn uid_colon_is_escaped() {
        let cert = test_cert("Test: Colon <colon@example.com>");
        let index = write_index(std::slice::from_ref(&cert), SystemTime::now()).unwrap();
        let uid_line = index
            .lines()
            .find(|line| line.starts_with("uid:"))
            .unwrap();

        assert_eq!(uid_line.split(':').count(), 5); // uid + 4 fields
        assert!(uid_line.contains("%3A"));
        assert!(uid_line.contains("colon%40example.com") || uid_line.contains("colon@example.com"));
    }

    #[test]
    fn expired_entity_is_flagged() {
        let (cert, _) = CertBuilder::general_purpose(None, Some("Short <short@example.com>"))
            .set_validity_period(Duration::from_secs(1))
            .generate()
            .unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        let index = write_index(std::slice::from_ref(&cert), later).unwrap();
        let pub_line = index
            .lines()
            .find(|line| line.starts_with("pub:"))
            .unwrap();
        let fields: Vec<&str> = pub_line.split(':').collect();
        assert!(!fields[5].is_empty(), "expiry field should be set");
        assert!(fields[6].contains('e'), "expired flag missing in {pub_line}");
    }
}
