//! # spks-verifier
//!
//! The submission verification pipeline: an ordered chain of predicates
//! deciding whether a submitted key commits, is rejected, or is left
//! pending an out-of-band email confirmation. Validated identities are
//! signed with the server-owned signing key.

mod checks;
pub mod mail;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use sequoia_openpgp::Cert;
use spks_common::config::ServerConfig;
use spks_common::keyring;
use spks_common::status::Status;
use spks_db::{Engine, KeyType};
use spks_hkp::{SubmitContext, Verifier};

use mail::{MailTransport, SmtpMailer};

/// Outcome of a single predicate.
pub(crate) enum Verdict {
    /// No verdict, ask the next predicate.
    Continue,
    /// Accept: write the status and commit the submission.
    Commit(Status),
    /// Refuse: write the status, nothing is committed.
    Reject(Status),
    /// Accepted for later: write the status, nothing is committed yet.
    Pending(Status),
}

/// The entity under verification. Predicates may replace the entity
/// (e.g. after signing its identities).
pub(crate) struct Submission {
    pub(crate) cert: Cert,
}

/// State shared by all predicates: configuration, store handle, signing
/// entity and the per-run secrets backing token derivation. The secrets
/// are written once at init and read-only afterwards.
pub(crate) struct VerifierState {
    pub(crate) config: ServerConfig,
    pub(crate) db: Arc<dyn Engine>,
    pub(crate) signing_key: Cert,
    pub(crate) session_key: [u8; 64],
    pub(crate) passphrase: [u8; 64],
}

#[async_trait]
pub(crate) trait Predicate: Send + Sync {
    async fn check(
        &self,
        submission: &mut Submission,
        existing: Option<&Cert>,
        request: &SubmitContext,
    ) -> Verdict;
}

/// Verifier enforcing single-identity submissions, duplicate rejection,
/// revocation acceptance, token-based proof of submission and optional
/// email-based identity verification.
pub struct MailVerifier {
    config: ServerConfig,
    signing_key: Cert,
    mailer: Arc<dyn MailTransport>,
    chain: Vec<Box<dyn Predicate>>,
    state: Option<Arc<VerifierState>>,
}

impl MailVerifier {
    /// Build a verifier dispatching challenges over SMTP.
    pub fn new(config: ServerConfig, signing_key: Cert) -> MailVerifier {
        let mailer = Arc::new(SmtpMailer::new(config.mail.clone()));
        MailVerifier::with_transport(config, signing_key, mailer)
    }

    /// Build a verifier with a custom mail transport.
    pub fn with_transport(
        config: ServerConfig,
        signing_key: Cert,
        mailer: Arc<dyn MailTransport>,
    ) -> MailVerifier {
        MailVerifier {
            config,
            signing_key,
            mailer,
            chain: Vec::new(),
            state: None,
        }
    }
}

#[async_trait]
impl Verifier for MailVerifier {
    fn init(&mut self, db: Arc<dyn Engine>) -> anyhow::Result<()> {
        let mut session_key = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut session_key);
        let mut passphrase = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut passphrase);

        let state = Arc::new(VerifierState {
            config: self.config.clone(),
            db,
            signing_key: self.signing_key.clone(),
            session_key,
            passphrase,
        });

        let mut chain: Vec<Box<dyn Predicate>> = vec![
            Box::new(checks::SingleIdentity),
            Box::new(checks::Revocation),
            Box::new(checks::DuplicateKey),
            Box::new(checks::ValidSubmission {
                state: state.clone(),
            }),
            Box::new(checks::EmailIdentity {
                state: state.clone(),
            }),
        ];
        if state.config.mail_identity_verification {
            chain.push(Box::new(checks::SendMail {
                state: state.clone(),
                mailer: self.mailer.clone(),
            }));
        } else {
            chain.push(Box::new(checks::NoMail));
        }

        self.chain = chain;
        self.state = Some(state);
        Ok(())
    }

    async fn verify(
        &self,
        keys: Vec<Cert>,
        request: &SubmitContext,
    ) -> (Vec<Cert>, Option<Status>) {
        // uninitialized verifier breaks the contract upstream
        let Some(state) = self.state.as_ref() else {
            return (Vec::new(), None);
        };

        // for simplicity only one key submission is supported
        if keys.len() > 1 {
            return (
                Vec::new(),
                Some(Status::bad_request(&["Only one key submission is supported"])),
            );
        }
        let Some(cert) = keys.into_iter().next() else {
            return (
                Vec::new(),
                Some(Status::bad_request(&["A key must be provided"])),
            );
        };

        let fingerprint = keyring::full_fingerprint(&cert);
        let existing = match state.db.get(&fingerprint, true, true, KeyType::PublicKey) {
            Err(err) => {
                return (
                    Vec::new(),
                    Some(Status::internal_server_error(&[&err.to_string()])),
                )
            }
            Ok(matches) if matches.len() > 1 => {
                return (
                    Vec::new(),
                    Some(Status::internal_server_error(&[&format!(
                        "Multiple keys found for fingerprint {fingerprint}"
                    )])),
                )
            }
            Ok(mut matches) => matches.pop(),
        };

        let mut submission = Submission { cert };
        for predicate in &self.chain {
            match predicate
                .check(&mut submission, existing.as_ref(), request)
                .await
            {
                Verdict::Continue => continue,
                Verdict::Commit(status) => return (vec![submission.cert], Some(status)),
                Verdict::Reject(status) | Verdict::Pending(status) => {
                    return (Vec::new(), Some(status))
                }
            }
        }

        // the chain ends in a terminal predicate; reaching this point is
        // a pipeline bug
        (
            Vec::new(),
            Some(Status::internal_server_error(&["Mail verification failed"])),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sequoia_openpgp::cert::CertBuilder;
    use sequoia_openpgp::packet::Packet;
    use sequoia_openpgp::types::ReasonForRevocation;
    use std::collections::BTreeMap;

    use crate::mail::OutgoingMail;
    use spks_db::default::SledEngine;

    /// Transport recording outgoing mail instead of sending it.
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()> {
            self.sent.lock().push(mail.clone());
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl MailTransport for FailingMailer {
        async fn send(&self, _mail: &OutgoingMail) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn memory_db() -> Arc<dyn Engine> {
        let mut engine = SledEngine::new(&BTreeMap::new());
        engine.connect().unwrap();
        Arc::new(engine)
    }

    fn test_cert(uid: &str) -> Cert {
        let (cert, _) = CertBuilder::general_purpose(None, Some(uid))
            .generate()
            .unwrap();
        cert
    }

    fn public(cert: &Cert) -> Cert {
        keyring::parse_cert(&keyring::serialize_public(cert).unwrap()).unwrap()
    }

    fn revoked(cert: &Cert) -> Cert {
        let mut signer = cert
            .primary_key()
            .key()
            .clone()
            .parts_into_secret()
            .unwrap()
            .into_keypair()
            .unwrap();
        let revocation = cert
            .revoke(&mut signer, ReasonForRevocation::KeyRetired, b"retired")
            .unwrap();
        cert.clone()
            .insert_packets(Some(Packet::from(revocation)))
            .unwrap()
    }

    fn config() -> ServerConfig {
        ServerConfig {
            public_url: "https://keys.example.com".to_string(),
            ..ServerConfig::default()
        }
    }

    fn verifier(config: ServerConfig, db: Arc<dyn Engine>) -> MailVerifier {
        verifier_with(config, db, Arc::new(RecordingMailer::default())).0
    }

    fn verifier_with(
        config: ServerConfig,
        db: Arc<dyn Engine>,
        mailer: Arc<dyn MailTransport>,
    ) -> (MailVerifier, Cert) {
        let signing_key = test_cert("Admin (Signing Key) <root@localhost>");
        let mut verifier = MailVerifier::with_transport(config, signing_key.clone(), mailer);
        verifier.init(db).unwrap();
        (verifier, signing_key)
    }

    #[tokio::test]
    async fn uninitialized_verifier_breaks_the_contract() {
        let verifier = MailVerifier::with_transport(
            config(),
            test_cert("Admin (Signing Key) <root@localhost>"),
            Arc::new(RecordingMailer::default()),
        );
        let (keys, status) = verifier
            .verify(vec![public(&test_cert("A <a@example.com>"))], &SubmitContext::default())
            .await;
        assert!(keys.is_empty());
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn empty_and_batch_submissions_are_rejected() {
        let verifier = verifier(config(), memory_db());

        let (keys, status) = verifier.verify(Vec::new(), &SubmitContext::default()).await;
        assert!(keys.is_empty());
        assert!(status.unwrap().is(400));

        let batch = vec![
            public(&test_cert("A <a@example.com>")),
            public(&test_cert("B <b@example.com>")),
        ];
        let (keys, status) = verifier.verify(batch, &SubmitContext::default()).await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(400));
        assert_eq!(status.message(), "Only one key submission is supported");
    }

    #[tokio::test]
    async fn multiple_identities_are_rejected() {
        let verifier = verifier(config(), memory_db());
        let (cert, _) = CertBuilder::new()
            .add_userid("One <one@example.com>")
            .add_userid("Two <two@example.com>")
            .generate()
            .unwrap();

        let (keys, status) = verifier
            .verify(vec![public(&cert)], &SubmitContext::default())
            .await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(400));
        assert_eq!(status.message(), "Key rejected, more than one identity");
    }

    #[tokio::test]
    async fn plain_submission_commits() {
        let verifier = verifier(config(), memory_db());
        let cert = public(&test_cert("Test0 <test0@example.com>"));

        let (keys, status) = verifier
            .verify(vec![cert.clone()], &SubmitContext::default())
            .await;
        let status = status.unwrap();
        assert!(status.is(200), "unexpected status: {}", status.message());
        assert_eq!(keys.len(), 1);
        assert_eq!(
            keyring::full_fingerprint(&keys[0]),
            keyring::full_fingerprint(&cert)
        );
    }

    #[tokio::test]
    async fn duplicate_fingerprint_conflicts() {
        let db = memory_db();
        let verifier = verifier(config(), db.clone());
        let cert = public(&test_cert("Test0 <test0@example.com>"));
        db.add(std::slice::from_ref(&cert)).unwrap();

        let (keys, status) = verifier
            .verify(vec![cert], &SubmitContext::default())
            .await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(409));
        assert_eq!(status.message(), "Duplicate key");
    }

    #[tokio::test]
    async fn revoked_update_of_a_stored_key_commits() {
        let db = memory_db();
        let verifier = verifier(config(), db.clone());
        let cert = test_cert("Test0 <test0@example.com>");
        db.add(std::slice::from_ref(&public(&cert))).unwrap();

        let (keys, status) = verifier
            .verify(vec![public(&revoked(&cert))], &SubmitContext::default())
            .await;
        let status = status.unwrap();
        assert!(status.is(200));
        assert_eq!(status.message(), "Revoked key submitted successfully");
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn revoked_key_without_stored_entry_continues_the_chain() {
        let verifier = verifier(config(), memory_db());
        let cert = test_cert("Test0 <test0@example.com>");

        let (keys, status) = verifier
            .verify(vec![public(&revoked(&cert))], &SubmitContext::default())
            .await;
        // no stored entry, so the revocation path does not trigger and
        // the submission falls through to a normal commit
        assert!(status.unwrap().is(200));
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn foreign_email_domains_are_rejected() {
        let cfg = ServerConfig {
            mail_identity_domains: vec!["example.com".to_string()],
            ..config()
        };
        let verifier = verifier(cfg, memory_db());

        let (keys, status) = verifier
            .verify(
                vec![public(&test_cert("K2 <k2@other.com>"))],
                &SubmitContext::default(),
            )
            .await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(400));
        assert_eq!(status.message(), "Key rejected, invalid email domain");
    }

    #[tokio::test]
    async fn same_email_under_a_different_fingerprint_conflicts() {
        let db = memory_db();
        let verifier = verifier(config(), db.clone());
        db.add(std::slice::from_ref(&public(&test_cert(
            "First <shared@example.com>",
        ))))
        .unwrap();

        let (keys, status) = verifier
            .verify(
                vec![public(&test_cert("Second <shared@example.com>"))],
                &SubmitContext::default(),
            )
            .await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(409));
        assert_eq!(status.message(), "Key rejected, duplicated key identity");
    }

    #[tokio::test]
    async fn same_email_of_a_revoked_key_is_accepted() {
        let db = memory_db();
        let verifier = verifier(config(), db.clone());
        let first = test_cert("First <shared@example.com>");
        db.add(std::slice::from_ref(&public(&revoked(&first)))).unwrap();

        let (keys, status) = verifier
            .verify(
                vec![public(&test_cert("Second <shared@example.com>"))],
                &SubmitContext::default(),
            )
            .await;
        assert!(status.unwrap().is(200));
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn email_verification_leaves_the_submission_pending() {
        let cfg = ServerConfig {
            mail_identity_verification: true,
            ..config()
        };
        let mailer = Arc::new(RecordingMailer::default());
        let (verifier, _) = verifier_with(cfg, memory_db(), mailer.clone());

        let cert = public(&test_cert("Test0 <test0@example.com>"));
        let (keys, status) = verifier
            .verify(vec![cert], &SubmitContext::default())
            .await;

        assert!(keys.is_empty(), "pending submissions must not commit");
        let status = status.unwrap();
        assert!(status.is(202));
        assert!(!status.is_error());

        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "test0@example.com");
        assert_eq!(sent[0].subject, mail::DEFAULT_SUBJECT);
        // the challenge embeds the token as URL userinfo
        assert!(sent[0].body.contains("@keys.example.com"));
    }

    #[tokio::test]
    async fn smtp_failure_surfaces_as_server_fault() {
        let cfg = ServerConfig {
            mail_identity_verification: true,
            ..config()
        };
        let (verifier, _) = verifier_with(cfg, memory_db(), Arc::new(FailingMailer));

        let (keys, status) = verifier
            .verify(
                vec![public(&test_cert("Test0 <test0@example.com>"))],
                &SubmitContext::default(),
            )
            .await;
        assert!(keys.is_empty());
        let status = status.unwrap();
        assert!(status.is(500));
        assert!(status.message().contains("connection refused"));
    }

    #[tokio::test]
    async fn token_authenticated_submission_is_signed_and_committed() {
        let cfg = ServerConfig {
            mail_identity_verification: true,
            ..config()
        };
        let (verifier, _signing_key) =
            verifier_with(cfg, memory_db(), Arc::new(RecordingMailer::default()));

        let cert = public(&test_cert("Test0 <test0@example.com>"));
        let state = verifier.state.as_ref().unwrap();
        let token =
            token_for_tests(&state.session_key, &state.passphrase, &cert);

        let request = SubmitContext {
            basic_username: Some(token),
            remote_ip: None,
        };
        let (keys, status) = verifier.verify(vec![cert.clone()], &request).await;

        let status = status.unwrap();
        assert!(status.is(200), "unexpected status: {}", status.message());
        assert_eq!(status.message(), "Key validated and signed");
        assert_eq!(keys.len(), 1);

        // the committed entity gained the server certification
        let before = keyring::serialize_public(&cert).unwrap();
        let after = keyring::serialize_public(&keys[0]).unwrap();
        assert!(after.len() > before.len());
    }

    #[tokio::test]
    async fn wrong_token_falls_back_to_the_challenge() {
        let cfg = ServerConfig {
            mail_identity_verification: true,
            ..config()
        };
        let mailer = Arc::new(RecordingMailer::default());
        let (verifier, _) = verifier_with(cfg, memory_db(), mailer.clone());

        let request = SubmitContext {
            basic_username: Some("not-the-token".to_string()),
            remote_ip: None,
        };
        let (keys, status) = verifier
            .verify(
                vec![public(&test_cert("Test0 <test0@example.com>"))],
                &request,
            )
            .await;
        assert!(keys.is_empty());
        assert!(status.unwrap().is(202));
        assert_eq!(mailer.sent.lock().len(), 1);
    }

    fn token_for_tests(session_key: &[u8; 64], passphrase: &[u8; 64], cert: &Cert) -> String {
        crate::token::generate_token(session_key, passphrase, cert).unwrap()
    }
}
