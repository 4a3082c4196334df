//! The predicate catalogue of the verification pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use sequoia_openpgp::Cert;
use spks_common::keyring;
use spks_common::status::Status;
use spks_db::KeyType;
use spks_hkp::SubmitContext;
use tracing::info;
use url::Url;

use crate::mail::{self, MailTransport, TemplateArgs};
use crate::token::generate_token;
use crate::{Predicate, Submission, Verdict, VerifierState};

/// Rejects keys carrying more than one identity.
pub(crate) struct SingleIdentity;

#[async_trait]
impl Predicate for SingleIdentity {
    async fn check(
        &self,
        submission: &mut Submission,
        _existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        if keyring::identity_count(&submission.cert) != 1 {
            info!(
                fingerprint = %keyring::long_fingerprint(&submission.cert),
                "Key rejected, more than one identity"
            );
            return Verdict::Reject(Status::bad_request(&[
                "Key rejected, more than one identity",
            ]));
        }
        Verdict::Continue
    }
}

/// Accepts revoked updates of an already stored key; the commit path
/// overwrites the stored record.
pub(crate) struct Revocation;

#[async_trait]
impl Predicate for Revocation {
    async fn check(
        &self,
        submission: &mut Submission,
        existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        if keyring::is_revoked(&submission.cert) && existing.is_some() {
            // the revocation signature verified against the submitted
            // key during parsing
            info!(
                fingerprint = %keyring::long_fingerprint(&submission.cert),
                "Revoked key submitted"
            );
            return Verdict::Commit(Status::ok(&["Revoked key submitted successfully"]));
        }
        Verdict::Continue
    }
}

/// Rejects resubmission of an already stored fingerprint.
pub(crate) struct DuplicateKey;

#[async_trait]
impl Predicate for DuplicateKey {
    async fn check(
        &self,
        _submission: &mut Submission,
        existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        if existing.is_some() {
            return Verdict::Reject(Status::conflict(&["Duplicate key"]));
        }
        Verdict::Continue
    }
}

/// Completes the challenge: when the Basic-auth username matches the
/// entity's token, every identity gets signed with the server key and
/// the submission commits.
pub(crate) struct ValidSubmission {
    pub(crate) state: Arc<VerifierState>,
}

#[async_trait]
impl Predicate for ValidSubmission {
    async fn check(
        &self,
        submission: &mut Submission,
        _existing: Option<&Cert>,
        request: &SubmitContext,
    ) -> Verdict {
        let Some(token) = request.basic_username.as_deref() else {
            return Verdict::Continue;
        };

        let expected = match generate_token(
            &self.state.session_key,
            &self.state.passphrase,
            &submission.cert,
        ) {
            Ok(expected) => expected,
            Err(_) => return Verdict::Reject(Status::internal_server_error(&[
                "Token generation error",
            ])),
        };
        if token != expected {
            return Verdict::Continue;
        }

        match keyring::certify_identities(&submission.cert, &self.state.signing_key) {
            Ok(signed) => {
                submission.cert = signed;
                Verdict::Commit(Status::ok(&["Key validated and signed"]))
            }
            Err(_) => Verdict::Reject(Status::internal_server_error(&["Signing error"])),
        }
    }
}

/// Validates the identity email: primary flag, RFC 5322 syntax, domain
/// allowlist, and same-email collisions with a live key under a
/// different fingerprint (same-fingerprint duplicates were rejected
/// earlier).
pub(crate) struct EmailIdentity {
    pub(crate) state: Arc<VerifierState>,
}

#[async_trait]
impl Predicate for EmailIdentity {
    async fn check(
        &self,
        submission: &mut Submission,
        _existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        let Some(identity) = keyring::primary_identity(&submission.cert) else {
            return Verdict::Reject(Status::bad_request(&[
                "Key rejected, invalid email address",
            ]));
        };
        if !identity.is_primary {
            return Verdict::Reject(Status::bad_request(&[&format!(
                "{:?} is not the primary identity",
                identity.name
            )]));
        }

        if !validator::validate_email(&identity.email) {
            return Verdict::Reject(Status::bad_request(&[
                "Key rejected, invalid email address",
            ]));
        }

        let domains = &self.state.config.mail_identity_domains;
        if !domains.is_empty()
            && !domains.iter().any(|domain| identity.email.ends_with(domain))
        {
            return Verdict::Reject(Status::bad_request(&[
                "Key rejected, invalid email domain",
            ]));
        }

        match self
            .state
            .db
            .get(&identity.email, false, true, KeyType::PublicKey)
        {
            Err(_) => Verdict::Reject(Status::internal_server_error(&["Database error"])),
            Ok(matches) => {
                if let Some(existing) = matches.first() {
                    if !keyring::is_revoked(existing) {
                        return Verdict::Reject(Status::conflict(&[
                            "Key rejected, duplicated key identity",
                        ]));
                    }
                }
                Verdict::Continue
            }
        }
    }
}

/// Dispatches the email challenge and leaves the submission pending.
pub(crate) struct SendMail {
    pub(crate) state: Arc<VerifierState>,
    pub(crate) mailer: Arc<dyn MailTransport>,
}

#[async_trait]
impl Predicate for SendMail {
    async fn check(
        &self,
        submission: &mut Submission,
        _existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        let identity = keyring::primary_identity(&submission.cert).unwrap_or_default();

        let token = match generate_token(
            &self.state.session_key,
            &self.state.passphrase,
            &submission.cert,
        ) {
            Ok(token) => token,
            Err(_) => return Verdict::Reject(Status::internal_server_error(&[])),
        };

        let mut auth_url = match Url::parse(&self.state.config.public_url) {
            Ok(url) => url,
            Err(_) => return Verdict::Reject(Status::internal_server_error(&[])),
        };
        if auth_url.set_username(&token).is_err() {
            return Verdict::Reject(Status::internal_server_error(&[]));
        }

        let args = TemplateArgs {
            name: identity.name.clone(),
            public_url: self.state.config.public_url.clone(),
            public_auth_url: auth_url.to_string(),
            fingerprint: keyring::long_fingerprint(&submission.cert),
        };

        let body = match mail::render_message(&self.state.config.mail, &args) {
            Ok(body) => body,
            Err(_) => return Verdict::Reject(Status::internal_server_error(&[])),
        };
        let subject = if self.state.config.mail.subject.is_empty() {
            mail::DEFAULT_SUBJECT.to_string()
        } else {
            self.state.config.mail.subject.clone()
        };

        info!(to = %identity.email, "Sending public key");

        let outgoing = mail::OutgoingMail {
            from: self.state.config.mail.email.clone(),
            to: identity.email,
            subject,
            body,
        };
        if let Err(err) = self.mailer.send(&outgoing).await {
            return Verdict::Reject(Status::internal_server_error(&[&err.to_string()]));
        }

        Verdict::Pending(Status::accepted(&["validation instructions sent"]))
    }
}

/// Terminal predicate when email verification is disabled.
pub(crate) struct NoMail;

#[async_trait]
impl Predicate for NoMail {
    async fn check(
        &self,
        _submission: &mut Submission,
        _existing: Option<&Cert>,
        _request: &SubmitContext,
    ) -> Verdict {
        Verdict::Commit(Status::ok(&["Key(s) submitted successfully"]))
    }
}
