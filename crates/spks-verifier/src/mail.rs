//! Challenge mail rendering and dispatch.
//!
//! The SMTP transport sits behind the [`MailTransport`] trait so the
//! pipeline can be exercised without a mail server.

use anyhow::bail;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use spks_common::config::MailConfig;

pub const DEFAULT_SUBJECT: &str = "Public key validation";

pub const DEFAULT_TEMPLATE: &str = r#"Hello {{ name }},

You've just submitted a public key on {{ public_url }}, this requires you to validate
that the key was pushed by you, so in order to finalize the validation process you
need to enter one of the following command from the same machine you originally pushed
the key:

- if you pushed it with Singularity please enter the following command in your terminal:

singularity key push -u {{ public_auth_url }} {{ fingerprint }}

- if you pushed it with gpg tool, please enter the following command in your terminal:

curl --data-urlencode "keytext=$(gpg --armor --export {{ fingerprint }})" {{ public_auth_url }}/pks/add

---------------------
This message was sent from the public key server {{ public_url }}.

Please ignore this message if you didn't submit this key or report any abuse by responding to this message.
"#;

/// Variables exposed to the message template.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateArgs {
    pub name: String,
    pub public_url: String,
    /// Public URL with the submission token embedded as userinfo.
    pub public_auth_url: String,
    pub fingerprint: String,
}

/// Render the challenge message body from the configured template.
pub fn render_message(cfg: &MailConfig, args: &TemplateArgs) -> anyhow::Result<String> {
    let template = if cfg.message.is_empty() {
        DEFAULT_TEMPLATE
    } else {
        &cfg.message
    };
    let context = tera::Context::from_serialize(args)?;
    Ok(tera::Tera::one_off(template, &context, false)?)
}

/// A rendered mail ready for dispatch.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mail dispatch seam.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()>;
}

/// Production transport speaking SMTP via lettre.
pub struct SmtpMailer {
    config: MailConfig,
}

impl SmtpMailer {
    pub fn new(config: MailConfig) -> SmtpMailer {
        SmtpMailer { config }
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> anyhow::Result<()> {
        let host = &self.config.host;
        if host.is_empty() {
            bail!("a SMTP host server must be specified");
        }
        let port = if self.config.port == 0 {
            587
        } else {
            self.config.port
        };

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port);
        if port == 587 || port == 465 {
            let tls = TlsParameters::builder(host.clone())
                .dangerous_accept_invalid_certs(self.config.insecure_tls)
                .build()?;
            builder = builder.tls(if port == 465 {
                Tls::Wrapper(tls)
            } else {
                Tls::Required(tls)
            });
        }
        if !self.config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.user.clone(),
                self.config.password.clone(),
            ));
        }

        let message = Message::builder()
            .from(mail.from.parse::<Mailbox>()?)
            .to(mail.to.parse::<Mailbox>()?)
            .subject(mail.subject.clone())
            .body(mail.body.clone())?;

        builder.build().send(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> TemplateArgs {
        TemplateArgs {
            name: "Test0".to_string(),
            public_url: "hkp://keys.example.com".to_string(),
            public_auth_url: "hkp://token@keys.example.com".to_string(),
            fingerprint: "0011223344556677".to_string(),
        }
    }

    #[test]
    fn default_template_renders_all_variables() {
        let body = render_message(&MailConfig::default(), &args()).unwrap();
        assert!(body.starts_with("Hello Test0,"));
        assert!(body.contains("hkp://token@keys.example.com"));
        assert!(body.contains("gpg --armor --export 0011223344556677"));
        assert!(body.contains("hkp://keys.example.com"));
    }

    #[test]
    fn custom_template_overrides_the_default() {
        let cfg = MailConfig {
            message: "{{ fingerprint }} submitted by {{ name }}".to_string(),
            ..MailConfig::default()
        };
        let body = render_message(&cfg, &args()).unwrap();
        assert_eq!(body, "0011223344556677 submitted by Test0");
    }

    #[test]
    fn broken_template_is_an_error() {
        let cfg = MailConfig {
            message: "{{ unclosed".to_string(),
            ..MailConfig::default()
        };
        assert!(render_message(&cfg, &args()).is_err());
    }
}
