//! Server configuration loaded from a YAML file with environment overlay.
//!
//! Precedence: `SPKS_*` environment variables > YAML file > built-in
//! defaults. The variable names are fixed by the deployment contract
//! (`SPKS_BIND_ADDRESS`, `SPKS_MAIL_HOSTNAME`, ...) rather than derived
//! from the key paths, so the overlay is applied explicitly after
//! deserialization.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use config::FileFormat;
use serde::Deserialize;

/// Default directory holding the server configuration file.
pub const CONFIG_DIR: &str = "/usr/local/etc/spks";
/// Default configuration file name.
pub const CONFIG_FILE: &str = "server.yaml";

/// Default HKP bind address.
pub const DEFAULT_ADDR: &str = "localhost:11371";

const BIND_ADDR_ENV: &str = "SPKS_BIND_ADDRESS";
const PUBLIC_URL_ENV: &str = "SPKS_PUBLIC_URL";
const SIGNING_KEY_ENV: &str = "SPKS_SIGNING_PGPKEY";
const PUBLIC_KEY_CERT_ENV: &str = "SPKS_PUBLIC_KEY_CERT";
const PRIVATE_KEY_CERT_ENV: &str = "SPKS_PRIVATE_KEY_CERT";
const ADMIN_EMAIL_ENV: &str = "SPKS_ADMIN_EMAIL";
const MAIL_IDENTITY_DOMAINS_ENV: &str = "SPKS_MAIL_IDENTITY_DOMAINS";
const MAIL_IDENTITY_VERIFICATION_ENV: &str = "SPKS_MAIL_IDENTITY_VERIFICATION";
const KEY_PUSH_RATE_LIMIT_ENV: &str = "SPKS_KEY_PUSH_RATE_LIMIT";

const MAIL_HOST_ENV: &str = "SPKS_MAIL_HOSTNAME";
const MAIL_PORT_ENV: &str = "SPKS_MAIL_PORT";
const MAIL_ADDRESS_ENV: &str = "SPKS_MAIL_ADDRESS";
const MAIL_USERNAME_ENV: &str = "SPKS_MAIL_USERNAME";
const MAIL_PASSWORD_ENV: &str = "SPKS_MAIL_PASSWORD";
const MAIL_INSECURE_ENV: &str = "SPKS_MAIL_INSECURE_TLS";
const MAIL_ALLOWED_DOMAINS_ENV: &str = "SPKS_MAIL_ALLOWED_DOMAINS";

/// TLS certificate pair, each entry a filesystem path or a base64-encoded
/// PEM blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CertificateConfig {
    pub public_key: String,
    pub private_key: String,
}

/// SMTP mailer settings for the email verification challenge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    /// From address on outgoing challenge mails.
    pub email: String,
    pub user: String,
    pub password: String,
    pub insecure_tls: bool,
    pub allowed_domains: Vec<String>,
    /// Subject line; empty falls back to the built-in default.
    pub subject: String,
    /// Tera template for the message body; empty falls back to the
    /// built-in default.
    pub message: String,
}

impl MailConfig {
    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var(MAIL_HOST_ENV) {
            self.host = host;
        }
        if let Ok(port) = env::var(MAIL_PORT_ENV) {
            self.port = port
                .parse()
                .with_context(|| format!("while parsing {MAIL_PORT_ENV}"))?;
        }
        if let Ok(email) = env::var(MAIL_ADDRESS_ENV) {
            self.email = email;
        }
        if let Ok(user) = env::var(MAIL_USERNAME_ENV) {
            self.user = user;
        }
        if let Ok(password) = env::var(MAIL_PASSWORD_ENV) {
            self.password = password;
        }
        if let Ok(insecure) = env::var(MAIL_INSECURE_ENV) {
            self.insecure_tls = insecure
                .parse()
                .with_context(|| format!("while parsing {MAIL_INSECURE_ENV}"))?;
        }
        if let Ok(domains) = env::var(MAIL_ALLOWED_DOMAINS_ENV) {
            self.allowed_domains = split_list(&domains);
        }
        Ok(())
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("host address within mail configuration is missing or empty");
        }
        if self.email.is_empty() {
            bail!("email address within mail configuration is missing or empty");
        }
        Ok(())
    }
}

/// Complete SPKS server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Base URL advertised in challenge mails; required.
    pub public_url: String,
    pub admin_email: String,
    /// Path or base64-encoded armored keyring holding the signing key.
    pub signing_pgpkey: String,
    pub certificate: CertificateConfig,
    pub mail: MailConfig,
    /// Allowed email suffixes; empty allows every domain.
    pub mail_identity_domains: Vec<String>,
    /// Toggles the email challenge predicate.
    pub mail_identity_verification: bool,
    /// `"R/P"` (requests per minutes); empty disables rate limiting.
    pub key_push_rate_limit: String,
    /// Store engine name.
    pub db: String,
    /// Engine-specific options (e.g. `dir`).
    pub db_config: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: DEFAULT_ADDR.to_string(),
            public_url: "hkp://localhost".to_string(),
            admin_email: "root@localhost".to_string(),
            signing_pgpkey: String::new(),
            certificate: CertificateConfig::default(),
            mail: MailConfig {
                host: "localhost".to_string(),
                port: 25,
                ..MailConfig::default()
            },
            mail_identity_domains: Vec::new(),
            mail_identity_verification: false,
            key_push_rate_limit: String::new(),
            db: "default".to_string(),
            db_config: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load the configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ServerConfig> {
        let cfg = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref().to_path_buf())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .build()
            .context("while reading configuration file")?;

        let mut server: ServerConfig = cfg
            .try_deserialize()
            .context("while parsing configuration file")?;
        if server.db.is_empty() {
            server.db = "default".to_string();
        }
        Ok(server)
    }

    /// Apply the `SPKS_*` environment overlay and validate the result.
    pub fn check(&mut self) -> anyhow::Result<()> {
        if let Ok(addr) = env::var(BIND_ADDR_ENV) {
            self.bind_address = addr;
        }
        if let Ok(url) = env::var(PUBLIC_URL_ENV) {
            self.public_url = url;
        }
        if let Ok(key) = env::var(SIGNING_KEY_ENV) {
            self.signing_pgpkey = key;
        }
        if let Ok(cert) = env::var(PUBLIC_KEY_CERT_ENV) {
            self.certificate.public_key = cert;
        }
        if let Ok(cert) = env::var(PRIVATE_KEY_CERT_ENV) {
            self.certificate.private_key = cert;
        }
        if let Ok(email) = env::var(ADMIN_EMAIL_ENV) {
            self.admin_email = email;
        }
        if let Ok(verification) = env::var(MAIL_IDENTITY_VERIFICATION_ENV) {
            self.mail_identity_verification = verification
                .parse()
                .with_context(|| format!("while parsing {MAIL_IDENTITY_VERIFICATION_ENV}"))?;
        }
        if let Ok(domains) = env::var(MAIL_IDENTITY_DOMAINS_ENV) {
            self.mail_identity_domains = split_list(&domains);
        }
        if let Ok(limit) = env::var(KEY_PUSH_RATE_LIMIT_ENV) {
            self.key_push_rate_limit = limit;
        }
        self.mail.apply_env()?;

        if self.admin_email.is_empty() {
            bail!("admin email address is missing or empty within configuration");
        }
        if self.public_url.is_empty() {
            bail!("configuration public-url is missing or empty");
        }
        self.mail.check()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ServerConfig::load("/nonexistent/spks/server.yaml").unwrap();
        assert_eq!(cfg.bind_address, DEFAULT_ADDR);
        assert_eq!(cfg.db, "default");
        assert_eq!(cfg.admin_email, "root@localhost");
        assert_eq!(cfg.mail.port, 25);
        assert!(!cfg.mail_identity_verification);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "bind-address: 0.0.0.0:11371\n\
             public-url: https://keys.example.com\n\
             mail-identity-domains: [example.com, example.org]\n\
             key-push-rate-limit: 2/1\n\
             db-config:\n  dir: /tmp/spks\n\
             mail:\n  host: smtp.example.com\n  port: 587\n  email: keys@example.com"
        )
        .unwrap();

        let cfg = ServerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0:11371");
        assert_eq!(cfg.public_url, "https://keys.example.com");
        assert_eq!(cfg.mail_identity_domains, vec!["example.com", "example.org"]);
        assert_eq!(cfg.key_push_rate_limit, "2/1");
        assert_eq!(cfg.db_config.get("dir").map(String::as_str), Some("/tmp/spks"));
        assert_eq!(cfg.mail.host, "smtp.example.com");
        assert_eq!(cfg.mail.port, 587);
    }

    #[test]
    fn check_rejects_empty_public_url() {
        let mut cfg = ServerConfig {
            public_url: String::new(),
            ..ServerConfig::default()
        };
        assert!(cfg.check().is_err());
    }

    #[test]
    fn split_list_trims_entries() {
        assert_eq!(
            split_list("example.com, example.org ,"),
            vec!["example.com", "example.org"]
        );
    }
}
