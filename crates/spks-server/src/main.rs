//! # spks
//!
//! Signing public keyserver: accepts OpenPGP key submissions over HKP,
//! optionally verifies that the submitter controls the advertised email
//! identity, signs validated identities with a server-owned key, and
//! serves lookups as armored keyrings or textual indexes.

use std::sync::Arc;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use sequoia_openpgp::Cert;
use tokio_util::sync::CancellationToken;

use spks_common::config::{ServerConfig, CONFIG_DIR, CONFIG_FILE};
use spks_common::keyring;
use spks_db::{Engine, EngineRegistry, KeyType};
use spks_verifier::MailVerifier;

#[derive(Parser)]
#[command(
    name = "spks",
    about = "Signing public keyserver speaking the HTTP Keyserver Protocol",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(value_name = "CONFIG", default_value_t = default_config_path())]
    config: String,
}

fn default_config_path() -> String {
    format!("{CONFIG_DIR}/{CONFIG_FILE}")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // .env support for development setups
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spks=info,tower_http=info".into()),
        )
        .init();

    if let Err(err) = run(&cli.config).await {
        tracing::error!("while running server: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let mut cfg =
        ServerConfig::load(config_path).context("while parsing configuration file")?;
    cfg.check().context("while checking configuration")?;

    let registry = EngineRegistry::with_defaults();
    let mut engine = registry
        .create(&cfg.db, &cfg.db_config)
        .with_context(|| format!("no database engine {}", cfg.db))?;
    engine
        .check_config()
        .context("while checking database configuration")?;
    engine
        .connect()
        .context("while connecting to database")?;
    let db: Arc<dyn Engine> = Arc::from(engine);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Server interrupted by signal");
        signal_shutdown.cancel();
    });

    let signing_key = load_or_generate_signing_key(&cfg, db.as_ref())?;

    let server_cfg = spks_hkp::Config {
        addr: cfg.bind_address.clone(),
        public_pem: cfg.certificate.public_key.clone(),
        private_pem: cfg.certificate.private_key.clone(),
        db: db.clone(),
        verifier: Some(Box::new(MailVerifier::new(cfg.clone(), signing_key))),
        max_header_bytes: 0,
        max_body_bytes: 0,
        key_push_rate_limit: cfg.key_push_rate_limit.clone(),
    };

    tracing::info!(
        listen = %cfg.bind_address,
        "Server started (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let result = spks_hkp::start(shutdown, server_cfg).await;

    if let Err(err) = db.disconnect() {
        tracing::warn!("while disconnecting from database: {err}");
    }

    result
}

/// Validate and store a signing key: exactly one entity carrying
/// unencrypted private material.
fn add_signing_key(keys: &[Cert], db: &dyn Engine) -> anyhow::Result<()> {
    if keys.len() != 1 {
        bail!("found {} signing pgp key(s), only one can be set", keys.len());
    }
    if !keyring::has_secret(&keys[0]) {
        bail!("signing key requires private key");
    }
    if !keyring::has_unencrypted_secret(&keys[0]) {
        bail!("private key is encrypted");
    }
    db.add(keys)?;
    Ok(())
}

/// Resolve the server signing entity at startup: the stored non-revoked
/// one wins, then the configured `signing-pgpkey` (base64 blob or path),
/// then a freshly generated key.
fn load_or_generate_signing_key(cfg: &ServerConfig, db: &dyn Engine) -> anyhow::Result<Cert> {
    let stored = db
        .get("", true, false, KeyType::SigningKey)
        .context("while searching for signing key in database")?;
    if let Some(key) = stored.into_iter().find(|key| !keyring::is_revoked(key)) {
        tracing::info!(
            fingerprint = %keyring::long_fingerprint(&key),
            "Using stored signing PGP key"
        );
        return Ok(key);
    }

    if !cfg.signing_pgpkey.is_empty() {
        // a base64-encoded keyring first, a file path second
        let data = match BASE64.decode(cfg.signing_pgpkey.as_bytes()) {
            Ok(data) => data,
            Err(_) => {
                std::fs::read(&cfg.signing_pgpkey).context("while reading signing pgp key")?
            }
        };
        let keys = keyring::read_keyring(&data).context("while decoding signing pgp key")?;
        if keys.is_empty() {
            bail!("no signing key found");
        }
        let identity = keyring::primary_identity(&keys[0]).unwrap_or_default();
        tracing::info!(identity = %identity.name, "Using signing PGP key");
        add_signing_key(&keys, db)?;
        return Ok(keys[0].clone());
    }

    tracing::info!("Generating signing PGP key");
    let key = keyring::generate_signing_key(&cfg.admin_email)
        .context("while generating signing pgp key")?;
    tracing::info!(
        fingerprint = %keyring::long_fingerprint(&key),
        "Signing PGP key generated"
    );
    add_signing_key(std::slice::from_ref(&key), db)?;
    Ok(key)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
