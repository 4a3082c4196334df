//! # spks-hkp
//!
//! The HTTP Keyserver Protocol surface of SPKS: routes, rate limiting,
//! index writing, remote address resolution and the server lifecycle.
//! Key acceptance policy is pluggable through the [`Verifier`] trait;
//! storage through the [`spks_db::Engine`] contract.

pub mod index;
pub mod ratelimit;
pub mod remote;
mod routes;
mod verifier;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use spks_db::Engine;

pub use ratelimit::{parse_rate_limit, PushLimiter};
pub use verifier::{SubmitContext, Verifier};

/// Default HKP listen address.
pub const DEFAULT_ADDR: &str = "localhost:11371";

pub const BASE_ROUTE: &str = "/";
pub const ADD_ROUTE: &str = "/pks/add";
pub const LOOKUP_ROUTE: &str = "/pks/lookup";

/// Default request body clamp: 64 KiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 16;
/// Default request header clamp: 4 KiB.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 12;

/// HKP server configuration.
pub struct Config {
    /// Listen address; empty falls back to [`DEFAULT_ADDR`].
    pub addr: String,
    /// TLS certificate, as a base64-encoded PEM blob or a path.
    /// TLS is enabled when both PEM inputs are set.
    pub public_pem: String,
    /// TLS private key, same encoding rules.
    pub private_pem: String,
    /// Connected storage engine.
    pub db: Arc<dyn Engine>,
    /// Key acceptance policy; `None` accepts everything.
    pub verifier: Option<Box<dyn Verifier>>,
    /// Header clamp in bytes; 0 falls back to the default.
    pub max_header_bytes: usize,
    /// Body clamp in bytes; 0 falls back to the default.
    pub max_body_bytes: usize,
    /// `"R/P"` submission rate limit; empty disables it.
    pub key_push_rate_limit: String,
}

/// Shared state behind the HKP routes.
pub struct HkpHandler {
    pub db: Arc<dyn Engine>,
    pub verifier: Option<Arc<dyn Verifier>>,
    pub limiter: Option<Arc<PushLimiter>>,
    pub max_body_bytes: usize,
}

/// Assemble the HKP router around a handler.
pub fn build_router(handler: HkpHandler) -> Router {
    Router::new()
        .route(ADD_ROUTE, any(routes::add))
        .route(LOOKUP_ROUTE, any(routes::lookup))
        .fallback(routes::base)
        .layer(axum::middleware::from_fn(remote::track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(handler))
}

/// Read a PEM input: base64-encoded blob first, filesystem path second.
fn load_pem(input: &str, what: &str) -> anyhow::Result<Vec<u8>> {
    match BASE64.decode(input) {
        Ok(data) => Ok(data),
        Err(_) => std::fs::read(input).with_context(|| format!("while reading {what}")),
    }
}

/// Start the HKP server and serve until `shutdown` is cancelled.
///
/// Errors on invalid rate-limit configuration, TLS material or bind
/// failures; a cancellation-driven shutdown returns the graceful
/// shutdown outcome.
pub async fn start(shutdown: CancellationToken, cfg: Config) -> anyhow::Result<()> {
    let max_body_bytes = if cfg.max_body_bytes == 0 {
        DEFAULT_MAX_BODY_BYTES
    } else {
        cfg.max_body_bytes
    };
    let max_header_bytes = if cfg.max_header_bytes == 0 {
        DEFAULT_MAX_HEADER_BYTES
    } else {
        cfg.max_header_bytes
    };

    let limiter = parse_rate_limit(&cfg.key_push_rate_limit)?
        .and_then(|(requests, minutes)| PushLimiter::new(requests, minutes))
        .map(Arc::new);

    if let Some(limiter) = limiter.clone() {
        let sweeper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        });
    }

    let verifier = match cfg.verifier {
        Some(mut verifier) => {
            verifier
                .init(cfg.db.clone())
                .context("while initializing verifier")?;
            Some(Arc::from(verifier))
        }
        None => None,
    };

    let app = build_router(HkpHandler {
        db: cfg.db,
        verifier,
        limiter,
        max_body_bytes,
    });

    let addr = if cfg.addr.is_empty() {
        DEFAULT_ADDR
    } else {
        cfg.addr.as_str()
    };
    let addr: SocketAddr = std::net::ToSocketAddrs::to_socket_addrs(addr)
        .with_context(|| format!("while resolving bind address {addr}"))?
        .next()
        .with_context(|| format!("no address found for {addr}"))?;

    // hyper floors its header buffer at 8 KiB
    let http_max_buf_size = max_header_bytes.max(1 << 13);

    let handle = Handle::new();
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    if !cfg.public_pem.is_empty() && !cfg.private_pem.is_empty() {
        let cert = load_pem(&cfg.public_pem, "public certificate")?;
        let key = load_pem(&cfg.private_pem, "private certificate")?;
        let tls = RustlsConfig::from_pem(cert, key)
            .await
            .context("while loading TLS certificates")?;

        info!(listen = %addr, "HKP server listening (https)");
        let shutdown_handle = handle.clone();
        let mut server = axum_server::bind_rustls(addr, tls).handle(handle);
        server.http_builder().http1().max_buf_size(http_max_buf_size);
        let server = server.serve(service);
        tokio::pin!(server);
        tokio::select! {
            result = &mut server => result.context("server error")?,
            _ = shutdown.cancelled() => {
                shutdown_handle.graceful_shutdown(None);
                server.await.context("while shutting down server")?;
            }
        }
    } else {
        info!(listen = %addr, "HKP server listening");
        let shutdown_handle = handle.clone();
        let server = axum_server::bind(addr)
            .handle(handle)
            .http_config(http_config)
            .serve(service);
        tokio::pin!(server);
        tokio::select! {
            result = &mut server => result.context("server error")?,
            _ = shutdown.cancelled() => {
                shutdown_handle.graceful_shutdown(None);
                server.await.context("while shutting down server")?;
            }
        }
    }

    Ok(())
}
