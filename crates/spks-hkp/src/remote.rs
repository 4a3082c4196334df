//! Remote address resolution and request logging.
//!
//! Reverse-proxy headers (`X-Real-Ip`, `X-Forwarded-For`) are only
//! trusted when the direct peer is loopback or inside a known private
//! range, so arbitrary clients cannot spoof their way around the rate
//! limiter.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

/// Resolved remote address, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RemoteIp(pub IpAddr);

/// 10/8, 172.16/12, 192.168/16 and fc00::/7.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(v6) => (v6.octets()[0] & 0xfe) == 0xfc,
    }
}

/// Find the remote address associated with a request.
pub fn resolve_remote_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if !peer.is_loopback() && !is_private(peer) {
        return peer;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok());
    if let Some(ip) = real_ip {
        return ip;
    }

    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

/// Middleware resolving the remote address and logging every request.
pub async fn track_requests(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    let remote = resolve_remote_ip(request.headers(), peer);
    request.extensions_mut().insert(RemoteIp(remote));

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let start = Instant::now();
    let response = next.run(request).await;

    info!(
        remote = %remote,
        code = response.status().as_u16(),
        method = %method,
        path = %path,
        agent = %agent,
        took = ?start.elapsed(),
        "http request"
    );

    response
}
