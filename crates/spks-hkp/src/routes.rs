//! HKP route handlers: `/pks/add`, `/pks/lookup` and the liveness base
//! route.
//!
//! Methods are enforced inside the handlers so that every outcome,
//! including 405, renders through the [`Status`] model.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Request, State};
use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use spks_common::status::Status;
use spks_common::keyring;
use spks_db::KeyType;
use tracing::debug;

use crate::index;
use crate::remote::RemoteIp;
use crate::verifier::SubmitContext;
use crate::HkpHandler;

#[derive(Debug, Deserialize)]
struct AddForm {
    #[serde(default)]
    keytext: String,
}

/// Lossy lookup of a query parameter, standard form decoding applied.
fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Does the comma-separated `options` parameter carry `nm`?
fn has_nm_option(query: &str) -> bool {
    query_param(query, "options")
        .unwrap_or_default()
        .split(',')
        .any(|option| option.trim() == "nm")
}

/// Strict query unescaping: `+` becomes space, malformed percent escapes
/// are an error rather than passed through.
fn query_unescape(value: &str) -> Result<String, ()> {
    fn hex_value(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(());
                }
                let hi = hex_value(bytes[i + 1]).ok_or(())?;
                let lo = hex_value(bytes[i + 2]).ok_or(())?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ())
}

/// Last `n` characters of a string.
fn tail(value: &str, n: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

/// Username of HTTP Basic credentials, when present.
fn basic_auth_username(headers: &axum::http::HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    Some(credentials.split(':').next().unwrap_or_default().to_string())
}

fn remote_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<RemoteIp>()
        .map(|remote| remote.0)
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// `POST /pks/add`: submit an armored keyring for verification and
/// storage.
pub(crate) async fn add(State(handler): State<Arc<HkpHandler>>, request: Request) -> Response {
    if request.method() != Method::POST {
        return Status::method_not_allowed(&[]).into_response();
    }

    let ip = remote_ip(&request);
    if let Some(limiter) = handler.limiter.as_deref() {
        if limiter.push_limit_reached(ip) {
            debug!(remote = %ip, "key submission rate limit reached");
            return Status::too_many_requests(&[]).into_response();
        }
    }

    let query = request.uri().query().unwrap_or_default().to_string();
    if has_nm_option(&query) {
        return Status::not_implemented(&[]).into_response();
    }

    let basic_username = basic_auth_username(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), handler.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return Status::internal_server_error(&[&err.to_string()]).into_response(),
    };

    let form: AddForm = match serde_urlencoded::from_bytes(&body) {
        Ok(form) => form,
        Err(err) => return Status::bad_request(&[&err.to_string()]).into_response(),
    };

    let keys = match keyring::read_keyring(form.keytext.as_bytes()) {
        Ok(keys) => keys,
        Err(err) => return Status::bad_request(&[&err.to_string()]).into_response(),
    };
    if keys.is_empty() {
        return Status::bad_request(&["No key submitted"]).into_response();
    }

    // prevents private keys from being stored; private serialization is
    // reserved for the internal signing-key path
    for key in &keys {
        if keyring::has_secret(key) {
            return Status::bad_request(&["Keys submitted must not contain private key"])
                .into_response();
        }
    }

    let (keys, status) = match handler.verifier.as_ref() {
        Some(verifier) => {
            let context = SubmitContext {
                basic_username,
                remote_ip: Some(ip),
            };
            let (keys, status) = verifier.verify(keys, &context).await;
            let status = match status {
                Some(status) => status,
                None => {
                    return Status::internal_server_error(&["Broken verifier"]).into_response()
                }
            };
            if keys.is_empty() || status.is_error() {
                return status.into_response();
            }
            (keys, status)
        }
        None => (keys, Status::ok(&["Key(s) submitted successfully"])),
    };

    if let Err(err) = handler.db.add(&keys) {
        return Status::internal_server_error(&[&err.to_string()]).into_response();
    }

    status.into_response()
}

/// `GET /pks/lookup`: retrieve keys as an armored keyring (`op=get`) or
/// as a textual index (`op=index`, `op=vindex`).
pub(crate) async fn lookup(State(handler): State<Arc<HkpHandler>>, request: Request) -> Response {
    if request.method() != Method::GET {
        return Status::method_not_allowed(&[]).into_response();
    }

    let query = request.uri().query().unwrap_or_default().to_string();
    if has_nm_option(&query) {
        return Status::not_implemented(&[]).into_response();
    }

    let exact = query_param(&query, "exact").as_deref() == Some("on");

    let mut search = match query_unescape(&query_param(&query, "search").unwrap_or_default()) {
        Ok(search) => search,
        Err(()) => return Status::bad_request(&["Bad search parameter"]).into_response(),
    };

    let is_fingerprint = search.starts_with("0x");
    if is_fingerprint {
        search = search.trim_start_matches("0x").to_ascii_uppercase();
        let length = search.chars().count();
        if length < 8 {
            return Status::bad_request(&["Fingerprint search must have at least 8 characters"])
                .into_response();
        } else if length < 16 {
            search = tail(&search, 8);
        } else {
            // storage is keyed by short fingerprint, longer forms close
            // over the same record
            search = tail(&search, 16);
        }
    }

    match query_param(&query, "op").as_deref() {
        Some("get") => {
            let keys = match handler.db.get(&search, is_fingerprint, exact, KeyType::PublicKey) {
                Ok(keys) => keys,
                Err(err) => {
                    return Status::internal_server_error(&[&err.to_string()]).into_response()
                }
            };
            if keys.is_empty() {
                return Status::not_found(&[]).into_response();
            }
            match keyring::write_armored_keyring(&keys) {
                Ok(armored) => (
                    [(header::CONTENT_TYPE, "application/pgp-keys")],
                    armored,
                )
                    .into_response(),
                Err(err) => Status::internal_server_error(&[&err.to_string()]).into_response(),
            }
        }
        Some("index") | Some("vindex") => {
            let keys = match handler.db.get(&search, is_fingerprint, exact, KeyType::PublicKey) {
                Ok(keys) => keys,
                Err(err) => {
                    return Status::internal_server_error(&[&err.to_string()]).into_response()
                }
            };
            if keys.is_empty() {
                return Status::not_found(&[]).into_response();
            }
            match index::write_index(&keys, SystemTime::now()) {
                Ok(text) => {
                    ([(header::CONTENT_TYPE, "text/plain")], text).into_response()
                }
                Err(err) => Status::internal_server_error(&[&err.to_string()]).into_response(),
            }
        }
        _ => Status::not_implemented(&[]).into_response(),
    }
}

/// Liveness: every unrouted path answers 200 with an empty message.
pub(crate) async fn base() -> Response {
    Status::ok(&[""]).into_response()
}
