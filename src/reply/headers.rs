//! Reply header surgery: everything between the stored reply and what
//! the client is allowed to see.
//!
//! Runs exactly once per response, on the context's working copy. The
//! copy's `hdr_sz` deliberately keeps describing the bytes in the object
//! stream; this code edits only the header map that goes to the wire.

use std::time::{Duration, SystemTime};

use http::header::{
    AGE, CONNECTION, DATE, EXPIRES, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    SET_COOKIE, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA, WARNING, WWW_AUTHENTICATE,
};
use once_cell::sync::Lazy;

use super::LogType;
use super::context::ReplyContext;

static X_CACHE: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-cache"));
static X_CACHE_LOOKUP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-cache-lookup"));
static X_CACHE_AGE: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-cache-age"));
static X_ORIGIN_DATE: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-origin-date"));
static X_ORIGIN_EXPIRES: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-origin-expires"));
static PROXY_SUPPORT: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("proxy-support"));
static SURROGATE_CONTROL: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("surrogate-control"));
static SURROGATE_CAPABILITY: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("surrogate-capability"));
static KEEP_ALIVE: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("keep-alive"));
static PROXY_AUTHORIZATION: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("proxy-authorization"));

fn http_date(t: SystemTime) -> HeaderValue {
    HeaderValue::from_str(&httpdate::fmt_http_date(t))
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

fn remove_hop_by_hop(hdr: &mut HeaderMap) {
    // tokens listed in Connection are hop-by-hop too
    let named: Vec<String> = hdr
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in named {
        if let Ok(h) = HeaderName::from_bytes(name.as_bytes()) {
            hdr.remove(h);
        }
    }
    hdr.remove(CONNECTION);
    hdr.remove(KEEP_ALIVE.clone());
    hdr.remove(PROXY_AUTHORIZATION.clone());
    hdr.remove(TE);
    hdr.remove(TRAILER);
    hdr.remove(TRANSFER_ENCODING);
    hdr.remove(UPGRADE);
}

/// One connection-oriented auth scheme token at the front of a
/// WWW-Authenticate value?
fn connection_oriented_auth(value: &str) -> bool {
    for scheme in ["NTLM", "Negotiate", "Kerberos"] {
        if value.len() >= scheme.len()
            && value[..scheme.len()].eq_ignore_ascii_case(scheme)
            && matches!(value.as_bytes().get(scheme.len()), None | Some(b' '))
        {
            return true;
        }
    }
    false
}

/// Filter and extend the reply header, then decide connection
/// persistence and transfer coding. See the keep-alive table in the
/// module docs of [`super`].
pub(crate) fn build_reply_header(rc: &mut ReplyContext) {
    let core = rc.core.clone();
    let config = &core.config;
    let now = core.now();
    let is_hit = rc.tx.log_type.is_hit();
    let entry = rc.tx.entry.clone();
    let Some(reply) = rc.reply.as_mut() else {
        return;
    };
    // snapshot what the keep-alive table needs before borrowing the map;
    // origin persistence must be read before hop-by-hop removal anyway
    let status = reply.status;
    let origin_persistent = reply.persistent();
    let body_size = reply.body_size(&rc.tx.method);
    let hdr = &mut reply.headers;

    if is_hit {
        hdr.remove(SET_COOKIE);
    }

    // unless a peer is configured with login=PASS or PASSTHRU, its
    // Proxy-Authenticate belongs to us, not to the client
    let pass_proxy_auth = matches!(
        config.peer_login.as_deref(),
        Some("PASS") | Some("PASSTHRU")
    );
    if !pass_proxy_auth {
        hdr.remove(PROXY_AUTHENTICATE);
    }

    remove_hop_by_hop(hdr);

    // estimated Age on cache hits
    if is_hit {
        hdr.remove(AGE);
        let timestamp = entry.as_ref().and_then(|e| e.timestamp());
        let special = entry.as_ref().map(|e| e.special()).unwrap_or(false);
        if special {
            hdr.insert(DATE, http_date(now));
        } else if config.act_as_origin {
            if let Some(old_date) = hdr.get(DATE).cloned() {
                hdr.insert(X_ORIGIN_DATE.clone(), old_date);
            }
            hdr.insert(DATE, http_date(now));
            if let Some(old_expires) = hdr.get(EXPIRES).cloned() {
                let expires = entry.as_ref().and_then(|e| e.expires());
                if let (Some(expires), Some(timestamp)) = (expires, timestamp) {
                    hdr.insert(X_ORIGIN_EXPIRES.clone(), old_expires);
                    if let Ok(shift) = expires.duration_since(timestamp) {
                        hdr.insert(EXPIRES, http_date(now + shift));
                    }
                }
            }
            if let Some(timestamp) = timestamp {
                if let Ok(age) = now.duration_since(timestamp) {
                    if let Ok(v) = HeaderValue::from_str(&age.as_secs().to_string()) {
                        hdr.insert(X_CACHE_AGE.clone(), v);
                    }
                }
            }
        } else if let Some(timestamp) = timestamp {
            if let Ok(age) = now.duration_since(timestamp) {
                hdr.insert(AGE, HeaderValue::from(age.as_secs()));
                // flag one-day-old heuristic hits per RFC 2616 14.46
                if age >= Duration::from_secs(86400) {
                    let w = format!(
                        "113 {} This cache hit is still fresh and more than 1 day old",
                        config.visible_hostname
                    );
                    if let Ok(v) = HeaderValue::from_str(&w) {
                        hdr.append(WARNING, v);
                    }
                }
            }
        }
    }

    // RFC 2616 14.18: we have a clock, so every reply carries a Date
    if !hdr.contains_key(DATE) {
        match entry.as_ref().and_then(|e| e.timestamp()) {
            Some(t) => hdr.insert(DATE, http_date(t)),
            None => hdr.insert(DATE, http_date(now)),
        };
    }

    if rc.tx.flags.stale_if_hit && is_hit {
        hdr.append(WARNING, HeaderValue::from_static("110 - \"Response is stale\""));
        if rc.tx.flags.need_validation {
            hdr.append(
                WARNING,
                HeaderValue::from_static("111 - \"Revalidation failed\""),
            );
        }
    }

    // connection-oriented auth cannot cross a shared proxy hop
    if rc.tx.log_type != LogType::TcpDenied && hdr.contains_key(WWW_AUTHENTICATE) {
        let values: Vec<String> = hdr
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let oriented = values.iter().any(|v| connection_oriented_auth(v));
        if oriented {
            if rc.tx.flags.connection_auth_disabled {
                let keep: Vec<String> = values
                    .into_iter()
                    .filter(|v| !connection_oriented_auth(v))
                    .collect();
                hdr.remove(WWW_AUTHENTICATE);
                for v in keep {
                    if let Ok(v) = HeaderValue::from_str(&v) {
                        hdr.append(WWW_AUTHENTICATE, v);
                    }
                }
            } else {
                rc.tx.flags.must_keepalive = true;
                if !rc.tx.flags.accelerated && !rc.tx.flags.intercepted {
                    hdr.insert(
                        PROXY_SUPPORT.clone(),
                        HeaderValue::from_static("Session-Based-Authentication"),
                    );
                }
            }
        }
    }

    let x_cache = format!(
        "{} from {}",
        if is_hit { "HIT" } else { "MISS" },
        config.visible_hostname
    );
    if let Ok(v) = HeaderValue::from_str(&x_cache) {
        hdr.insert(X_CACHE.clone(), v);
    }
    let x_lookup = format!("{} from {}", rc.lookup_tag, config.visible_hostname);
    if let Ok(v) = HeaderValue::from_str(&x_lookup) {
        hdr.insert(X_CACHE_LOOKUP.clone(), v);
    }

    let may_send_chunked =
        rc.tx.version >= http::Version::HTTP_11 && rc.tx.url.starts_with("http");

    // lose any of these and the connection closes
    let flags = &mut rc.tx.flags;
    if status.as_u16() >= 400 && !config.onoff.error_pconns && !flags.must_keepalive {
        tracing::debug!("error reply, no keep-alive");
        flags.proxy_keepalive = false;
    } else if !config.onoff.client_pconns && !flags.must_keepalive {
        tracing::debug!("keep-alive not requested by admin");
        flags.proxy_keepalive = false;
    } else if flags.proxy_keepalive && core.shutting_down() {
        tracing::debug!("shutting down, no keep-alive");
        flags.proxy_keepalive = false;
    } else if flags.connection_auth && !origin_persistent {
        tracing::debug!("connection-oriented auth on non-persistent origin");
        flags.proxy_keepalive = false;
    } else if body_size.is_none() && !may_send_chunked {
        tracing::debug!("unknown body size, cannot keep-alive");
        flags.proxy_keepalive = false;
    } else if core.fd_usage_high() && !flags.must_keepalive {
        tracing::debug!("file descriptors scarce, no keep-alive");
        flags.proxy_keepalive = false;
    } else if flags.ssl_bumped && !origin_persistent {
        tracing::debug!("bumped reply forces close");
        flags.proxy_keepalive = false;
    } else if flags.pinned && !origin_persistent {
        tracing::debug!("pinned reply forces close");
        flags.proxy_keepalive = false;
    }

    if may_send_chunked && flags.proxy_keepalive && body_size.is_none() {
        tracing::debug!("chunked reply");
        flags.chunked_reply = true;
        hdr.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    if config.onoff.via {
        let ours = format!("1.1 {}", config.visible_hostname);
        let merged = match hdr.get(VIA).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ours),
            None => ours,
        };
        if let Ok(v) = HeaderValue::from_str(&merged) {
            hdr.insert(VIA, v);
        }
    }

    hdr.insert(
        CONNECTION,
        HeaderValue::from_static(if rc.tx.flags.proxy_keepalive {
            "keep-alive"
        } else {
            "close"
        }),
    );

    // Surrogate-Control needs a Surrogate-Capability upstream to pass on
    if rc.reply.as_ref().map(|r| r.headers.contains_key(SURROGATE_CONTROL.clone())) == Some(true)
        && !rc.tx.headers.contains_key(SURROGATE_CAPABILITY.clone())
    {
        if let Some(reply) = rc.reply.as_mut() {
            reply.headers.remove(SURROGATE_CONTROL.clone());
        }
    }

    if let Some(mangler) = core.reply_mangler.clone() {
        if let Some(reply) = rc.reply.as_mut() {
            mangler(&mut reply.headers);
        }
    }
}
