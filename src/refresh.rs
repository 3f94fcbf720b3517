//! Freshness checking for stored objects.
//!
//! Decides whether a hit may be served as-is or must be revalidated with
//! the origin. Explicit expiry information always wins; without it a
//! last-modified heuristic applies.

use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::CACHE_CONTROL;

use crate::store::StoreEntry;

/// Fraction of the document's age used as the heuristic freshness
/// lifetime when the origin gave no expiry.
const HEURISTIC_PCT: u32 = 20;
/// Ceiling on heuristically computed freshness.
const HEURISTIC_MAX: Duration = Duration::from_secs(3 * 24 * 3600);

/// Extract a `max-age=N` directive.
pub fn cc_max_age(headers: &HeaderMap) -> Option<u64> {
    cc_directive(headers, "max-age")
}

/// Does the Cache-Control header carry a given flag directive?
pub fn cc_has(headers: &HeaderMap, directive: &str) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| d.trim().eq_ignore_ascii_case(directive))
}

fn cc_directive(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|d| {
            let mut parts = d.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            if !key.eq_ignore_ascii_case(name) {
                return None;
            }
            parts.next()?.trim().trim_matches('"').parse().ok()
        })
}

/// True when the stored object is stale for this request and needs
/// origin validation before it may be served.
pub fn check_http(entry: &StoreEntry, request: &HeaderMap, now: SystemTime) -> bool {
    let Some(timestamp) = entry.timestamp() else {
        // never stamped: nothing to base freshness on
        return true;
    };
    let age = now
        .duration_since(timestamp)
        .unwrap_or(Duration::ZERO);

    // client-imposed freshness bound
    if let Some(max_age) = cc_max_age(request) {
        if age.as_secs() > max_age {
            return true;
        }
    }

    // origin freshness bound
    let reply = entry.reply();
    if let Some(max_age) = reply.as_ref().map(|r| &r.headers).and_then(cc_max_age) {
        return age.as_secs() > max_age;
    }
    if let Some(expires) = entry.expires() {
        return now >= expires;
    }

    // heuristic on the document's stability
    match entry.lastmod() {
        Some(lastmod) => {
            let stable_for = timestamp
                .duration_since(lastmod)
                .unwrap_or(Duration::ZERO);
            let fresh_for = (stable_for * HEURISTIC_PCT / 100).min(HEURISTIC_MAX);
            age > fresh_for
        }
        None => true,
    }
}
