//! Narrow seams toward the forwarding side of the proxy.
//!
//! Fetching from origins, the IP cache and peer purge notifications are
//! other subsystems; the reply pipeline reaches them only through these
//! traits. The null implementations keep a core usable (and testable)
//! without any of them wired up.

use std::sync::Arc;
use std::time::SystemTime;

use http::{HeaderMap, Method};

use crate::store::StoreEntry;

/// What forwarding needs to know to fetch an object into `entry`.
#[derive(Clone, Debug)]
pub struct ForwardedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// Revalidation: add `If-Modified-Since` with this stamp.
    pub if_modified_since: Option<SystemTime>,
    /// This fetch refreshes a stale entry.
    pub refresh: bool,
}

/// Fire-and-forget fetch starter. The forwarder writes bytes into the
/// entry, which kicks the attached readers through `invoke_handlers`.
pub trait Forwarder: Send + Sync {
    fn start(&self, entry: &Arc<StoreEntry>, request: &ForwardedRequest);
}

/// Name-to-address cache invalidation hooks.
pub trait IpCache: Send + Sync {
    fn invalidate(&self, host: &str);
    fn invalidate_negative(&self, host: &str);
}

/// Cache-peer purge notifications (HTCP CLR and friends).
pub trait PeerNotifier: Send + Sync {
    fn clear(&self, url: &str, method: &Method);
}

/// Forwarder that never fetches: entries stay pending until aborted.
pub struct NullForwarder;

impl Forwarder for NullForwarder {
    fn start(&self, entry: &Arc<StoreEntry>, request: &ForwardedRequest) {
        tracing::debug!(url = %request.url, id = entry.id(), "no forwarder configured");
    }
}

pub struct NullIpCache;

impl IpCache for NullIpCache {
    fn invalidate(&self, _host: &str) {}
    fn invalidate_negative(&self, _host: &str) {}
}

pub struct NullPeers;

impl PeerNotifier for NullPeers {
    fn clear(&self, _url: &str, _method: &Method) {}
}
