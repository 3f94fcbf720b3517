//! The per-request reply pipeline: classification, hit/miss/revalidate
//! routing, purge handling and reply-header construction.
//!
//! [`context::ReplyContext`] is the head node of a client's stream; one
//! exists per request and is driven entirely through engine calls. This
//! module holds the transaction state it operates on and the small
//! vocabulary shared with the rest of the crate.

pub mod context;
pub(crate) mod headers;
pub(crate) mod purge;

pub use context::{ReplyContext, StreamStatus};

use std::sync::Arc;
use std::time::SystemTime;

use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::msg::HttpReply;
use crate::store::StoreEntry;

/// How the transaction will be tagged in the access log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogType {
    TcpHit,
    TcpMiss,
    TcpRefreshUnmodified,
    TcpRefreshModified,
    TcpRefreshFailOld,
    TcpRefreshFailErr,
    TcpClientRefreshMiss,
    TcpImsHit,
    TcpMemHit,
    TcpOfflineHit,
    TcpNegativeHit,
    TcpSwapfailMiss,
    TcpRedirect,
    TcpDenied,
    TcpDeniedReply,
}

impl LogType {
    /// Hits get `Age`, lose `Set-Cookie`, and say HIT in `X-Cache`.
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            LogType::TcpHit
                | LogType::TcpImsHit
                | LogType::TcpRefreshUnmodified
                | LogType::TcpMemHit
                | LogType::TcpOfflineHit
                | LogType::TcpNegativeHit
        )
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogType::TcpHit => "TCP_HIT",
            LogType::TcpMiss => "TCP_MISS",
            LogType::TcpRefreshUnmodified => "TCP_REFRESH_UNMODIFIED",
            LogType::TcpRefreshModified => "TCP_REFRESH_MODIFIED",
            LogType::TcpRefreshFailOld => "TCP_REFRESH_FAIL_OLD",
            LogType::TcpRefreshFailErr => "TCP_REFRESH_FAIL_ERR",
            LogType::TcpClientRefreshMiss => "TCP_CLIENT_REFRESH_MISS",
            LogType::TcpImsHit => "TCP_IMS_HIT",
            LogType::TcpMemHit => "TCP_MEM_HIT",
            LogType::TcpOfflineHit => "TCP_OFFLINE_HIT",
            LogType::TcpNegativeHit => "TCP_NEGATIVE_HIT",
            LogType::TcpSwapfailMiss => "TCP_SWAPFAIL_MISS",
            LogType::TcpRedirect => "TCP_REDIRECT",
            LogType::TcpDenied => "TCP_DENIED",
            LogType::TcpDeniedReply => "TCP_DENIED_REPLY",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Request-scoped flags, client-set and pipeline-set alike.
#[derive(Clone, Debug, Default)]
pub struct RequestFlags {
    pub cachable: bool,
    pub internal: bool,
    pub no_cache: bool,
    pub ims: bool,
    pub only_if_cached: bool,
    pub refresh: bool,
    pub stale_if_hit: bool,
    pub need_validation: bool,
    pub fail_on_validation_err: bool,
    pub loop_detected: bool,
    pub accelerated: bool,
    pub intercepted: bool,
    pub ssl_bumped: bool,
    pub pinned: bool,
    pub connection_auth: bool,
    pub connection_auth_disabled: bool,
    pub must_keepalive: bool,
    pub proxy_keepalive: bool,
    pub chunked_reply: bool,
    pub stream_error: bool,
    pub done_copying: bool,
    pub range_full_download: bool,
}

/// Byte accounting for what has gone to the client.
#[derive(Clone, Copy, Debug, Default)]
pub struct OutState {
    /// Next body offset to send.
    pub offset: u64,
    /// Total bytes sent, headers included.
    pub size: u64,
    /// Size of the headers sent.
    pub headers_sz: usize,
}

/// One client transaction as the reply pipeline sees it.
pub struct Transaction {
    pub method: Method,
    pub version: Version,
    pub headers: HeaderMap,
    /// Canonical form of the requested URL.
    pub url: String,
    pub host: String,
    pub flags: RequestFlags,
    /// Parsed `If-Modified-Since`, when the client sent one.
    pub ims: Option<SystemTime>,
    /// Validator handed to forwarding during revalidation.
    pub lastmod: Option<SystemTime>,
    /// A redirect decided before the store was consulted.
    pub redirect: Option<(StatusCode, String)>,
    /// Variant signature once `Vary` processing identified one.
    pub vary_signature: Option<String>,
    pub out: OutState,
    pub log_type: LogType,
    pub entry: Option<Arc<StoreEntry>>,
}

impl Transaction {
    /// Build the transaction from a parsed request head. The URI must be
    /// absolute-form, as a proxy receives it.
    pub fn from_request(method: Method, uri: &Uri, version: Version, headers: HeaderMap) -> Transaction {
        let url = canonical_url(uri);
        let host = uri.host().unwrap_or("").to_ascii_lowercase();

        let mut flags = RequestFlags {
            cachable: matches!(method, Method::GET | Method::HEAD),
            proxy_keepalive: version != Version::HTTP_10,
            ..RequestFlags::default()
        };
        if crate::refresh::cc_has(&headers, "no-cache")
            || headers
                .get(http::header::PRAGMA)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("no-cache"))
                .unwrap_or(false)
        {
            flags.no_cache = true;
        }
        if crate::refresh::cc_has(&headers, "only-if-cached") {
            flags.only_if_cached = true;
        }

        let ims = headers
            .get(http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());
        flags.ims = ims.is_some();

        Transaction {
            method,
            version,
            headers,
            url,
            host,
            flags,
            ims,
            lastmod: None,
            redirect: None,
            vary_signature: None,
            out: OutState::default(),
            log_type: LogType::TcpMiss,
            entry: None,
        }
    }

    /// Any of the conditional request headers present?
    pub fn conditional(&self) -> bool {
        self.flags.ims
            || self.headers.contains_key(http::header::IF_MATCH)
            || self.headers.contains_key(http::header::IF_NONE_MATCH)
    }

    pub fn max_forwards(&self) -> Option<u64> {
        self.headers
            .get(http::header::MAX_FORWARDS)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Serialized request head, used as the TRACE echo payload.
    pub fn prefix_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.url).into_bytes();
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Canonicalize a request URI: lowercase scheme and host, default port
/// dropped, path made explicit.
pub fn canonical_url(uri: &Uri) -> String {
    match url::Url::parse(&uri.to_string()) {
        Ok(u) => u.to_string(),
        Err(_) => uri.to_string(),
    }
}

/// Reply-side access control checklist. The verdict arrives through the
/// engine queue; the context holds its buffer until then.
pub trait ReplyAccess: Send + Sync {
    fn check(
        &self,
        method: &Method,
        url: &str,
        reply: &HttpReply,
        verdict: Box<dyn FnOnce(bool) + Send>,
    );
}
