//! Synthesized error replies.
//!
//! Errors that cannot be recovered internally become a small HTML page
//! inside a fresh store entry, so logging, access checks and the send
//! path all see the same structure they would for a real reply.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::StatusCode;

use crate::msg::HttpReply;
use crate::store::StoreEntry;

/// The error page vocabulary of the reply pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrKind {
    AccessDenied,
    PreconditionFailed,
    OnlyIfCachedMiss,
    TooBig,
    InvalidRequest,
}

impl ErrKind {
    pub fn title(&self) -> &'static str {
        match self {
            ErrKind::AccessDenied => "Access Denied",
            ErrKind::PreconditionFailed => "Precondition Failed",
            ErrKind::OnlyIfCachedMiss => "Valid document was not found in the cache",
            ErrKind::TooBig => "The reply is too large",
            ErrKind::InvalidRequest => "Invalid Request",
        }
    }

    /// The status normally paired with this page.
    pub fn default_status(&self) -> StatusCode {
        match self {
            ErrKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrKind::OnlyIfCachedMiss => StatusCode::GATEWAY_TIMEOUT,
            ErrKind::TooBig => StatusCode::FORBIDDEN,
            ErrKind::InvalidRequest => StatusCode::BAD_REQUEST,
        }
    }
}

/// Render the page: a reply head plus its HTML body.
pub fn build(
    kind: ErrKind,
    status: StatusCode,
    url: Option<&str>,
    hostname: &str,
    now: SystemTime,
) -> (HttpReply, Bytes) {
    let body = format!(
        "<html><head><title>ERROR: {title}</title></head>\n\
         <body>\n<h1>ERROR</h1>\n<h2>{title}</h2>\n\
         <p>The following error was encountered while trying to retrieve the URL:\n\
         <a href=\"{url}\">{url}</a></p>\n\
         <hr>\n<address>Generated by {host}</address>\n</body></html>\n",
        title = kind.title(),
        url = url.unwrap_or("[no URL]"),
        host = hostname,
    );
    let body = Bytes::from(body);
    let reply = HttpReply::synthesize(status, Some("text/html"), Some(body.len() as u64), now);
    (reply, body)
}

/// Write the page into `entry` and complete it, so whoever reads the
/// entry next serves the error like any other object.
pub fn fill_entry(
    entry: &Arc<StoreEntry>,
    kind: ErrKind,
    status: StatusCode,
    url: Option<&str>,
    hostname: &str,
    now: SystemTime,
) {
    let (reply, body) = build(kind, status, url, hostname, now);
    entry.buffer();
    entry.replace_reply(reply);
    entry.append(&body);
    entry.complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use http::Method;

    #[test]
    fn page_carries_status_and_consistent_length() {
        let now = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_735_689_600);
        let (reply, body) = build(
            ErrKind::OnlyIfCachedMiss,
            StatusCode::GATEWAY_TIMEOUT,
            Some("http://example.org/x"),
            "cache-1",
            now,
        );
        assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(reply.content_length(), Some(body.len() as u64));
        let text = String::from_utf8_lossy(&body).into_owned();
        assert!(text.contains("cache-1"));
        assert!(text.contains("http://example.org/x"));
    }

    #[test]
    fn filled_entry_is_complete_and_parsed() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/err", &Method::GET, None, false);
        fill_entry(
            &e,
            ErrKind::AccessDenied,
            StatusCode::FORBIDDEN,
            Some("http://example.org/err"),
            "cache-1",
            SystemTime::now(),
        );
        assert!(e.headers_parsed());
        assert_eq!(e.reply().unwrap().status, StatusCode::FORBIDDEN);
        let len = e.object_len().unwrap();
        assert!(len > 0);
        assert_eq!(e.end_offset(), len);
    }
}
