//! Parsed HTTP reply heads as stored in and served from the cache.
//!
//! A cache object's bytes are the serialized reply head followed by the
//! body; [`HttpReply`] is the parsed form kept alongside the raw bytes.
//! Parsing goes through `httparse` (the parser hyper itself sits on) and
//! date handling through `httpdate`, so the envelope round-trips what a
//! conforming origin produced.

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    self, HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH,
    CONTENT_TYPE, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY,
};
use http::{Method, StatusCode, Version};

/// Largest number of headers accepted in a stored reply head.
const MAX_HEADERS: usize = 96;

/// A parsed reply head: status line plus headers, with the serialized
/// length remembered so body offsets can be derived.
#[derive(Clone, Debug)]
pub struct HttpReply {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Serialized length of the head, including the blank line.
    pub hdr_sz: usize,
}

/// Locate the end of an HTTP head in `buf`: the index one past the blank
/// line, or `None` when the head is still incomplete.
pub fn headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

impl HttpReply {
    /// Parse a reply head from the front of `buf`. Returns `None` while
    /// the head is incomplete or malformed.
    pub fn parse(buf: &[u8]) -> Option<HttpReply> {
        let hdr_sz = headers_end(buf)?;
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw);
        match parsed.parse(&buf[..hdr_sz]) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return None,
        }

        let status = StatusCode::from_u16(parsed.code?).ok()?;
        let version = match parsed.version? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            headers.append(name, value);
        }

        Some(HttpReply {
            version,
            status,
            headers,
            hdr_sz,
        })
    }

    /// Build a minimal reply head from scratch, e.g. for synthesized
    /// PURGE results and error pages.
    pub fn synthesize(
        status: StatusCode,
        content_type: Option<&str>,
        content_length: Option<u64>,
        now: SystemTime,
    ) -> HttpReply {
        let mut headers = HeaderMap::new();
        headers.insert(
            DATE,
            HeaderValue::from_str(&httpdate::fmt_http_date(now)).unwrap(),
        );
        if let Some(ct) = content_type {
            if let Ok(v) = HeaderValue::from_str(ct) {
                headers.insert(CONTENT_TYPE, v);
            }
        }
        if let Some(len) = content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        let mut rep = HttpReply {
            version: Version::HTTP_11,
            status,
            headers,
            hdr_sz: 0,
        };
        rep.hdr_sz = rep.to_bytes().len();
        rep
    }

    /// Serialize the head, including the terminating blank line.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let reason = self.status.canonical_reason().unwrap_or("");
        buf.put_slice(format!("{} {} {}\r\n", version, self.status.as_u16(), reason).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Re-measure `hdr_sz` after header surgery.
    pub fn refresh_hdr_sz(&mut self) {
        self.hdr_sz = self.to_bytes().len();
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    fn date_header(&self, name: HeaderName) -> Option<SystemTime> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    pub fn date(&self) -> Option<SystemTime> {
        self.date_header(DATE)
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.date_header(EXPIRES)
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.date_header(LAST_MODIFIED)
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|v| v.to_str().ok())
    }

    pub fn vary(&self) -> Option<&str> {
        self.headers.get(VARY).and_then(|v| v.to_str().ok())
    }

    /// Expected body size for a reply to `method`, `None` when unknown.
    pub fn body_size(&self, method: &Method) -> Option<u64> {
        if *method == Method::HEAD {
            return Some(0);
        }
        if self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Some(0);
        }
        self.content_length()
    }

    /// Whether the origin connection this reply arrived over may persist.
    pub fn persistent(&self) -> bool {
        let connection = self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match self.version {
            Version::HTTP_10 => connection.eq_ignore_ascii_case("keep-alive"),
            _ => !connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close")),
        }
    }

    /// Declared body exceeds the configured cap (`0` disables the check).
    pub fn expected_body_too_large(&self, max: u64) -> bool {
        if max == 0 {
            return false;
        }
        matches!(self.content_length(), Some(len) if len > max)
    }

    /// Derive a `304 Not Modified` from this reply, carrying over the
    /// headers RFC 2616 §10.3.5 wants repeated.
    pub fn make_304(&self) -> HttpReply {
        const KEEP: [HeaderName; 6] = [DATE, CONTENT_TYPE, EXPIRES, CACHE_CONTROL, VARY, ETAG];
        let mut headers = HeaderMap::new();
        for name in KEEP {
            for v in self.headers.get_all(&name) {
                headers.append(name.clone(), v.clone());
            }
        }
        let mut rep = HttpReply {
            version: Version::HTTP_11,
            status: StatusCode::NOT_MODIFIED,
            headers,
            hdr_sz: 0,
        };
        rep.refresh_hdr_sz();
        rep
    }

    /// Fold a revalidation `304`'s headers into this stored reply: every
    /// header the origin sent replaces ours, except the entity framing
    /// which a 304 does not speak for.
    pub fn update_on_not_modified(&mut self, fresh: &HttpReply) {
        for (name, value) in fresh.headers.iter() {
            if name == &CONTENT_LENGTH || name == &CONTENT_TYPE || name == &header::TRANSFER_ENCODING {
                continue;
            }
            self.headers.insert(name.clone(), value.clone());
        }
        self.refresh_hdr_sz();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_head() -> &'static [u8] {
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 10\r\nDate: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\nhelloworld"
    }

    #[test]
    fn parse_reads_status_headers_and_size() {
        let rep = HttpReply::parse(sample_head()).unwrap();
        assert_eq!(rep.status, StatusCode::OK);
        assert_eq!(rep.content_length(), Some(10));
        assert_eq!(&sample_head()[rep.hdr_sz..], b"helloworld");
        assert!(rep.date().is_some());
    }

    #[test]
    fn parse_waits_for_complete_head() {
        assert!(HttpReply::parse(b"HTTP/1.1 200 OK\r\nContent-").is_none());
    }

    #[test]
    fn serialized_head_reparses_identically() {
        let rep = HttpReply::parse(sample_head()).unwrap();
        let bytes = rep.to_bytes();
        let again = HttpReply::parse(&bytes).unwrap();
        assert_eq!(again.status, rep.status);
        assert_eq!(again.content_length(), rep.content_length());
        assert_eq!(again.hdr_sz, bytes.len());
    }

    #[test]
    fn body_size_ignores_entity_for_head_and_304() {
        let rep = HttpReply::parse(sample_head()).unwrap();
        assert_eq!(rep.body_size(&Method::GET), Some(10));
        assert_eq!(rep.body_size(&Method::HEAD), Some(0));
        assert_eq!(rep.make_304().body_size(&Method::GET), Some(0));
    }

    #[test]
    fn not_modified_update_keeps_entity_framing() {
        let mut stored = HttpReply::parse(sample_head()).unwrap();
        let fresh = HttpReply::parse(
            b"HTTP/1.1 304 Not Modified\r\nDate: Thu, 02 Jan 2025 00:00:00 GMT\r\nCache-Control: max-age=60\r\n\r\n",
        )
        .unwrap();
        stored.update_on_not_modified(&fresh);
        assert_eq!(stored.content_length(), Some(10));
        assert_eq!(
            stored.headers.get(CACHE_CONTROL).unwrap(),
            "max-age=60"
        );
        assert_eq!(
            stored.date().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1735776000)
        );
    }

    #[test]
    fn persistence_follows_connection_tokens() {
        let keep = HttpReply::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(keep.persistent());
        let close = HttpReply::parse(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!close.persistent());
        let old = HttpReply::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert!(!old.persistent());
    }
}
