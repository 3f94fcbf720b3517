//! End-to-end scenarios through the reply pipeline: a scripted origin
//! behind the forwarder seam, a buffering sink below the context, and
//! the engine ticked in between.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use parking_lot::Mutex;

use ikura::config::Config;
use ikura::core::Core;
use ikura::event::JobHandle;
use ikura::forward::{ForwardedRequest, Forwarder};
use ikura::msg::HttpReply;
use ikura::reply::{LogType, ReplyAccess, ReplyContext, StreamStatus, Transaction};
use ikura::store::StoreEntry;
use ikura::stream::BufferSink;

#[derive(Clone)]
enum OriginAction {
    Reply { head: String, body: &'static [u8] },
    Abort,
    Ignore,
}

struct ScriptedOrigin {
    core: Mutex<Option<Arc<Core>>>,
    actions: Mutex<VecDeque<OriginAction>>,
    starts: Mutex<Vec<ForwardedRequest>>,
}

impl ScriptedOrigin {
    fn new() -> Arc<ScriptedOrigin> {
        Arc::new(ScriptedOrigin {
            core: Mutex::new(None),
            actions: Mutex::new(VecDeque::new()),
            starts: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, action: OriginAction) {
        self.actions.lock().push_back(action);
    }

    fn starts(&self) -> usize {
        self.starts.lock().len()
    }

    fn now(&self) -> SystemTime {
        self.core
            .lock()
            .as_ref()
            .map(|c| c.now())
            .unwrap_or_else(SystemTime::now)
    }
}

impl Forwarder for ScriptedOrigin {
    fn start(&self, entry: &Arc<StoreEntry>, request: &ForwardedRequest) {
        self.starts.lock().push(request.clone());
        let action = self
            .actions
            .lock()
            .pop_front()
            .unwrap_or(OriginAction::Ignore);
        match action {
            OriginAction::Reply { head, body } => {
                let rep = HttpReply::parse(head.as_bytes()).expect("scripted head parses");
                entry.replace_reply(rep);
                if !body.is_empty() {
                    entry.append(body);
                }
                entry.complete();
                entry.timestamps_set(self.now());
            }
            OriginAction::Abort => entry.abort(),
            OriginAction::Ignore => {}
        }
    }
}

struct Rig {
    core: Arc<Core>,
    origin: Arc<ScriptedOrigin>,
}

fn rig_with(config: Config) -> Rig {
    let origin = ScriptedOrigin::new();
    let core = Core::builder(config).forwarder(origin.clone()).build();
    *origin.core.lock() = Some(core.clone());
    Rig { core, origin }
}

fn rig() -> Rig {
    rig_with(Config::default().visible_hostname("proxy.test"))
}

fn request(method: Method, url: &str, headers: &[(&str, &str)]) -> Transaction {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        map.append(
            HeaderName::from_bytes(k.as_bytes()).unwrap(),
            HeaderValue::from_str(v).unwrap(),
        );
    }
    Transaction::from_request(method, &url.parse().unwrap(), Version::HTTP_11, map)
}

fn run(rig: &Rig, tx: Transaction) -> (BufferSink, JobHandle<ReplyContext>) {
    let sink = BufferSink::new();
    let handle = ReplyContext::start(rig.core.clone(), tx, Box::new(sink.clone()));
    for _ in 0..64 {
        rig.core.engine.run_until_idle();
        if sink.settled() || !handle.alive() {
            break;
        }
        ReplyContext::pull(&handle);
    }
    rig.core.engine.run_until_idle();
    (sink, handle)
}

fn log_type_of(rig: &Rig, handle: &JobHandle<ReplyContext>) -> Option<LogType> {
    let out = Arc::new(Mutex::new(None));
    let sink = out.clone();
    handle.call("test::inspectLogType", move |rc, _ctx| {
        *sink.lock() = Some(rc.transaction().log_type);
        Ok(())
    });
    rig.core.engine.run_until_idle();
    let got = *out.lock();
    got
}

fn stream_status_of(rig: &Rig, handle: &JobHandle<ReplyContext>) -> Option<StreamStatus> {
    let out = Arc::new(Mutex::new(None));
    let sink = out.clone();
    handle.call("test::inspectStatus", move |rc, _ctx| {
        *sink.lock() = Some(rc.reply_status());
        Ok(())
    });
    rig.core.engine.run_until_idle();
    let got = *out.lock();
    got
}

fn header<'a>(reply: &'a HttpReply, name: &str) -> Option<&'a str> {
    reply.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Seed a complete, fresh object into the cache.
fn seed(rig: &Rig, url: &str, head: &str, body: &[u8], age: Duration) -> Arc<StoreEntry> {
    let entry = rig.core.store.create_entry(url, &Method::GET, None, true);
    entry.replace_reply(HttpReply::parse(head.as_bytes()).unwrap());
    if !body.is_empty() {
        entry.append(body);
    }
    entry.complete();
    let now = rig.core.now();
    entry.timestamps_set(now);
    entry.set_timestamp(now - age);
    entry
}

#[test]
fn plain_hit_serves_body_age_and_x_cache() {
    let rig = rig();
    seed(
        &rig,
        "http://example.org/hello",
        "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nCache-Control: max-age=3600\r\n\r\n",
        b"helloworld",
        Duration::from_secs(60),
    );

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/hello", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"helloworld");
    assert_eq!(header(&reply, "age"), Some("60"));
    assert_eq!(header(&reply, "x-cache"), Some("HIT from proxy.test"));
    assert_eq!(header(&reply, "via"), Some("1.1 proxy.test"));
    assert_eq!(header(&reply, "connection"), Some("keep-alive"));
    assert!(reply.headers.contains_key("date"));
    assert!(sink.complete());

    let lt = log_type_of(&rig, &handle).unwrap();
    assert!(lt.is_hit(), "classified as a hit, got {lt}");
    assert_eq!(stream_status_of(&rig, &handle), Some(StreamStatus::Complete));
    assert_eq!(rig.origin.starts(), 0, "no upstream contact on a hit");
}

#[test]
fn miss_fetches_from_origin_and_says_miss() {
    let rig = rig();
    rig.origin.script(OriginAction::Reply {
        head: "HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n".to_string(),
        body: b"upstream!",
    });

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/miss", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"upstream!");
    assert_eq!(header(&reply, "x-cache"), Some("MISS from proxy.test"));
    assert_eq!(rig.origin.starts(), 1);
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpMiss));
}

#[test]
fn revalidation_304_serves_the_cached_body() {
    let rig = rig();
    let entry = seed(
        &rig,
        "http://example.org/reval",
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"cached",
        Duration::from_secs(100),
    );
    entry.set_expires(Some(rig.core.now() - Duration::from_secs(1)));

    let fresh_head = format!(
        "HTTP/1.1 304 Not Modified\r\nDate: {}\r\nCache-Control: max-age=600\r\n\r\n",
        httpdate::fmt_http_date(rig.core.now())
    );
    rig.origin.script(OriginAction::Reply {
        head: fresh_head,
        body: b"",
    });

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/reval", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"cached");
    assert_eq!(rig.origin.starts(), 1, "origin consulted once");
    assert_eq!(
        log_type_of(&rig, &handle),
        Some(LogType::TcpRefreshUnmodified)
    );
    // revalidated headers were folded into the stored object
    assert_eq!(header(&reply, "cache-control"), Some("max-age=600"));
}

#[test]
fn revalidation_200_replaces_the_cached_body() {
    let rig = rig();
    let entry = seed(
        &rig,
        "http://example.org/changed",
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"cached",
        Duration::from_secs(100),
    );
    entry.set_expires(Some(rig.core.now() - Duration::from_secs(1)));

    rig.origin.script(OriginAction::Reply {
        head: "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n".to_string(),
        body: b"fresh!",
    });

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/changed", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"fresh!");
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpRefreshModified));
    // the stale object is gone from the public table
    assert!(
        rig.core
            .store
            .get_public("http://example.org/changed", &Method::GET)
            .map(|e| e.flags().release_requested)
            .unwrap_or(true)
    );
}

#[test]
fn revalidation_fetch_abort_falls_back_to_the_old_entry() {
    let rig = rig();
    let entry = seed(
        &rig,
        "http://example.org/flaky",
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"cached",
        Duration::from_secs(100),
    );
    entry.set_expires(Some(rig.core.now() - Duration::from_secs(1)));
    rig.origin.script(OriginAction::Abort);

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/flaky", &[]));

    assert_eq!(&sink.body()[..], b"cached");
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpRefreshFailOld));
}

#[test]
fn vary_mismatch_reruns_the_lookup_once_then_misses() {
    let rig = rig();
    let entry = seed(
        &rig,
        "http://example.org/vary",
        "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nCache-Control: max-age=3600\r\nVary: Accept-Encoding\r\n\r\n",
        b"gzipped",
        Duration::from_secs(1),
    );
    let mut gzip_req = HeaderMap::new();
    gzip_req.insert("accept-encoding", HeaderValue::from_static("gzip"));
    entry.set_vary_headers(Some(ikura::store::Store::vary_signature(
        "Accept-Encoding",
        &gzip_req,
    )));

    rig.origin.script(OriginAction::Reply {
        head: "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nVary: Accept-Encoding\r\n\r\n".to_string(),
        body: b"brotli!",
    });

    let (sink, _handle) = run(
        &rig,
        request(
            Method::GET,
            "http://example.org/vary",
            &[("accept-encoding", "br")],
        ),
    );

    assert_eq!(&sink.body()[..], b"brotli!");
    assert_eq!(rig.origin.starts(), 1, "exactly one upstream fetch");
}

#[test]
fn purge_disabled_yields_403_without_store_mutation() {
    let rig = rig();
    seed(
        &rig,
        "http://example.org/keep",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nCache-Control: max-age=3600\r\n\r\n",
        b"keep",
        Duration::from_secs(1),
    );

    let purge = Method::from_bytes(b"PURGE").unwrap();
    let (sink, handle) = run(&rig, request(purge, "http://example.org/keep", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpDenied));
    assert!(
        rig.core
            .store
            .get_public("http://example.org/keep", &Method::GET)
            .is_some(),
        "cache untouched"
    );
}

#[test]
fn purge_releases_and_is_idempotent() {
    let rig = rig_with(
        Config::default()
            .visible_hostname("proxy.test")
            .enable_purge(true),
    );
    seed(
        &rig,
        "http://example.org/gone",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nCache-Control: max-age=3600\r\n\r\n",
        b"gone",
        Duration::from_secs(1),
    );

    let purge = Method::from_bytes(b"PURGE").unwrap();
    let (sink, _h) = run(&rig, request(purge.clone(), "http://example.org/gone", &[]));
    assert_eq!(sink.reply().unwrap().status, StatusCode::OK);
    assert!(
        rig.core
            .store
            .get_public("http://example.org/gone", &Method::GET)
            .is_none(),
        "object released"
    );

    // a second purge finds nothing and changes nothing
    let (sink2, _h2) = run(&rig, request(purge, "http://example.org/gone", &[]));
    assert_eq!(sink2.reply().unwrap().status, StatusCode::NOT_FOUND);
}

#[test]
fn only_if_cached_miss_yields_504() {
    let rig = rig();
    let (sink, _h) = run(
        &rig,
        request(
            Method::GET,
            "http://example.org/nowhere",
            &[("cache-control", "only-if-cached")],
        ),
    );
    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(rig.origin.starts(), 0, "no upstream contact");
}

#[test]
fn trace_with_max_forwards_zero_echoes_locally() {
    let rig = rig();
    let (sink, _h) = run(
        &rig,
        request(
            Method::TRACE,
            "http://example.org/trace",
            &[("max-forwards", "0")],
        ),
    );
    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(header(&reply, "content-type"), Some("message/http"));
    let body = String::from_utf8_lossy(&sink.body()).into_owned();
    assert!(body.starts_with("TRACE http://example.org/trace"));
    assert_eq!(rig.origin.starts(), 0, "no upstream contact");
}

#[test]
fn conditional_ims_unmodified_yields_304() {
    let rig = rig();
    seed(
        &rig,
        "http://example.org/ims",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nCache-Control: max-age=3600\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"body",
        Duration::from_secs(5),
    );

    let (sink, handle) = run(
        &rig,
        request(
            Method::GET,
            "http://example.org/ims",
            &[("if-modified-since", "Wed, 01 Jan 2025 00:00:00 GMT")],
        ),
    );

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
    assert!(sink.body().is_empty());
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpImsHit));
}

#[test]
fn conditional_ims_modified_serves_the_object() {
    let rig = rig();
    seed(
        &rig,
        "http://example.org/ims2",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nCache-Control: max-age=3600\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"body",
        Duration::from_secs(5),
    );

    let (sink, handle) = run(
        &rig,
        request(
            Method::GET,
            "http://example.org/ims2",
            &[("if-modified-since", "Tue, 01 Jan 2019 00:00:00 GMT")],
        ),
    );

    assert_eq!(sink.reply().unwrap().status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"body");
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpImsHit));
}

#[test]
fn if_none_match_mismatch_drops_ims_and_serves() {
    let rig = rig();
    seed(
        &rig,
        "http://example.org/etag",
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nCache-Control: max-age=3600\r\nETag: \"v2\"\r\nLast-Modified: Wed, 01 Jan 2025 00:00:00 GMT\r\n\r\n",
        b"body",
        Duration::from_secs(5),
    );

    let (sink, _h) = run(
        &rig,
        request(
            Method::GET,
            "http://example.org/etag",
            &[
                ("if-none-match", "\"v1\""),
                ("if-modified-since", "Wed, 01 Jan 2025 00:00:00 GMT"),
            ],
        ),
    );

    // mismatching If-None-Match: IMS is ignored, full object served
    assert_eq!(sink.reply().unwrap().status, StatusCode::OK);
    assert_eq!(&sink.body()[..], b"body");
}

#[test]
fn oversized_reply_becomes_403() {
    let rig = rig_with(
        Config::default()
            .visible_hostname("proxy.test")
            .reply_body_max_size(5),
    );
    seed(
        &rig,
        "http://example.org/big",
        "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nCache-Control: max-age=3600\r\n\r\n",
        b"helloworld",
        Duration::from_secs(1),
    );

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/big", &[]));
    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert!(
        String::from_utf8_lossy(&sink.body()).contains("too large"),
        "served the ERR_TOO_BIG page"
    );
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpDeniedReply));
}

struct DenyAll;

impl ReplyAccess for DenyAll {
    fn check(
        &self,
        _method: &Method,
        _url: &str,
        _reply: &HttpReply,
        verdict: Box<dyn FnOnce(bool) + Send>,
    ) {
        verdict(false);
    }
}

#[test]
fn reply_access_denial_serves_the_error_page() {
    let origin = ScriptedOrigin::new();
    let core = Core::builder(Config::default().visible_hostname("proxy.test"))
        .forwarder(origin.clone())
        .reply_access(Arc::new(DenyAll))
        .build();
    *origin.core.lock() = Some(core.clone());
    let rig = Rig { core, origin };
    seed(
        &rig,
        "http://example.org/secret",
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nCache-Control: max-age=3600\r\n\r\n",
        b"sssssh",
        Duration::from_secs(1),
    );

    let (sink, handle) = run(&rig, request(Method::GET, "http://example.org/secret", &[]));
    assert_eq!(sink.reply().unwrap().status, StatusCode::FORBIDDEN);
    assert_ne!(&sink.body()[..], b"sssssh");
    assert_eq!(log_type_of(&rig, &handle), Some(LogType::TcpDeniedReply));
}

#[test]
fn error_replies_close_when_error_pconns_is_off() {
    let mut config = Config::default().visible_hostname("proxy.test");
    config.onoff.error_pconns = false;
    let rig = rig_with(config);

    let purge = Method::from_bytes(b"PURGE").unwrap();
    let (sink, _h) = run(&rig, request(purge, "http://example.org/x", &[]));
    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(header(&reply, "connection"), Some("close"));
}

#[test]
fn head_requests_send_headers_only() {
    let rig = rig();
    let entry = rig
        .core
        .store
        .create_entry("http://example.org/head", &Method::HEAD, None, true);
    entry.replace_reply(
        HttpReply::parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nCache-Control: max-age=3600\r\n\r\n",
        )
        .unwrap(),
    );
    entry.append(b"helloworld");
    entry.complete();
    entry.timestamps_set(rig.core.now());

    let (sink, _h) = run(&rig, request(Method::HEAD, "http://example.org/head", &[]));

    let reply = sink.reply().expect("headers delivered");
    assert_eq!(reply.status, StatusCode::OK);
    assert!(sink.body().is_empty(), "no body on HEAD");
    assert!(sink.complete());
}
