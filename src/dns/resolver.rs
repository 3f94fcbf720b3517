//! The asynchronous stub resolver.
//!
//! One process-wide resolver drives every name lookup: UDP first with a
//! per-query truncation fallback to TCP, an LRU retransmit queue with
//! exponential backoff across the nameserver pool, search-path expansion
//! for unqualified names, a parallel AAAA slave per A query, and
//! de-duplication of concurrent identical lookups. Everything is driven
//! by engine calls and timers; sockets live behind the [`super::wire`]
//! seam.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::DnsConfig;
use crate::event::{Call, Engine};

use super::message::{
    self, Question, ResourceRecord, TYPE_A, TYPE_AAAA, TYPE_PTR, rcode_text,
};
use super::vc::VirtualCircuit;
use super::wire::Wire;

/// Total attempts per query before a retried rcode is surfaced.
pub const MAX_ATTEMPT: u32 = 3;

const NS_PORT: u16 = 53;
const MAX_RCODE: usize = 17;

/// Lookup completion: the answer slice is owned by the resolver and only
/// valid for the duration of the call.
pub type DnsCallback = Box<dyn FnOnce(&[ResourceRecord], Option<&str>) + Send>;

pub struct Nameserver {
    pub addr: SocketAddr,
    pub nqueries: u64,
    pub nreplies: u64,
    vc: Option<VirtualCircuit>,
}

struct Query {
    query_id: u16,
    name: String,
    orig: String,
    wire_buf: Vec<u8>,
    question: Question,
    qtype: u16,
    nsends: u32,
    need_vc: bool,
    pending: bool,
    start: Instant,
    sent: Instant,
    queued: Instant,
    callback: Option<DnsCallback>,
    waiters: Vec<DnsCallback>,
    attempt: u32,
    rcode: u8,
    slave: Option<u64>,
    master: Option<u64>,
    do_searchpath: bool,
    next_suffix: usize,
    answers: Vec<ResourceRecord>,
    error: Option<String>,
    hash_key: Option<String>,
}

struct Inner {
    nameservers: Vec<Nameserver>,
    searchpath: Vec<String>,
    ndots: u32,
    queries: HashMap<u64, Query>,
    lru: VecDeque<u64>,
    event_queued: bool,
    rcode_matrix: [[u64; MAX_ATTEMPT as usize]; MAX_RCODE],
}

/// Snapshot of resolver counters.
#[derive(Clone, Debug)]
pub struct DnsStats {
    pub nameservers: Vec<(SocketAddr, u64, u64)>,
    pub outstanding: usize,
    pub rcode_matrix: [[u64; MAX_ATTEMPT as usize]; MAX_RCODE],
}

pub struct Resolver {
    engine: Arc<Engine>,
    config: DnsConfig,
    ignore_unknown: bool,
    wire: Mutex<Option<Arc<dyn Wire>>>,
    inflight: DashMap<String, u64>,
    inner: Mutex<Inner>,
}

/// Work that must happen after the resolver lock is released.
enum After {
    Nothing,
    Finalize(u64, Option<String>),
    RespawnSlave(u64),
}

impl Resolver {
    /// Build the resolver: nameservers from configuration, then the
    /// platform resolver file, then `127.0.0.1`.
    pub fn new(engine: Arc<Engine>, config: DnsConfig, ignore_unknown: bool) -> Arc<Resolver> {
        let mut nameservers: Vec<SocketAddr> = config
            .nameservers
            .iter()
            .map(|ip| SocketAddr::new(*ip, NS_PORT))
            .collect();
        let mut searchpath = config.search.clone();
        let mut ndots = config.ndots.max(1);

        if nameservers.is_empty() {
            if let Some(path) = &config.resolv_conf {
                let (ns, search, nd) = parse_resolv_conf(path);
                for ip in ns {
                    tracing::info!(%ip, "adding nameserver from resolver configuration");
                    nameservers.push(SocketAddr::new(ip, NS_PORT));
                }
                if searchpath.is_empty() {
                    searchpath = search;
                }
                if let Some(nd) = nd {
                    ndots = nd.max(1);
                }
            }
        }
        if nameservers.is_empty() {
            tracing::warn!("could not find any nameservers, trying localhost");
            nameservers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), NS_PORT));
        }
        for s in &mut searchpath {
            s.make_ascii_lowercase();
        }

        Arc::new(Resolver {
            engine,
            config,
            ignore_unknown,
            wire: Mutex::new(None),
            inflight: DashMap::new(),
            inner: Mutex::new(Inner {
                nameservers: nameservers
                    .into_iter()
                    .map(|addr| Nameserver {
                        addr,
                        nqueries: 0,
                        nreplies: 0,
                        vc: None,
                    })
                    .collect(),
                searchpath,
                ndots,
                queries: HashMap::new(),
                lru: VecDeque::new(),
                event_queued: false,
                rcode_matrix: [[0; MAX_ATTEMPT as usize]; MAX_RCODE],
            }),
        })
    }

    /// Attach the socket layer.
    pub fn set_wire(&self, wire: Arc<dyn Wire>) {
        *self.wire.lock() = Some(wire);
    }

    fn wire(&self) -> Option<Arc<dyn Wire>> {
        self.wire.lock().clone()
    }

    pub fn nameserver_count(&self) -> usize {
        self.inner.lock().nameservers.len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().queries.len()
    }

    pub fn stats(&self) -> DnsStats {
        let inner = self.inner.lock();
        DnsStats {
            nameservers: inner
                .nameservers
                .iter()
                .map(|ns| (ns.addr, ns.nqueries, ns.nreplies))
                .collect(),
            outstanding: inner.queries.len(),
            rcode_matrix: inner.rcode_matrix,
        }
    }

    /// Forward lookup: A, plus a parallel AAAA slave when IPv6 is on.
    pub fn lookup_a(self: &Arc<Self>, name: &str, callback: DnsCallback) {
        if self.wire().is_none() {
            tracing::warn!(name, "cannot send query, no DNS socket");
            self.fail_lookup(callback, "No DNS socket");
            return;
        }
        let Some(callback) = self.try_join_inflight(name, callback) else {
            return;
        };

        let master_xact = {
            let inner = &mut *self.inner.lock();

            let do_searchpath = self.config.res_defnames
                && !inner.searchpath.is_empty()
                && !name.ends_with('.');
            let nd = name.chars().filter(|c| *c == '.').count() as u32;
            let mut qname = name.to_string();
            let mut next_suffix = 0;
            if do_searchpath && nd < inner.ndots {
                qname = format!("{}.{}", name, inner.searchpath[0]);
                next_suffix = 1;
                tracing::debug!(name = %qname, "search path applied");
            }

            let query_id = alloc_query_id(inner);
            // A queries go without EDNS; it breaks too many resolvers
            let (wire_buf, question) = match message::build_query(&qname, TYPE_A, query_id, 0) {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::warn!(%err, "could not build query");
                    self.fail_lookup(callback, "Internal error");
                    return;
                }
            };

            let xact = self.engine.next_id();
            let now = self.engine.clock().mono();
            inner.queries.insert(
                xact,
                Query {
                    query_id,
                    name: qname,
                    orig: name.to_string(),
                    wire_buf,
                    question,
                    qtype: TYPE_A,
                    nsends: 0,
                    need_vc: false,
                    pending: false,
                    start: now,
                    sent: now,
                    queued: now,
                    callback: Some(callback),
                    waiters: Vec::new(),
                    attempt: 0,
                    rcode: 0,
                    slave: None,
                    master: None,
                    do_searchpath,
                    next_suffix,
                    answers: Vec::new(),
                    error: None,
                    hash_key: Some(name.to_string()),
                },
            );
            self.inflight.insert(name.to_string(), xact);
            self.send_query(inner, xact);
            xact
        };
        if self.config.ipv6 {
            self.spawn_slave_aaaa(master_xact);
        }
    }

    /// Reverse lookup. Shares the pipeline with forward lookups, minus
    /// search paths and slaves.
    pub fn lookup_ptr(self: &Arc<Self>, addr: IpAddr, callback: DnsCallback) {
        let qname = message::ptr_name(addr);
        if self.wire().is_none() {
            tracing::warn!(name = %qname, "cannot send query, no DNS socket");
            self.fail_lookup(callback, "No DNS socket");
            return;
        }
        let Some(callback) = self.try_join_inflight(&qname, callback) else {
            return;
        };

        let inner = &mut *self.inner.lock();
        let query_id = alloc_query_id(inner);
        let (wire_buf, question) =
            match message::build_query(&qname, TYPE_PTR, query_id, self.config.packet_max) {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::warn!(%err, "could not build PTR query");
                    self.fail_lookup(callback, "Internal error");
                    return;
                }
            };
        let xact = self.engine.next_id();
        let now = self.engine.clock().mono();
        inner.queries.insert(
            xact,
            Query {
                query_id,
                name: qname.clone(),
                orig: qname.clone(),
                wire_buf,
                question,
                qtype: TYPE_PTR,
                nsends: 0,
                need_vc: false,
                pending: false,
                start: now,
                sent: now,
                queued: now,
                callback: Some(callback),
                waiters: Vec::new(),
                attempt: 0,
                rcode: 0,
                slave: None,
                master: None,
                do_searchpath: false,
                next_suffix: 0,
                answers: Vec::new(),
                error: None,
                hash_key: Some(qname.clone()),
            },
        );
        self.inflight.insert(qname, xact);
        self.send_query(inner, xact);
    }

    fn fail_lookup(&self, callback: DnsCallback, error: &'static str) {
        self.engine
            .schedule(Call::new("Resolver::failLookup", move || {
                callback(&[], Some(error));
            }));
    }

    /// Hand the callback to an identical in-flight lookup when one
    /// exists; otherwise give it back.
    fn try_join_inflight(&self, key: &str, callback: DnsCallback) -> Option<DnsCallback> {
        let Some(master_xact) = self.inflight.get(key).map(|v| *v) else {
            return Some(callback);
        };
        let mut inner = self.inner.lock();
        match inner.queries.get_mut(&master_xact) {
            Some(master) => {
                tracing::debug!(name = key, "joining in-flight lookup");
                master.waiters.push(callback);
                None
            }
            None => Some(callback),
        }
    }

    /// Issue the paired AAAA query, linked to and sharing the start time
    /// of its master.
    fn spawn_slave_aaaa(self: &Arc<Self>, master_xact: u64) {
        let inner = &mut *self.inner.lock();
        let (name, orig, start) = match inner.queries.get(&master_xact) {
            Some(m) => (m.name.clone(), m.orig.clone(), m.start),
            None => return,
        };
        let query_id = alloc_query_id(inner);
        let (wire_buf, question) =
            match message::build_query(&name, TYPE_AAAA, query_id, self.config.packet_max) {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::debug!(%err, "slave AAAA query not built");
                    return;
                }
            };
        let xact = self.engine.next_id();
        let now = self.engine.clock().mono();
        inner.queries.insert(
            xact,
            Query {
                query_id,
                name,
                orig,
                wire_buf,
                question,
                qtype: TYPE_AAAA,
                nsends: 0,
                need_vc: false,
                pending: false,
                start,
                sent: now,
                queued: now,
                callback: None,
                waiters: Vec::new(),
                attempt: 0,
                rcode: 0,
                slave: None,
                master: Some(master_xact),
                do_searchpath: false,
                next_suffix: 0,
                answers: Vec::new(),
                error: None,
                hash_key: None,
            },
        );
        if let Some(m) = inner.queries.get_mut(&master_xact) {
            m.slave = Some(xact);
        }
        self.send_query(inner, xact);
    }

    /// Transmit (or re-transmit) a query to the next nameserver in the
    /// rotation and arm the retransmit timer.
    fn send_query(self: &Arc<Self>, inner: &mut Inner, xact: u64) {
        let Some(wire) = self.wire() else {
            tracing::warn!("cannot send query, no DNS socket");
            return;
        };
        if inner.nameservers.is_empty() {
            tracing::warn!("cannot send query, no DNS nameservers known");
            return;
        }
        let nns = inner.nameservers.len();
        let now = self.engine.clock().mono();

        let (ns_idx, need_vc, payload) = {
            let Some(q) = inner.queries.get_mut(&xact) else {
                return;
            };
            let ns_idx = (q.nsends as usize) % nns;
            q.nsends += 1;
            q.sent = now;
            q.queued = now;
            q.pending = true;
            (ns_idx, q.need_vc, q.wire_buf.clone())
        };

        inner.nameservers[ns_idx].nqueries += 1;
        let addr = inner.nameservers[ns_idx].addr;
        if need_vc {
            self.vc_send_query(inner, ns_idx, &payload, &wire);
        } else {
            wire.udp_send(ns_idx, addr, &payload);
        }

        inner.lru.retain(|id| *id != xact);
        inner.lru.push_back(xact);
        self.tickle_queue(inner);
    }

    /// Arm the queue-scan timer if it is not already pending.
    fn tickle_queue(self: &Arc<Self>, inner: &mut Inner) {
        if inner.event_queued || inner.lru.is_empty() {
            return;
        }
        let when = self.config.retransmit().min(self.config.query_timeout());
        inner.event_queued = true;
        let me = self.clone();
        self.engine.schedule_after(
            when,
            Call::new("Resolver::checkQueue", move || {
                me.check_queue();
            }),
        );
    }

    /// Sweep the outstanding queue: resend queries whose backoff expired,
    /// finalize queries that ran out of total time.
    pub fn check_queue(self: &Arc<Self>) {
        let mut give_up: Vec<(u64, String)> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            inner.event_queued = false;
            if inner.nameservers.is_empty() {
                // reconfiguring or shutting down
                return;
            }
            let nns = inner.nameservers.len() as u32;
            let now = self.engine.clock().mono();
            let retransmit = self.config.retransmit();
            let query_timeout = self.config.query_timeout();

            let snapshot: Vec<u64> = inner.lru.iter().copied().collect();
            for id in snapshot {
                let Some(q) = inner.queries.get(&id) else {
                    inner.lru.retain(|x| *x != id);
                    continue;
                };
                // the queue is ordered by queue-insertion time
                if now.duration_since(q.queued) < retransmit {
                    break;
                }
                let exp = ((q.nsends.saturating_sub(1)) / nns).min(16);
                let backoff = retransmit * (1u32 << exp);
                if now.duration_since(q.sent) < backoff {
                    // retransmit timer still running: rotate to the back
                    inner.lru.retain(|x| *x != id);
                    inner.lru.push_back(id);
                    if let Some(q) = inner.queries.get_mut(&id) {
                        q.queued = now;
                    }
                    continue;
                }

                inner.lru.retain(|x| *x != id);
                let (elapsed, nsends, rcode) = {
                    let q = inner.queries.get_mut(&id).unwrap();
                    q.pending = false;
                    (now.duration_since(q.start), q.nsends, q.rcode)
                };
                if elapsed < query_timeout {
                    self.send_query(inner, id);
                } else {
                    tracing::debug!(
                        xact = id,
                        nsends,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "giving up on query"
                    );
                    let text = if rcode != 0 {
                        rcode_text(rcode).to_string()
                    } else {
                        "Timeout".to_string()
                    };
                    give_up.push((id, text));
                }
            }
            self.tickle_queue(inner);
        }
        for (id, error) in give_up {
            self.finalize(id, Some(error));
        }
    }

    /// A UDP datagram arrived.
    pub fn receive(self: &Arc<Self>, from: SocketAddr, data: &[u8]) {
        {
            let inner = &mut *self.inner.lock();
            let idx = inner.nameservers.iter().position(|ns| ns.addr == from);
            if let Some(i) = idx {
                inner.nameservers[i].nreplies += 1;
            }
            if inner.lru.is_empty() {
                // no pending query, no reason to look at replies
                return;
            }
            if idx.is_none() && self.ignore_unknown {
                tracing::warn!(%from, "reply from unknown nameserver");
                return;
            }
        }
        self.grok_reply(data);
    }

    /// Parse and route one reply (UDP datagram or TCP frame).
    fn grok_reply(self: &Arc<Self>, data: &[u8]) {
        let message = match message::parse_message(data) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(%err, "malformed DNS response");
                return;
            }
        };
        let after = {
            let inner = &mut *self.inner.lock();
            let Some(xact) = find_query(inner, message.id) else {
                tracing::debug!(qid = message.id, "late DNS response");
                return;
            };

            // spoofing defence: the question must be ours
            {
                let q = &inner.queries[&xact];
                let matches = message
                    .question
                    .as_ref()
                    .map(|theirs| theirs.matches(&q.question))
                    .unwrap_or(false);
                if !matches {
                    tracing::debug!(name = %q.question.name, "DNS query mismatch");
                    return;
                }
            }

            inner.lru.retain(|x| *x != xact);
            inner.queries.get_mut(&xact).unwrap().pending = false;

            if message.truncated {
                if !inner.queries[&xact].need_vc {
                    tracing::debug!(qid = message.id, "truncated reply, switching to TCP");
                    let q = inner.queries.get_mut(&xact).unwrap();
                    q.need_vc = true;
                    q.nsends = q.nsends.saturating_sub(1);
                    self.send_query(inner, xact);
                    After::Nothing
                } else {
                    // a truncated TCP response: no point trying TCP again
                    After::Finalize(xact, Some("Truncated TCP DNS response".to_string()))
                }
            } else if message.rcode != 0 {
                let rcode = message.rcode;
                let attempt = {
                    let q = inner.queries.get_mut(&xact).unwrap();
                    q.rcode = rcode;
                    q.attempt
                };
                rcode_count(inner, rcode, attempt);

                let retry_servfail = {
                    let q = inner.queries.get_mut(&xact).unwrap();
                    if rcode == 2 {
                        // server failure: the name server was unable to
                        // process this query
                        q.attempt += 1;
                        q.attempt < MAX_ATTEMPT
                    } else {
                        false
                    }
                };
                if retry_servfail {
                    tracing::debug!(qid = message.id, "SERVFAIL, retrying");
                    self.send_query(inner, xact);
                    After::Nothing
                } else if rcode == 3 && self.searchpath_retry(inner, xact) {
                    After::RespawnSlave(xact)
                } else {
                    After::Finalize(xact, Some(rcode_text(rcode).to_string()))
                }
            } else {
                let attempt = inner.queries[&xact].attempt;
                rcode_count(inner, 0, attempt);
                inner.queries.get_mut(&xact).unwrap().answers = message.answers;
                After::Finalize(xact, None)
            }
        };
        match after {
            After::Nothing => {}
            After::Finalize(xact, error) => self.finalize(xact, error),
            After::RespawnSlave(xact) => {
                if self.config.ipv6 {
                    self.spawn_slave_aaaa(xact);
                }
            }
        }
    }

    /// NXDOMAIN on a master with search path left: restore the original
    /// name, take the next suffix, regenerate the id, kill the AAAA
    /// slave, rebuild and resend. Returns false when the path is spent.
    fn searchpath_retry(self: &Arc<Self>, inner: &mut Inner, xact: u64) -> bool {
        let eligible = {
            let Some(q) = inner.queries.get(&xact) else {
                return false;
            };
            q.master.is_none() && q.do_searchpath && q.attempt < MAX_ATTEMPT
        };
        if !eligible {
            return false;
        }

        // the slave was asking for the failed name; kill it
        if let Some(sid) = inner.queries.get(&xact).and_then(|q| q.slave) {
            inner.lru.retain(|x| *x != sid);
            inner.queries.remove(&sid);
        }

        let query_id = alloc_query_id(inner);
        let spent = {
            let suffix = {
                let q = &inner.queries[&xact];
                inner.searchpath.get(q.next_suffix).cloned()
            };
            let q = inner.queries.get_mut(&xact).unwrap();
            q.slave = None;
            match suffix {
                Some(s) => {
                    q.name = format!("{}.{}", q.orig, s);
                    q.next_suffix += 1;
                    false
                }
                None => {
                    q.name = q.orig.clone();
                    q.attempt += 1;
                    q.attempt >= MAX_ATTEMPT
                }
            }
        };
        if spent {
            return false;
        }

        let (name, qtype) = {
            let q = &inner.queries[&xact];
            (q.name.clone(), q.qtype)
        };
        tracing::debug!(name = %name, "NXDOMAIN, trying next search-path entry");
        match message::build_query(&name, qtype, query_id, 0) {
            Ok((wire_buf, question)) => {
                let q = inner.queries.get_mut(&xact).unwrap();
                q.query_id = query_id;
                q.wire_buf = wire_buf;
                q.question = question;
                q.nsends = 0;
                self.send_query(inner, xact);
                true
            }
            Err(err) => {
                tracing::warn!(%err, "could not rebuild search-path query");
                false
            }
        }
    }

    /// Complete a lookup: wait for all siblings, merge A/AAAA answer
    /// sets, fire the user callback and every queued waiter, and drop
    /// the in-flight entry.
    fn finalize(self: &Arc<Self>, xact: u64, error: Option<String>) {
        let done = {
            let inner = &mut *self.inner.lock();
            finalize_locked(inner, &self.inflight, xact, error, self.config.v4_first)
        };
        let Some((callbacks, answers, final_error)) = done else {
            return;
        };
        tracing::debug!(
            n = answers.len(),
            error = final_error.as_deref().unwrap_or("OK"),
            "sending DNS results to caller"
        );
        for cb in callbacks {
            cb(&answers, final_error.as_deref());
        }
    }

    // --- TCP virtual circuit glue --------------------------------------

    fn vc_send_query(
        &self,
        inner: &mut Inner,
        ns_idx: usize,
        payload: &[u8],
        wire: &Arc<dyn Wire>,
    ) {
        let connect = {
            let ns = &mut inner.nameservers[ns_idx];
            if ns.vc.is_none() {
                ns.vc = Some(VirtualCircuit::new());
                true
            } else {
                false
            }
        };
        if connect {
            let addr = inner.nameservers[ns_idx].addr;
            wire.vc_connect(ns_idx, addr, self.config.vc_connect_timeout());
        }
        let ns = &mut inner.nameservers[ns_idx];
        if let Some(vc) = ns.vc.as_mut() {
            vc.enqueue(payload);
            if let Some(chunk) = vc.take_write() {
                wire.vc_send(ns_idx, &chunk);
            }
        }
    }

    /// The circuit's connect completed; flush anything queued.
    pub fn vc_connected(self: &Arc<Self>, ns_idx: usize) {
        let Some(wire) = self.wire() else { return };
        let inner = &mut *self.inner.lock();
        let Some(ns) = inner.nameservers.get_mut(ns_idx) else {
            return;
        };
        if let Some(vc) = ns.vc.as_mut() {
            vc.connected();
            if let Some(chunk) = vc.take_write() {
                wire.vc_send(ns_idx, &chunk);
            }
        }
    }

    /// The circuit could not be established. Queries that demanded it
    /// are left to time out naturally.
    pub fn vc_connect_failed(self: &Arc<Self>, ns_idx: usize) {
        let inner = &mut *self.inner.lock();
        if let Some(ns) = inner.nameservers.get_mut(ns_idx) {
            tracing::warn!(addr = %ns.addr, "failed to connect to nameserver over TCP");
            ns.vc = None;
        }
    }

    /// One write on the circuit finished; start the next.
    pub fn vc_write_done(self: &Arc<Self>, ns_idx: usize) {
        let Some(wire) = self.wire() else { return };
        let inner = &mut *self.inner.lock();
        let Some(ns) = inner.nameservers.get_mut(ns_idx) else {
            return;
        };
        if let Some(vc) = ns.vc.as_mut() {
            vc.write_done();
            if let Some(chunk) = vc.take_write() {
                wire.vc_send(ns_idx, &chunk);
            }
        }
    }

    /// Raw bytes arrived on the circuit.
    pub fn vc_data(self: &Arc<Self>, ns_idx: usize, data: &[u8]) {
        let frames = {
            let inner = &mut *self.inner.lock();
            match inner
                .nameservers
                .get_mut(ns_idx)
                .and_then(|ns| ns.vc.as_mut())
            {
                Some(vc) => vc.on_data(data),
                None => return,
            }
        };
        {
            let inner = &mut *self.inner.lock();
            if let Some(ns) = inner.nameservers.get_mut(ns_idx) {
                ns.nreplies += frames.len() as u64;
            }
        }
        for frame in frames {
            self.grok_reply(&frame);
        }
    }

    /// The circuit went away; reset the owning slot.
    pub fn vc_closed(self: &Arc<Self>, ns_idx: usize) {
        let inner = &mut *self.inner.lock();
        if let Some(ns) = inner.nameservers.get_mut(ns_idx) {
            ns.vc = None;
        }
    }
}

type Finalized = (SmallVec<[DnsCallback; 4]>, Vec<ResourceRecord>, Option<String>);

fn finalize_locked(
    inner: &mut Inner,
    inflight: &DashMap<String, u64>,
    xact: u64,
    error: Option<String>,
    v4_first: bool,
) -> Option<Finalized> {
    let master_xact = {
        let q = inner.queries.get_mut(&xact)?;
        if let Some(e) = error {
            q.error = Some(e);
        }
        q.master.unwrap_or(xact)
    };

    // if any sibling is still pending, wait for it to come in
    let slave_id = inner.queries.get(&master_xact)?.slave;
    let chain = [Some(master_xact), slave_id];
    if chain.iter().flatten().any(|id| {
        inner
            .queries
            .get(id)
            .map(|q| q.pending)
            .unwrap_or(false)
    }) {
        return None;
    }

    let mut master = inner.queries.remove(&master_xact)?;
    inner.lru.retain(|x| *x != master_xact);
    let slave = master.slave.and_then(|sid| {
        inner.lru.retain(|x| *x != sid);
        inner.queries.remove(&sid)
    });

    let mut answers = std::mem::take(&mut master.answers);
    let mut final_error = master.error.take();
    if let Some(mut sl) = slave {
        tracing::debug!(
            name = %master.name,
            a = answers.len(),
            aaaa = sl.answers.len(),
            "merging DNS results"
        );
        if sl.error.is_none() {
            if answers.is_empty() {
                // first response empty or failed, just use the second
                answers = std::mem::take(&mut sl.answers);
                final_error = None;
            } else if v4_first {
                answers.append(&mut sl.answers);
            } else {
                let mut v = std::mem::take(&mut sl.answers);
                v.append(&mut answers);
                answers = v;
            }
        }
    }

    if let Some(key) = master.hash_key.take() {
        inflight.remove(&key);
    }
    let mut callbacks: SmallVec<[DnsCallback; 4]> = SmallVec::new();
    if let Some(cb) = master.callback.take() {
        callbacks.push(cb);
    }
    callbacks.extend(master.waiters.drain(..));
    Some((callbacks, answers, final_error))
}

fn find_query(inner: &Inner, query_id: u16) -> Option<u64> {
    inner.lru.iter().rev().copied().find(|id| {
        inner
            .queries
            .get(id)
            .map(|q| q.query_id == query_id)
            .unwrap_or(false)
    })
}

/// Draw a random 16-bit id; on collision with any in-flight query walk
/// forward until unique. A full wrap means the resolver is drowning.
fn alloc_query_id(inner: &Inner) -> u16 {
    let in_use = |id: u16| inner.queries.values().any(|q| q.query_id == id);
    let first: u16 = rand::random();
    let mut id = first;
    while in_use(id) {
        id = id.wrapping_add(1);
        if id == first {
            tracing::warn!("too many pending DNS requests");
            break;
        }
    }
    id
}

fn rcode_count(inner: &mut Inner, rcode: u8, attempt: u32) {
    let r = (rcode as usize).min(MAX_RCODE - 1);
    let a = (attempt as usize).min(MAX_ATTEMPT as usize - 1);
    inner.rcode_matrix[r][a] += 1;
}

/// Pull nameservers, search path and ndots out of a resolv.conf-style
/// file. Soft-fails to empty on read errors.
fn parse_resolv_conf(path: &std::path::Path) -> (Vec<IpAddr>, Vec<String>, Option<u32>) {
    let mut ns = Vec::new();
    let mut search = Vec::new();
    let mut ndots = None;
    let Ok(contents) = std::fs::read_to_string(path) else {
        return (ns, search, ndots);
    };
    for line in contents.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("nameserver") => {
                if let Some(ip) = words.next().and_then(|w| w.parse().ok()) {
                    ns.push(ip);
                }
            }
            Some("domain") => {
                if let Some(d) = words.next() {
                    search = vec![d.to_string()];
                }
            }
            Some("search") => {
                search = words.map(str::to_string).collect();
            }
            Some("options") => {
                for opt in words {
                    if let Some(v) = opt.strip_prefix("ndots:") {
                        ndots = v.parse().ok();
                    }
                }
            }
            _ => {}
        }
    }
    (ns, search, ndots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::{RrData, build_reply, parse_message};
    use crate::dns::wire::MockWire;
    use std::net::Ipv6Addr;
    use std::time::Duration;

    fn test_config(ipv6: bool) -> DnsConfig {
        DnsConfig {
            nameservers: vec!["10.0.0.1".parse().unwrap()],
            ipv6,
            query_timeout_ms: 30_000,
            retransmit_ms: 5_000,
            res_defnames: false,
            ndots: 1,
            packet_max: 0,
            v4_first: true,
            search: Vec::new(),
            vc_connect_timeout_ms: 1_000,
            resolv_conf: None,
        }
    }

    struct Rig {
        engine: Arc<Engine>,
        wire: Arc<MockWire>,
        resolver: Arc<Resolver>,
    }

    fn rig(config: DnsConfig) -> Rig {
        let engine = Engine::new();
        engine.clock().freeze();
        let resolver = Resolver::new(engine.clone(), config, true);
        let wire = MockWire::new();
        resolver.set_wire(wire.clone());
        Rig {
            engine,
            wire,
            resolver,
        }
    }

    fn ns_addr() -> SocketAddr {
        "10.0.0.1:53".parse().unwrap()
    }

    type Results = Arc<Mutex<Vec<(Vec<ResourceRecord>, Option<String>)>>>;

    fn capture(results: Results) -> DnsCallback {
        Box::new(move |rrs, err| {
            results
                .lock()
                .push((rrs.to_vec(), err.map(str::to_string)));
        })
    }

    fn reply_to(sent: &[u8], answers: &[(u32, RrData)], rcode: u8, tc: bool) -> Vec<u8> {
        let q = parse_message(sent).unwrap();
        build_reply(q.id, q.question.as_ref().unwrap(), answers, rcode, tc)
    }

    #[test]
    fn concurrent_identical_lookups_share_one_wire_query() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("www.example.org", capture(results.clone()));
        r.resolver.lookup_a("www.example.org", capture(results.clone()));
        r.engine.run_until_idle();

        let sent = r.wire.udp_sent();
        assert_eq!(sent.len(), 1, "deduplicated to one wire query");

        let reply = reply_to(
            &sent[0].2,
            &[(60, RrData::A("192.0.2.7".parse().unwrap()))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &reply);
        r.engine.run_until_idle();

        let got = results.lock();
        assert_eq!(got.len(), 2, "both callbacks fired");
        assert_eq!(got[0].0, got[1].0, "identical result vectors");
        assert_eq!(got[0].0.len(), 1);
        assert!(got[0].1.is_none());
        assert_eq!(r.resolver.outstanding(), 0);
        assert!(r.resolver.inflight.is_empty());
    }

    #[test]
    fn a_and_aaaa_slaves_merge_v4_first() {
        let r = rig(test_config(true));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("dual.example.org", capture(results.clone()));
        r.engine.run_until_idle();

        let sent = r.wire.udp_sent();
        assert_eq!(sent.len(), 2, "A and AAAA go out in parallel");

        // answer the A query first; the callback must wait for the slave
        let a_reply = reply_to(
            &sent[0].2,
            &[(60, RrData::A("192.0.2.1".parse().unwrap()))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &a_reply);
        r.engine.run_until_idle();
        assert!(results.lock().is_empty(), "waits for the AAAA sibling");

        let aaaa_reply = reply_to(
            &sent[1].2,
            &[(60, RrData::Aaaa(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &aaaa_reply);
        r.engine.run_until_idle();

        let got = results.lock();
        assert_eq!(got.len(), 1);
        let rrs = &got[0].0;
        assert_eq!(rrs.len(), 2);
        assert!(rrs[0].is_v4(), "v4_first puts A records ahead");
        assert!(!rrs[1].is_v4());
    }

    #[test]
    fn erroring_sibling_does_not_poison_the_result() {
        let r = rig(test_config(true));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("half.example.org", capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();

        // A errors, AAAA succeeds: the non-erroring set wins
        let a_reply = reply_to(&sent[0].2, &[], 5, false);
        r.resolver.receive(ns_addr(), &a_reply);
        let aaaa_reply = reply_to(
            &sent[1].2,
            &[(60, RrData::Aaaa(Ipv6Addr::LOCALHOST))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &aaaa_reply);
        r.engine.run_until_idle();

        let got = results.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.len(), 1);
        assert!(got[0].1.is_none());
    }

    #[test]
    fn nxdomain_walks_the_search_path() {
        let mut cfg = test_config(false);
        cfg.res_defnames = true;
        cfg.search = vec!["example.org".to_string()];
        cfg.ndots = 1;
        let r = rig(cfg);
        let results: Results = Arc::new(Mutex::new(Vec::new()));

        // one dot, so no initial suffix: queried verbatim first
        r.resolver.lookup_a("db.intra", capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();
        assert_eq!(sent.len(), 1);
        let first = parse_message(&sent[0].2).unwrap();
        assert_eq!(first.question.as_ref().unwrap().name, "db.intra");

        r.resolver
            .receive(ns_addr(), &reply_to(&sent[0].2, &[], 3, false));
        r.engine.run_until_idle();

        let sent = r.wire.udp_sent();
        assert_eq!(sent.len(), 2, "retried with the search suffix");
        let second = parse_message(&sent[1].2).unwrap();
        assert_eq!(
            second.question.as_ref().unwrap().name,
            "db.intra.example.org"
        );
        assert_ne!(second.id, first.id, "fresh id for the rebuilt query");

        r.resolver.receive(
            ns_addr(),
            &reply_to(
                &sent[1].2,
                &[(60, RrData::A("192.0.2.9".parse().unwrap()))],
                0,
                false,
            ),
        );
        r.engine.run_until_idle();
        let got = results.lock();
        assert_eq!(got.len(), 1);
        assert!(got[0].1.is_none());
        assert_eq!(got[0].0.len(), 1);
    }

    #[test]
    fn unqualified_names_get_the_first_suffix_up_front() {
        let mut cfg = test_config(false);
        cfg.res_defnames = true;
        cfg.search = vec!["example.org".to_string()];
        cfg.ndots = 2;
        let r = rig(cfg);
        r.resolver
            .lookup_a("host", Box::new(|_, _| {}));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();
        let q = parse_message(&sent[0].2).unwrap();
        assert_eq!(q.question.as_ref().unwrap().name, "host.example.org");
    }

    #[test]
    fn servfail_retries_to_the_attempt_cap() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("flaky.example.org", capture(results.clone()));
        r.engine.run_until_idle();

        for round in 0..MAX_ATTEMPT {
            let sent = r.wire.udp_sent();
            assert_eq!(sent.len() as u32, round + 1);
            let reply = reply_to(&sent[round as usize].2, &[], 2, false);
            r.resolver.receive(ns_addr(), &reply);
            r.engine.run_until_idle();
        }

        let got = results.lock();
        assert_eq!(got.len(), 1, "finalized after the attempt cap");
        assert_eq!(got[0].1.as_deref(), Some("DNS Server Failure"));
    }

    #[test]
    fn truncation_switches_to_tcp_and_tcp_truncation_fails() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("big.example.org", capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();

        r.resolver
            .receive(ns_addr(), &reply_to(&sent[0].2, &[], 0, true));
        r.engine.run_until_idle();

        assert_eq!(r.wire.vc_connects(), vec![(0, ns_addr())]);
        // the connect completes; the queued frame flushes
        r.resolver.vc_connected(0);
        let frames = r.wire.vc_sent();
        assert_eq!(frames.len(), 1);
        let (prefix, payload) = frames[0].1.split_at(2);
        assert_eq!(
            u16::from_be_bytes([prefix[0], prefix[1]]) as usize,
            payload.len()
        );

        // a truncated TCP response is terminal
        let tcp_reply = reply_to(payload, &[], 0, true);
        let mut framed = (tcp_reply.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&tcp_reply);
        r.resolver.vc_data(0, &framed);
        r.engine.run_until_idle();

        let got = results.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.as_deref(), Some("Truncated TCP DNS response"));
    }

    #[test]
    fn retransmit_backs_off_and_times_out() {
        let mut cfg = test_config(false);
        cfg.retransmit_ms = 1000;
        cfg.query_timeout_ms = 10_000;
        let r = rig(cfg);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("quiet.example.org", capture(results.clone()));
        r.engine.run_until_idle();
        assert_eq!(r.wire.udp_sent().len(), 1);

        // first backoff: retransmit * 2^0
        r.engine.clock().advance(Duration::from_millis(1001));
        r.engine.run_until_idle();
        assert_eq!(r.wire.udp_sent().len(), 2);

        // second send done; now the backoff doubles (one ns pool)
        r.engine.clock().advance(Duration::from_millis(1001));
        r.engine.run_until_idle();
        assert_eq!(
            r.wire.udp_sent().len(),
            2,
            "second retransmit still backing off"
        );
        r.engine.clock().advance(Duration::from_millis(1100));
        r.engine.run_until_idle();
        assert_eq!(r.wire.udp_sent().len(), 3);

        // run the clock out entirely
        r.engine.clock().advance(Duration::from_secs(11));
        r.engine.run_until_idle();
        let got = results.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.as_deref(), Some("Timeout"));
        assert_eq!(r.resolver.outstanding(), 0);
    }

    #[test]
    fn replies_from_strangers_are_dropped() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("safe.example.org", capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();
        let reply = reply_to(
            &sent[0].2,
            &[(60, RrData::A("203.0.113.66".parse().unwrap()))],
            0,
            false,
        );
        r.resolver
            .receive("203.0.113.9:53".parse().unwrap(), &reply);
        r.engine.run_until_idle();
        assert!(results.lock().is_empty(), "spoofed source ignored");
        assert_eq!(r.resolver.outstanding(), 1);
    }

    #[test]
    fn question_mismatch_is_ignored() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver.lookup_a("real.example.org", capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();
        let q = parse_message(&sent[0].2).unwrap();
        let forged = build_reply(
            q.id,
            &Question {
                name: "evil.example.org".to_string(),
                qtype: TYPE_A,
                qclass: message::CLASS_IN,
            },
            &[(60, RrData::A("203.0.113.1".parse().unwrap()))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &forged);
        r.engine.run_until_idle();
        assert!(results.lock().is_empty());
    }

    #[test]
    fn ptr_lookup_builds_reverse_name() {
        let r = rig(test_config(false));
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        r.resolver
            .lookup_ptr("192.0.2.44".parse().unwrap(), capture(results.clone()));
        r.engine.run_until_idle();
        let sent = r.wire.udp_sent();
        let q = parse_message(&sent[0].2).unwrap();
        let question = q.question.as_ref().unwrap();
        assert_eq!(question.name, "44.2.0.192.in-addr.arpa");
        assert_eq!(question.qtype, TYPE_PTR);

        let reply = reply_to(
            &sent[0].2,
            &[(60, RrData::Ptr("www.example.org".to_string()))],
            0,
            false,
        );
        r.resolver.receive(ns_addr(), &reply);
        r.engine.run_until_idle();
        let got = results.lock();
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0].0[0].data, RrData::Ptr(p) if p == "www.example.org"));
    }
}
