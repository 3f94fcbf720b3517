//! The shared object store: entries, their in-memory data windows, and
//! the reader/producer coupling.
//!
//! One producer (the forwarding path) appends bytes into a [`StoreEntry`]
//! while any number of [`reader::StoreReader`]s stream them out. State
//! transitions are one-way (`Pending` to `Ok`, abort is sticky), and every
//! reader re-checks entry flags after each suspension because an abort can
//! land between calls.
//!
//! Object bytes are the serialized reply head followed by the body, so a
//! reader starting at offset zero always sees the head first, whether the
//! bytes come from memory or from a swap file (where the metadata envelope
//! precedes them, see [`meta`]).

pub mod meta;
pub mod reader;
pub mod swap;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use http::{HeaderMap, Method};
use parking_lot::Mutex;

use crate::msg::HttpReply;

/// Producer progress of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    /// The producer is still filling the entry.
    Pending,
    /// All bytes are in (or the entry was aborted).
    Ok,
}

/// Relationship of the entry to its swap file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapStatus {
    None,
    Writing,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemStatus {
    NotInMemory,
    InMemory,
}

/// Result of matching a request against a stored variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaryOutcome {
    /// The reply does not vary.
    None,
    /// This is the right variant for the request.
    Match,
    /// Some other variant may exist; rerun the lookup with the request's
    /// selecting-header signature.
    Other,
    /// Variance cannot be satisfied (object loop or `Vary: *`).
    Cancel,
}

/// Entry bit-flags. `aborted` is sticky.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntryFlags {
    pub aborted: bool,
    pub special: bool,
    pub fwd_hdr_wait: bool,
    pub key_private: bool,
    pub release_requested: bool,
    pub negative_cached: bool,
}

/// The few request attributes the store needs to remember for the
/// quick-abort decision after all readers are gone.
#[derive(Clone, Copy, Debug)]
pub struct RequestHints {
    pub cachable: bool,
    /// Admin configured range fetches to download fully for caching.
    pub range_full_download: bool,
}

impl Default for RequestHints {
    fn default() -> Self {
        Self {
            cachable: true,
            range_full_download: false,
        }
    }
}

/// Cache key: method plus canonical URL, plus the variant signature for
/// `Vary`-selected alternates (`None` addresses the base object).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub method: Method,
    pub url: String,
    pub variant: Option<String>,
}

struct MemObject {
    reply: Option<HttpReply>,
    headers_parsed: bool,
    inmem_lo: u64,
    data: Vec<u8>,
    swap_hdr_sz: u64,
    readers: Vec<(u64, Weak<reader::StoreReader>)>,
    hints: RequestHints,
    producer_waker: Option<Arc<dyn Fn() + Send + Sync>>,
    buffered: bool,
}

impl MemObject {
    fn new() -> Self {
        Self {
            reply: None,
            headers_parsed: false,
            inmem_lo: 0,
            data: Vec::new(),
            swap_hdr_sz: 0,
            readers: Vec::new(),
            hints: RequestHints::default(),
            producer_waker: None,
            buffered: false,
        }
    }

    fn end_offset(&self) -> u64 {
        self.inmem_lo + self.data.len() as u64
    }
}

struct EntryInner {
    method: Method,
    url: String,
    variant: Option<String>,
    store_status: StoreStatus,
    swap_status: SwapStatus,
    mem_status: MemStatus,
    flags: EntryFlags,
    timestamp: Option<SystemTime>,
    lastmod: Option<SystemTime>,
    expires: Option<SystemTime>,
    lock_count: u32,
    refcount: u64,
    mem: Option<MemObject>,
    swap_file: Option<u32>,
    swap_file_sz: u64,
    /// Selecting-header signature this variant was stored under.
    vary_headers: Option<String>,
    object_sz: Option<u64>,
}

/// One cached object. Shared between its producer and all readers; all
/// mutation goes through short critical sections, and no callback is ever
/// invoked while the entry lock is held.
pub struct StoreEntry {
    id: u64,
    store: Weak<Store>,
    inner: Mutex<EntryInner>,
}

impl StoreEntry {
    fn new(id: u64, store: Weak<Store>, method: Method, url: String, variant: Option<String>) -> Self {
        Self {
            id,
            store,
            inner: Mutex::new(EntryInner {
                method,
                url,
                variant,
                store_status: StoreStatus::Pending,
                swap_status: SwapStatus::None,
                mem_status: MemStatus::NotInMemory,
                flags: EntryFlags::default(),
                timestamp: None,
                lastmod: None,
                expires: None,
                lock_count: 0,
                refcount: 0,
                mem: None,
                swap_file: None,
                swap_file_sz: 0,
                vary_headers: None,
                object_sz: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> String {
        self.inner.lock().url.clone()
    }

    pub fn method(&self) -> Method {
        self.inner.lock().method.clone()
    }

    pub fn store_status(&self) -> StoreStatus {
        self.inner.lock().store_status
    }

    pub fn swap_status(&self) -> SwapStatus {
        self.inner.lock().swap_status
    }

    pub fn mem_status(&self) -> MemStatus {
        self.inner.lock().mem_status
    }

    pub fn flags(&self) -> EntryFlags {
        self.inner.lock().flags
    }

    pub fn aborted(&self) -> bool {
        self.inner.lock().flags.aborted
    }

    pub fn special(&self) -> bool {
        self.inner.lock().flags.special
    }

    pub fn set_special(&self) {
        self.inner.lock().flags.special = true;
    }

    pub fn fwd_hdr_wait(&self) -> bool {
        self.inner.lock().flags.fwd_hdr_wait
    }

    pub fn set_fwd_hdr_wait(&self, on: bool) {
        self.inner.lock().flags.fwd_hdr_wait = on;
    }

    pub fn key_private(&self) -> bool {
        self.inner.lock().flags.key_private
    }

    pub fn set_negative_cached(&self) {
        self.inner.lock().flags.negative_cached = true;
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.inner.lock().timestamp
    }

    pub fn set_timestamp(&self, t: SystemTime) {
        self.inner.lock().timestamp = Some(t);
    }

    pub fn lastmod(&self) -> Option<SystemTime> {
        self.inner.lock().lastmod
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.inner.lock().expires
    }

    pub fn set_expires(&self, t: Option<SystemTime>) {
        self.inner.lock().expires = t;
    }

    /// Reference-count the entry alive across async boundaries.
    pub fn lock(&self) {
        self.inner.lock().lock_count += 1;
    }

    pub fn unlock(&self) {
        let gone = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.lock_count > 0);
            inner.lock_count = inner.lock_count.saturating_sub(1);
            inner.lock_count == 0 && inner.flags.release_requested
        };
        if gone {
            self.drop_from_table();
        }
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock().lock_count
    }

    pub fn hints(&self) -> RequestHints {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.hints)
            .unwrap_or_default()
    }

    pub fn set_hints(&self, hints: RequestHints) {
        if let Some(mem) = self.inner.lock().mem.as_mut() {
            mem.hints = hints;
        }
    }

    /// Create the data window if the entry has none. An existing window
    /// keeps its method association (a HEAD hit on a GET object stays a
    /// GET object).
    pub fn ensure_mem_object(&self) {
        let mut inner = self.inner.lock();
        if inner.mem.is_none() {
            inner.mem = Some(MemObject::new());
        }
    }

    pub fn has_mem_object(&self) -> bool {
        self.inner.lock().mem.is_some()
    }

    pub fn inmem_lo(&self) -> u64 {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.inmem_lo)
            .unwrap_or(0)
    }

    /// Highest produced offset so far.
    pub fn end_offset(&self) -> u64 {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.end_offset())
            .unwrap_or(0)
    }

    /// Total object length once known (`store_status == Ok` or swap
    /// metadata parsed), `None` while still growing.
    pub fn object_len(&self) -> Option<u64> {
        self.inner.lock().object_sz
    }

    pub(crate) fn set_object_len(&self, len: u64) {
        self.inner.lock().object_sz = Some(len);
    }

    pub fn swap_file(&self) -> Option<u32> {
        self.inner.lock().swap_file
    }

    pub fn swap_file_sz(&self) -> u64 {
        self.inner.lock().swap_file_sz
    }

    /// Associate a completed swap file with the entry.
    pub fn set_swap(&self, file: u32, size: u64) {
        let mut inner = self.inner.lock();
        inner.swap_file = Some(file);
        inner.swap_file_sz = size;
        inner.swap_status = SwapStatus::Done;
    }

    /// Mark the producer side finished without touching the byte
    /// accounting. Used when an entry is resurrected from its swap file,
    /// where the object length is only known after the envelope parses.
    pub fn set_store_ok(&self) {
        self.inner.lock().store_status = StoreStatus::Ok;
    }

    pub fn swap_hdr_sz(&self) -> u64 {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.swap_hdr_sz)
            .unwrap_or(0)
    }

    pub(crate) fn set_swap_hdr_sz(&self, sz: u64) {
        if let Some(mem) = self.inner.lock().mem.as_mut() {
            mem.swap_hdr_sz = sz;
        }
    }

    pub fn reply(&self) -> Option<HttpReply> {
        self.inner.lock().mem.as_ref().and_then(|m| m.reply.clone())
    }

    pub fn headers_parsed(&self) -> bool {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.headers_parsed)
            .unwrap_or(false)
    }

    /// Install a reply parsed from swapped-in bytes without re-appending
    /// its serialized form (the bytes are already in the object).
    pub(crate) fn set_reply_parsed(&self, reply: HttpReply) {
        if let Some(mem) = self.inner.lock().mem.as_mut() {
            mem.reply = Some(reply);
            mem.headers_parsed = true;
        }
    }

    /// Fold a revalidation `304` into the stored reply. The serialized
    /// head inside the object bytes is rewritten too, so reader offsets
    /// keep matching what is actually in the stream.
    pub fn update_on_not_modified(&self, fresh: &HttpReply) {
        let mut inner = self.inner.lock();
        let Some(mem) = inner.mem.as_mut() else {
            return;
        };
        let Some(reply) = mem.reply.as_mut() else {
            return;
        };
        let old_hdr = reply.hdr_sz;
        reply.update_on_not_modified(fresh);
        let new_hdr = reply.hdr_sz;
        if mem.inmem_lo == 0 && mem.data.len() >= old_hdr {
            let head = reply.to_bytes();
            let mut data = Vec::with_capacity(head.len() + mem.data.len() - old_hdr);
            data.extend_from_slice(&head);
            data.extend_from_slice(&mem.data[old_hdr..]);
            mem.data = data;
        }
        let delta = new_hdr as i64 - old_hdr as i64;
        if let Some(sz) = inner.object_sz.as_mut() {
            *sz = (*sz as i64 + delta).max(0) as u64;
        }
    }

    pub fn vary_headers(&self) -> Option<String> {
        self.inner.lock().vary_headers.clone()
    }

    pub fn set_vary_headers(&self, sig: Option<String>) {
        self.inner.lock().vary_headers = sig;
    }

    /// Producer: append raw object bytes and kick waiting readers.
    pub fn append(&self, bytes: &[u8]) {
        let kick = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.mem.is_some(), "append without a data window");
            let Some(mem) = inner.mem.as_mut() else {
                return;
            };
            mem.data.extend_from_slice(bytes);
            !mem.buffered
        };
        if kick {
            self.invoke_handlers();
        }
    }

    /// Producer: install the reply head. Serializes it into the object's
    /// byte stream, so readers starting at offset zero see it first.
    pub fn replace_reply(&self, mut reply: HttpReply) {
        reply.refresh_hdr_sz();
        let head = reply.to_bytes();
        {
            let mut inner = self.inner.lock();
            if inner.mem.is_none() {
                inner.mem = Some(MemObject::new());
            }
            let mem = inner.mem.as_mut().unwrap();
            mem.reply = Some(reply);
            mem.headers_parsed = true;
        }
        self.append(&head);
    }

    /// Producer: hold reader notification until `complete` (used when a
    /// synthesized reply is assembled from several appends).
    pub fn buffer(&self) {
        if let Some(mem) = self.inner.lock().mem.as_mut() {
            mem.buffered = true;
        }
    }

    /// Producer: all bytes are in.
    pub fn complete(&self) {
        {
            let mut inner = self.inner.lock();
            inner.store_status = StoreStatus::Ok;
            if let Some(mem) = inner.mem.as_mut() {
                mem.buffered = false;
                if mem.inmem_lo == 0 {
                    inner.mem_status = MemStatus::InMemory;
                }
            }
            let end = inner.mem.as_ref().map(|m| m.end_offset()).unwrap_or(0);
            inner.object_sz = Some(inner.object_sz.unwrap_or(end).max(end));
        }
        self.invoke_handlers();
    }

    /// Producer: give up. Sticky; readers drain what was produced and
    /// then see the flag.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock();
            inner.flags.aborted = true;
            inner.store_status = StoreStatus::Ok;
            let end = inner.mem.as_ref().map(|m| m.end_offset()).unwrap_or(0);
            inner.object_sz = Some(inner.object_sz.unwrap_or(end));
        }
        self.invoke_handlers();
    }

    /// Stamp timestamp/lastmod/expires from the stored reply.
    pub fn timestamps_set(&self, now: SystemTime) {
        let reply = self.reply();
        let mut inner = self.inner.lock();
        let served_date = reply
            .as_ref()
            .and_then(|r| r.date())
            .map(|d| if d > now { now } else { d })
            .unwrap_or(now);
        inner.timestamp = Some(served_date);
        inner.expires = reply.as_ref().and_then(|r| r.expires());
        inner.lastmod = reply.as_ref().and_then(|r| r.last_modified());
    }

    /// Make the entry unfindable and forget it once unreferenced.
    pub fn release_request(&self) {
        {
            let mut inner = self.inner.lock();
            inner.flags.release_requested = true;
            inner.flags.key_private = true;
        }
        self.drop_from_table();
    }

    /// Release the object: remove it from the public table now, destroy
    /// it when the last reference goes.
    pub fn release(&self) {
        self.release_request();
    }

    fn drop_from_table(&self) {
        if let Some(store) = self.store.upgrade() {
            store.forget(self);
        }
    }

    pub(crate) fn key(&self) -> StoreKey {
        let inner = self.inner.lock();
        StoreKey {
            method: inner.method.clone(),
            url: inner.url.clone(),
            variant: inner.variant.clone(),
        }
    }

    /// Whether the object may be served at all.
    pub fn valid_to_send(&self, now: SystemTime) -> bool {
        let inner = self.inner.lock();
        if inner.flags.aborted {
            return false;
        }
        if inner.flags.negative_cached {
            // negative entries die with their expiry
            return match inner.expires {
                Some(exp) => now < exp,
                None => false,
            };
        }
        let has_head = inner
            .mem
            .as_ref()
            .map(|m| m.headers_parsed)
            .unwrap_or(false);
        has_head || inner.swap_file.is_some()
    }

    /// A negatively-cached entry that has not expired yet.
    pub fn check_negative_hit(&self, now: SystemTime) -> bool {
        let inner = self.inner.lock();
        inner.flags.negative_cached
            && inner.store_status == StoreStatus::Ok
            && matches!(inner.expires, Some(exp) if now < exp)
    }

    /// `If-Modified-Since` comparison against the stored object.
    pub fn modified_since(&self, ims: SystemTime) -> bool {
        let inner = self.inner.lock();
        match inner.lastmod.or(inner.timestamp) {
            Some(lm) => lm > ims,
            None => true,
        }
    }

    fn etag_matches(stored: Option<&str>, candidates: &str) -> bool {
        let Some(stored) = stored else {
            return false;
        };
        candidates
            .split(',')
            .map(str::trim)
            .any(|c| c == "*" || c == stored)
    }

    /// Does any `If-Match` candidate match the stored ETag?
    pub fn has_if_match_etag(&self, request: &HeaderMap) -> bool {
        let reply = self.reply();
        let stored = reply.as_ref().and_then(|r| r.etag());
        request
            .get(http::header::IF_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| Self::etag_matches(stored, v))
            .unwrap_or(false)
    }

    /// Does any `If-None-Match` candidate match the stored ETag?
    pub fn has_if_none_match_etag(&self, request: &HeaderMap) -> bool {
        let reply = self.reply();
        let stored = reply.as_ref().and_then(|r| r.etag());
        request
            .get(http::header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| Self::etag_matches(stored, v))
            .unwrap_or(false)
    }

    /// Copy bytes out of the memory window. `None` when the range is not
    /// resident.
    pub(crate) fn mem_copy(&self, offset: u64, length: usize) -> Option<bytes::Bytes> {
        let inner = self.inner.lock();
        let mem = inner.mem.as_ref()?;
        let end = mem.end_offset();
        if offset < mem.inmem_lo || offset >= end {
            return None;
        }
        let start = (offset - mem.inmem_lo) as usize;
        let avail = (end - offset) as usize;
        let take = length.min(avail);
        Some(bytes::Bytes::copy_from_slice(&mem.data[start..start + take]))
    }

    /// Disk read fill-back into the memory window (contiguous tail only).
    pub(crate) fn write_mem_back(&self, offset: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let Some(mem) = inner.mem.as_mut() else {
            return;
        };
        if mem.inmem_lo == 0 && offset == mem.end_offset() {
            mem.data.extend_from_slice(data);
        }
        // write-complete callback of the memory store is a no-op
    }

    /// Pick the read path for a newly attached reader.
    pub(crate) fn reader_kind(&self) -> reader::ReaderKind {
        let inner = self.inner.lock();
        let in_mem = inner
            .mem
            .as_ref()
            .map(|m| m.inmem_lo == 0)
            .unwrap_or(false);
        if in_mem && (inner.store_status == StoreStatus::Pending || inner.mem_status == MemStatus::InMemory)
        {
            reader::ReaderKind::Mem
        } else {
            reader::ReaderKind::Disk
        }
    }

    pub(crate) fn attach_reader(&self, id: u64, reader: Weak<reader::StoreReader>) {
        let mut inner = self.inner.lock();
        inner.refcount += 1;
        if let Some(mem) = inner.mem.as_mut() {
            mem.readers.push((id, reader));
        }
    }

    /// Remove a reader; returns how many remain attached.
    pub(crate) fn detach_reader(&self, id: u64) -> usize {
        let mut inner = self.inner.lock();
        if let Some(mem) = inner.mem.as_mut() {
            mem.readers.retain(|(rid, _)| *rid != id);
            mem.readers.len()
        } else {
            0
        }
    }

    pub fn reader_count(&self) -> usize {
        self.inner
            .lock()
            .mem
            .as_ref()
            .map(|m| m.readers.len())
            .unwrap_or(0)
    }

    /// Register the producer's read-ahead waker.
    pub fn set_producer_waker(&self, waker: Arc<dyn Fn() + Send + Sync>) {
        if let Some(mem) = self.inner.lock().mem.as_mut() {
            mem.producer_waker = Some(waker);
        }
    }

    /// A reader moved its offset; unblock a read-ahead-gated producer.
    pub fn kick_reads(&self) {
        let waker = self
            .inner
            .lock()
            .mem
            .as_ref()
            .and_then(|m| m.producer_waker.clone());
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Producer appended: step every reader with a pending callback and
    /// no disk I/O in flight. Runs without the entry lock held.
    pub fn invoke_handlers(&self) {
        let readers: Vec<Arc<reader::StoreReader>> = {
            let inner = self.inner.lock();
            match inner.mem.as_ref() {
                Some(mem) => mem.readers.iter().filter_map(|(_, w)| w.upgrade()).collect(),
                None => Vec::new(),
            }
        };
        for r in readers {
            r.kick();
        }
    }
}

/// The shared cache table.
pub struct Store {
    table: Mutex<HashMap<StoreKey, Arc<StoreEntry>>>,
    seq: AtomicU64,
    open_swapins: AtomicUsize,
    self_ref: Mutex<Weak<Store>>,
}

impl Store {
    pub fn new() -> Arc<Store> {
        let store = Arc::new(Store {
            table: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            open_swapins: AtomicUsize::new(0),
            self_ref: Mutex::new(Weak::new()),
        });
        *store.self_ref.lock() = Arc::downgrade(&store);
        store
    }

    fn weak(&self) -> Weak<Store> {
        self.self_ref.lock().clone()
    }

    /// Look up the public base object for `method` + `url`.
    pub fn get_public(&self, url: &str, method: &Method) -> Option<Arc<StoreEntry>> {
        self.get_public_variant(url, method, None)
    }

    /// Look up a specific variant.
    pub fn get_public_variant(
        &self,
        url: &str,
        method: &Method,
        variant: Option<&str>,
    ) -> Option<Arc<StoreEntry>> {
        let key = StoreKey {
            method: method.clone(),
            url: url.to_string(),
            variant: variant.map(str::to_string),
        };
        self.table.lock().get(&key).cloned()
    }

    /// Create a fresh entry. Public entries replace any previous object
    /// under the same key; private entries are reachable only through the
    /// returned handle.
    pub fn create_entry(
        &self,
        url: &str,
        method: &Method,
        variant: Option<&str>,
        public: bool,
    ) -> Arc<StoreEntry> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(StoreEntry::new(
            id,
            self.weak(),
            method.clone(),
            url.to_string(),
            variant.map(str::to_string),
        ));
        entry.ensure_mem_object();
        entry.lock();
        if public {
            entry.set_vary_headers(variant.map(str::to_string));
            let prev = self.table.lock().insert(entry.key(), entry.clone());
            if let Some(prev) = prev {
                prev.release_request();
            }
        } else {
            entry.inner.lock().flags.key_private = true;
        }
        entry
    }

    pub(crate) fn forget(&self, entry: &StoreEntry) {
        let key = entry.key();
        let mut table = self.table.lock();
        if let Some(current) = table.get(&key) {
            if current.id == entry.id {
                table.remove(&key);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.table.lock().len()
    }

    pub(crate) fn swapin_opened(&self) -> usize {
        self.open_swapins.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn swapin_closed(&self) {
        self.open_swapins.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn swapins_open(&self) -> usize {
        self.open_swapins.load(Ordering::Relaxed)
    }

    /// Match a request's selecting headers against a stored entry.
    pub fn vary_evaluate_match(entry: &StoreEntry, request: &HeaderMap) -> VaryOutcome {
        let reply = entry.reply();
        let vary = match reply.as_ref().and_then(|r| r.vary()) {
            Some(v) => v.to_string(),
            None => return VaryOutcome::None,
        };
        if vary.split(',').any(|f| f.trim() == "*") {
            return VaryOutcome::Cancel;
        }
        let sig = Self::vary_signature(&vary, request);
        match entry.vary_headers() {
            Some(stored) if stored == sig => VaryOutcome::Match,
            _ => VaryOutcome::Other,
        }
    }

    /// Canonical signature of the request's selecting headers for a
    /// given `Vary` field list.
    pub fn vary_signature(vary: &str, request: &HeaderMap) -> String {
        let mut fields: Vec<String> = vary
            .split(',')
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        fields.sort();
        fields.dedup();
        let mut sig = String::new();
        for f in fields {
            let value = request
                .get(f.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            sig.push_str(&f);
            sig.push('=');
            sig.push_str(value);
            sig.push(';');
        }
        sig
    }

    /// Release every cached variant of `url` across cacheable methods.
    /// Returns how many objects were dropped.
    pub fn release_by_url(&self, url: &str) -> usize {
        let victims: Vec<Arc<StoreEntry>> = {
            let table = self.table.lock();
            table
                .iter()
                .filter(|(k, _)| k.url == url)
                .map(|(_, e)| e.clone())
                .collect()
        };
        let n = victims.len();
        for v in victims {
            v.release();
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT_ENCODING, HeaderValue};
    use std::time::Duration;

    fn reply_with(head: &[u8]) -> HttpReply {
        HttpReply::parse(head).unwrap()
    }

    #[test]
    fn create_find_release_round_trip() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/x", &Method::GET, None, true);
        assert!(store.get_public("http://example.org/x", &Method::GET).is_some());
        e.release();
        assert!(store.get_public("http://example.org/x", &Method::GET).is_none());
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn release_waits_for_locks_to_drain_from_table_only() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/y", &Method::GET, None, true);
        e.lock();
        e.release();
        // gone from the table immediately, object itself lives on
        assert!(store.get_public("http://example.org/y", &Method::GET).is_none());
        assert!(e.flags().release_requested);
        e.unlock();
        e.unlock();
    }

    #[test]
    fn append_complete_sets_object_len() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/z", &Method::GET, None, true);
        e.replace_reply(reply_with(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"));
        let hdr = e.end_offset();
        e.append(b"hello");
        assert_eq!(e.store_status(), StoreStatus::Pending);
        assert_eq!(e.object_len(), None);
        e.complete();
        assert_eq!(e.store_status(), StoreStatus::Ok);
        assert_eq!(e.object_len(), Some(hdr + 5));
        assert_eq!(e.mem_status(), MemStatus::InMemory);
    }

    #[test]
    fn abort_is_sticky_and_finalizes_status() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/a", &Method::GET, None, true);
        e.abort();
        assert!(e.aborted());
        assert_eq!(e.store_status(), StoreStatus::Ok);
    }

    #[test]
    fn timestamps_follow_reply_headers() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/t", &Method::GET, None, true);
        e.replace_reply(reply_with(
            b"HTTP/1.1 200 OK\r\nDate: Wed, 01 Jan 2025 00:00:00 GMT\r\nLast-Modified: Tue, 31 Dec 2024 00:00:00 GMT\r\n\r\n",
        ));
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_735_689_660);
        e.timestamps_set(now);
        assert!(e.lastmod().is_some());
        assert!(e.timestamp().unwrap() <= now);
    }

    #[test]
    fn vary_outcomes() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/v", &Method::GET, None, true);
        e.replace_reply(reply_with(
            b"HTTP/1.1 200 OK\r\nVary: Accept-Encoding\r\n\r\n",
        ));
        let mut req = HeaderMap::new();
        req.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let sig = Store::vary_signature("Accept-Encoding", &req);
        // base entry with no recorded signature: some other variant
        assert_eq!(Store::vary_evaluate_match(&e, &req), VaryOutcome::Other);
        e.set_vary_headers(Some(sig));
        assert_eq!(Store::vary_evaluate_match(&e, &req), VaryOutcome::Match);
        let other = HeaderMap::new();
        assert_eq!(Store::vary_evaluate_match(&e, &other), VaryOutcome::Other);
    }

    #[test]
    fn modified_since_prefers_lastmod() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/m", &Method::GET, None, true);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        e.inner.lock().lastmod = Some(t0);
        assert!(!e.modified_since(t0));
        assert!(!e.modified_since(t0 + Duration::from_secs(10)));
        assert!(e.modified_since(t0 - Duration::from_secs(10)));
    }

    #[test]
    fn etag_predicates_honour_lists_and_wildcard() {
        let store = Store::new();
        let e = store.create_entry("http://example.org/e", &Method::GET, None, true);
        e.replace_reply(reply_with(b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\n\r\n"));
        let mut req = HeaderMap::new();
        req.insert(
            http::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"v0\", \"v1\""),
        );
        assert!(e.has_if_none_match_etag(&req));
        req.insert(http::header::IF_MATCH, HeaderValue::from_static("*"));
        assert!(e.has_if_match_etag(&req));
    }
}
