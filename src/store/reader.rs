//! The reader half of the store: streams one entry's bytes to one
//! consumer, from memory or from a swap file, as they become available.
//!
//! A reader holds at most one outstanding copy request and one pending
//! callback. `copy_step` is guarded against reentry by `store_copying`;
//! when a kick arrives mid-step, a single-shot deferred `copy_event`
//! rearms it instead. Disk bytes pass through the swap metadata envelope
//! parser on first read; a failed parse fails the reader with
//! `object_ok = false`, which the reply side treats as a swap-fail miss.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::event::{Call, Engine};
use crate::msg::HttpReply;

use super::swap::{SwapFile, SwapStore};
use super::{meta, Store, StoreEntry, StoreStatus};

/// Where a reader's bytes come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderKind {
    Mem,
    Disk,
}

/// One copy request: a window into the object's byte stream.
#[derive(Clone, Copy, Debug)]
pub struct CopyRequest {
    pub offset: u64,
    pub length: usize,
}

/// What a copy request resolves to. Zero bytes without the error flag
/// means end of object; the error flag means the reader failed and the
/// caller should fall back to a miss.
#[derive(Clone, Debug)]
pub struct StoreCopyReply {
    pub offset: u64,
    pub data: Bytes,
    pub error: bool,
}

pub type CopyCallback = Box<dyn FnOnce(StoreCopyReply) + Send>;

struct ReaderState {
    kind: ReaderKind,
    copy_into: Option<CopyRequest>,
    cmp_offset: u64,
    callback: Option<CopyCallback>,
    swapin: Option<Box<dyn SwapFile>>,
    object_ok: bool,
    disk_io_pending: bool,
    store_copying: bool,
    copy_event_pending: bool,
}

/// A per-consumer attachment to a store entry.
pub struct StoreReader {
    id: u64,
    entry: Arc<StoreEntry>,
    store: Arc<Store>,
    swap: Arc<dyn SwapStore>,
    engine: Arc<Engine>,
    config: Arc<Config>,
    state: Mutex<ReaderState>,
}

enum CopyAction {
    Finished,
    Wait,
    OpenSwapin,
    MemRead(Bytes),
    DiskRead { offset: u64, length: usize, parse_header: bool },
}

impl StoreReader {
    /// Attach a new reader to `entry`. The entry must have a data window
    /// (`ensure_mem_object`); the caller keeps the entry locked for the
    /// reader's lifetime.
    pub fn attach(
        entry: Arc<StoreEntry>,
        store: Arc<Store>,
        swap: Arc<dyn SwapStore>,
        engine: Arc<Engine>,
        config: Arc<Config>,
    ) -> Arc<StoreReader> {
        let kind = entry.reader_kind();
        if kind == ReaderKind::Disk {
            debug_assert!(
                entry.swap_file().is_some() || entry.swap_status() == super::SwapStatus::Writing,
                "disk reader without a swap file"
            );
        }
        let reader = Arc::new(StoreReader {
            id: engine.next_id(),
            entry: entry.clone(),
            store,
            swap,
            engine,
            config,
            state: Mutex::new(ReaderState {
                kind,
                copy_into: None,
                cmp_offset: 0,
                callback: None,
                swapin: None,
                object_ok: true,
                disk_io_pending: false,
                store_copying: false,
                copy_event_pending: false,
            }),
        });
        entry.attach_reader(reader.id, Arc::downgrade(&reader));
        reader
    }

    pub fn entry(&self) -> &Arc<StoreEntry> {
        &self.entry
    }

    pub fn kind(&self) -> ReaderKind {
        self.state.lock().kind
    }

    /// Whether the reader is still healthy. Cleared by envelope or
    /// swap-open failures.
    pub fn object_ok(&self) -> bool {
        self.state.lock().object_ok
    }

    pub fn pending(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    /// Request the next window of object bytes. One request at a time;
    /// the callback fires exactly once, from the engine queue's point of
    /// view of time.
    pub fn copy(self: &Arc<Self>, request: CopyRequest, callback: CopyCallback) {
        {
            let mut st = self.state.lock();
            assert!(
                st.callback.is_none(),
                "store reader: copy with a callback already pending"
            );
            // range requests may skip into the body
            st.cmp_offset = request.offset;
            st.copy_into = Some(request);
            st.callback = Some(callback);
        }
        tracing::trace!(
            url = %self.entry.url(),
            offset = request.offset,
            length = request.length,
            "reader copy"
        );
        // a read-ahead-gated producer may be waiting for our offset to move
        self.entry.kick_reads();
        self.copy_step();
    }

    /// Producer-side nudge: only meaningful with a pending callback and
    /// no disk I/O in flight.
    pub(crate) fn kick(self: &Arc<Self>) {
        {
            let st = self.state.lock();
            if st.callback.is_none() || st.disk_io_pending {
                return;
            }
        }
        self.copy_step();
    }

    fn copy_step(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.copy_event_pending {
                return;
            }
            if self.entry.fwd_hdr_wait() {
                // the forwarder is still withholding the header; we get
                // re-kicked when it lands
                return;
            }
            if st.store_copying {
                st.copy_event_pending = true;
                let me = self.clone();
                self.engine.schedule(Call::new("StoreReader::copyEvent", move || {
                    me.copy_event();
                }));
                return;
            }
            debug_assert!(st.callback.is_some());
            st.store_copying = true;
        }
        self.do_copy();
    }

    fn copy_event(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.copy_event_pending = false;
            if st.callback.is_none() {
                return;
            }
        }
        self.copy_step();
    }

    fn do_copy(self: &Arc<Self>) {
        let action = self.decide();
        match action {
            CopyAction::Finished => {
                self.finish_step();
                self.invoke_callback(Bytes::new(), false);
            }
            CopyAction::Wait => {
                tracing::trace!(url = %self.entry.url(), "reader waiting for more data");
                self.finish_step();
            }
            CopyAction::OpenSwapin => self.start_swapin(),
            CopyAction::MemRead(data) => {
                self.finish_step();
                self.invoke_callback(data, false);
            }
            CopyAction::DiskRead {
                offset,
                length,
                parse_header,
            } => {
                self.file_read(offset, length, parse_header);
                self.finish_step();
            }
        }
    }

    fn decide(&self) -> CopyAction {
        let st = self.state.lock();
        let Some(req) = st.copy_into else {
            return CopyAction::Wait;
        };

        // end of object
        if self.no_more_to_send(req.offset) {
            return CopyAction::Finished;
        }

        // the producer has not written the requested bytes yet
        if self.entry.store_status() == StoreStatus::Pending
            && req.offset >= self.entry.end_offset()
        {
            return CopyAction::Wait;
        }

        // a disk reader must have its swap-in open before any bytes move,
        // even bytes that happen to be in memory, so a later open failure
        // cannot cut an in-progress transfer short
        if st.kind == ReaderKind::Disk && st.swapin.is_none() {
            return CopyAction::OpenSwapin;
        }

        let inmem_lo = self.entry.inmem_lo();
        if req.offset >= inmem_lo && req.offset < self.entry.end_offset() {
            match self.entry.mem_copy(req.offset, req.length) {
                Some(data) => CopyAction::MemRead(data),
                None => CopyAction::Wait,
            }
        } else {
            let swap_hdr_sz = self.entry.swap_hdr_sz();
            CopyAction::DiskRead {
                offset: req.offset + swap_hdr_sz,
                length: req.length,
                parse_header: swap_hdr_sz == 0,
            }
        }
    }

    /// `store_status == Ok`, the length is known, and the request starts
    /// at or past the end.
    fn no_more_to_send(&self, offset: u64) -> bool {
        if self.entry.store_status() == StoreStatus::Pending {
            return false;
        }
        match self.entry.object_len() {
            Some(len) => offset >= len,
            // length unknown: the swap file has to tell us
            None => false,
        }
    }

    fn finish_step(&self) {
        self.state.lock().store_copying = false;
    }

    fn start_swapin(self: &Arc<Self>) {
        if self.store.swapins_open() >= self.config.max_open_disk_files {
            tracing::warn!(
                open = self.store.swapins_open(),
                "too many swap files open, failing reader"
            );
            self.fail();
            self.finish_step();
            return;
        }
        {
            let st = self.state.lock();
            if st.disk_io_pending {
                tracing::warn!("averted multiple swap-in operations on one reader");
                drop(st);
                self.finish_step();
                return;
            }
        }

        let file = match self.entry.swap_file() {
            Some(f) => f,
            None => {
                self.fail();
                self.finish_step();
                return;
            }
        };
        match self.swap.open(file) {
            Ok(handle) => {
                self.state.lock().swapin = Some(handle);
                self.store.swapin_opened();
                // with the stream open we either copy from memory or
                // schedule the disk read
                self.do_copy();
            }
            Err(err) => {
                tracing::warn!(file, %err, "swap-in open failed");
                self.fail();
                self.finish_step();
            }
        }
    }

    fn file_read(self: &Arc<Self>, offset: u64, length: usize, parse_header: bool) {
        let me = self.clone();
        let mut st = self.state.lock();
        debug_assert!(st.callback.is_some());
        debug_assert!(!st.disk_io_pending);
        st.disk_io_pending = true;
        let Some(swapin) = st.swapin.as_mut() else {
            drop(st);
            self.fail();
            return;
        };
        swapin.read(
            offset,
            length,
            Box::new(move |result| match result {
                Ok(data) => {
                    if parse_header {
                        me.read_header(data);
                    } else {
                        me.read_body(data);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "swap-in read failed");
                    me.state.lock().disk_io_pending = false;
                    me.fail();
                }
            }),
        );
    }

    /// First disk read: the buffer opens with the swap metadata envelope.
    fn read_header(self: &Arc<Self>, buf: Bytes) {
        {
            let mut st = self.state.lock();
            debug_assert!(st.disk_io_pending);
            st.disk_io_pending = false;
            debug_assert!(st.callback.is_some());
        }

        let (swap_hdr_sz, records) = match meta::decode(&buf) {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(%err, "swap file header inconsistent with available data");
                self.fail();
                return;
            }
        };
        for rec in &records {
            if let Err(err) = meta::check_consistency(rec, &self.entry, swap_hdr_sz) {
                tracing::warn!(%err, "swap metadata failed consistency check");
                self.fail();
                return;
            }
        }

        let file_sz = self.entry.swap_file_sz();
        debug_assert!(file_sz >= swap_hdr_sz as u64);
        self.entry.set_swap_hdr_sz(swap_hdr_sz as u64);
        self.entry.set_object_len(file_sz - swap_hdr_sz as u64);
        tracing::debug!(
            file_sz,
            swap_hdr_sz,
            object_sz = file_sz - swap_hdr_sz as u64,
            "swap metadata parsed"
        );

        // hand over any object bytes that followed the envelope in the
        // same read; otherwise reissue the read, now offset by the
        // envelope size
        let (req_offset, req_length) = {
            let st = self.state.lock();
            match st.copy_into {
                Some(r) => (r.offset, r.length),
                None => return,
            }
        };
        debug_assert_eq!(req_offset, 0, "first swap-in read starts at the object head");
        let body = buf.slice(swap_hdr_sz.min(buf.len())..);
        if !body.is_empty() {
            let take = body.len().min(req_length);
            self.read_body(body.slice(..take));
        } else {
            self.file_read(req_offset + swap_hdr_sz as u64, req_length, false);
        }
    }

    fn read_body(self: &Arc<Self>, data: Bytes) {
        // may be entered straight from read_header, so no disk_io assert
        self.state.lock().disk_io_pending = false;
        let req_offset = {
            let st = self.state.lock();
            debug_assert!(st.callback.is_some());
            st.copy_into.map(|r| r.offset).unwrap_or(0)
        };

        if req_offset == 0 && !data.is_empty() && !self.entry.headers_parsed() {
            match HttpReply::parse(&data) {
                Some(reply) => self.entry.set_reply_parsed(reply),
                None => {
                    tracing::error!(url = %self.entry.url(), "could not parse headers from on-disk object");
                }
            }
        }

        // small objects read back from disk refill the memory cache
        if !data.is_empty()
            && self.config.onoff.memory_cache_disk
            && self.entry.inmem_lo() == 0
            && self
                .entry
                .object_len()
                .map(|len| len <= self.config.max_in_mem_obj_size)
                .unwrap_or(false)
            && req_offset == self.entry.end_offset()
        {
            self.entry.write_mem_back(req_offset, &data);
        }

        self.invoke_callback(data, false);
    }

    /// Fail the reader; the consumer sees an error reply and recovers to
    /// a miss.
    pub(crate) fn fail(self: &Arc<Self>) {
        self.state.lock().object_ok = false;
        if self.pending() {
            self.invoke_callback(Bytes::new(), true);
        }
    }

    fn invoke_callback(&self, data: Bytes, error: bool) {
        let (cb, offset) = {
            let mut st = self.state.lock();
            let offset = st.cmp_offset;
            if let Some(req) = st.copy_into.take() {
                st.cmp_offset = req.offset + data.len() as u64;
            }
            st.store_copying = false;
            (st.callback.take(), offset)
        };
        if let Some(cb) = cb {
            cb(StoreCopyReply {
                offset,
                data,
                error,
            });
        }
    }

    /// Detach from the entry: close any swap-in, fail a pending
    /// callback, and either kick the remaining readers or weigh a quick
    /// abort of the producer when we were the last one.
    pub fn unregister(self: &Arc<Self>) -> bool {
        let remaining = self.entry.detach_reader(self.id);
        let had_swapin = {
            let mut st = self.state.lock();
            st.swapin.take().is_some()
        };
        if had_swapin {
            self.store.swapin_closed();
        }
        if self.pending() {
            tracing::debug!(url = %self.entry.url(), "unregistering reader with a callback");
            self.fail();
        }
        if remaining == 0 {
            check_quick_abort(&self.entry, &self.config);
        } else {
            self.entry.kick_reads();
        }
        true
    }
}

/// The last reader detached from a pending entry: decide whether the
/// upstream fetch keeps running for the cache's benefit.
fn check_quick_abort(entry: &Arc<StoreEntry>, config: &Config) {
    if entry.reader_count() > 0 {
        return;
    }
    if entry.store_status() != StoreStatus::Pending {
        return;
    }
    if entry.special() {
        return;
    }
    if !quick_abort_reasonable(entry, config) {
        return;
    }
    tracing::debug!(url = %entry.url(), "quick-aborting orphaned fetch");
    entry.abort();
}

/// The decision table. Returns true when the fetch should be aborted.
fn quick_abort_reasonable(entry: &Arc<StoreEntry>, config: &Config) -> bool {
    let hints = entry.hints();
    if !hints.cachable {
        tracing::debug!("quick-abort? YES, not cachable");
        return true;
    }
    if entry.key_private() {
        tracing::debug!("quick-abort? YES, private key");
        return true;
    }

    let reply = entry.reply();
    let expect = match reply
        .as_ref()
        .and_then(|r| r.content_length())
        .map(|cl| cl + reply.as_ref().map(|r| r.hdr_sz as u64).unwrap_or(0))
    {
        Some(n) => n,
        None => {
            // nothing known about the object yet
            tracing::debug!("quick-abort? YES, no object data received yet");
            return true;
        }
    };
    let cur = entry.end_offset();

    let qa = &config.quick_abort;
    if qa.min_kb < 0 {
        tracing::debug!("quick-abort? NO, disabled");
        return false;
    }
    if hints.range_full_download {
        tracing::debug!("quick-abort? NO, admin configured range replies to full-download");
        return false;
    }
    if cur > expect {
        tracing::debug!("quick-abort? YES, bad content length");
        return true;
    }
    let remaining = expect - cur;
    if remaining < (qa.min_kb as u64) << 10 {
        tracing::debug!("quick-abort? NO, only a little left to receive");
        return false;
    }
    if remaining > (qa.max_kb as u64) << 10 {
        tracing::debug!("quick-abort? YES, too much left to go");
        return true;
    }
    if expect < 100 {
        tracing::debug!("quick-abort? NO, tiny object");
        return false;
    }
    if cur / (expect / 100) > qa.pct as u64 {
        tracing::debug!("quick-abort? NO, past the point of no return");
        return false;
    }
    tracing::debug!("quick-abort? YES, default");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::swap::MemSwapStore;
    use http::Method;

    const REQBUF: usize = 4096;

    struct Rig {
        engine: Arc<Engine>,
        store: Arc<Store>,
        swap: Arc<MemSwapStore>,
        config: Arc<Config>,
    }

    impl Rig {
        fn new() -> Rig {
            let engine = Engine::new();
            Rig {
                store: Store::new(),
                swap: MemSwapStore::new(engine.clone()),
                config: Arc::new(Config::default()),
                engine,
            }
        }

        fn reader(&self, entry: &Arc<StoreEntry>) -> Arc<StoreReader> {
            StoreReader::attach(
                entry.clone(),
                self.store.clone(),
                self.swap.clone(),
                self.engine.clone(),
                self.config.clone(),
            )
        }
    }

    fn collecting_cb(sink: Arc<Mutex<Vec<StoreCopyReply>>>) -> CopyCallback {
        Box::new(move |r| sink.lock().push(r))
    }

    #[test]
    fn streams_bytes_as_the_producer_appends() {
        let rig = Rig::new();
        let entry = rig
            .store
            .create_entry("http://example.org/s", &Method::GET, None, true);
        let reader = rig.reader(&entry);
        let got = Arc::new(Mutex::new(Vec::new()));

        reader.copy(
            CopyRequest {
                offset: 0,
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        rig.engine.run_until_idle();
        assert!(got.lock().is_empty(), "no bytes produced yet");

        entry.append(b"hello");
        rig.engine.run_until_idle();
        {
            let replies = got.lock();
            assert_eq!(replies.len(), 1);
            assert_eq!(&replies[0].data[..], b"hello");
            assert_eq!(replies[0].offset, 0);
        }

        // next window
        reader.copy(
            CopyRequest {
                offset: 5,
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        entry.append(b"world");
        entry.complete();
        rig.engine.run_until_idle();
        {
            let replies = got.lock();
            assert_eq!(replies.len(), 2);
            assert_eq!(&replies[1].data[..], b"world");
            assert_eq!(replies[1].offset, 5);
        }

        // end of object
        reader.copy(
            CopyRequest {
                offset: 10,
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        rig.engine.run_until_idle();
        let replies = got.lock();
        assert_eq!(replies.len(), 3);
        assert!(replies[2].data.is_empty());
        assert!(!replies[2].error);
    }

    fn swap_file_for(entry: &Arc<StoreEntry>, object: &[u8]) -> Bytes {
        let records = meta::records_for(entry, object.len() as u64);
        let mut file = meta::encode(&records);
        file.extend_from_slice(object);
        Bytes::from(file)
    }

    #[test]
    fn swapin_parses_envelope_then_delivers_body() {
        let rig = Rig::new();
        let entry = rig
            .store
            .create_entry("http://example.org/d", &Method::GET, None, true);
        let object = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld";
        let file = swap_file_for(&entry, object);
        rig.swap.insert(3, file.clone());
        entry.set_swap(3, file.len() as u64);
        // nothing resident, producer long gone: the disk path
        entry.set_store_ok();

        let reader = rig.reader(&entry);
        assert_eq!(reader.kind(), ReaderKind::Disk);
        let got = Arc::new(Mutex::new(Vec::new()));
        reader.copy(
            CopyRequest {
                offset: 0,
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        rig.engine.run_until_idle();

        let replies = got.lock();
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].error);
        assert_eq!(&replies[0].data[..], &object[..]);
        assert_eq!(entry.object_len(), Some(object.len() as u64));
        assert!(entry.headers_parsed());
        // fill-back made the object resident again
        assert_eq!(entry.end_offset(), object.len() as u64);
    }

    #[test]
    fn envelope_for_wrong_object_fails_the_reader() {
        let rig = Rig::new();
        let other = rig
            .store
            .create_entry("http://example.org/other", &Method::GET, None, true);
        let entry = rig
            .store
            .create_entry("http://example.org/mine", &Method::GET, None, true);
        let file = swap_file_for(&other, b"stale");
        rig.swap.insert(4, file.clone());
        entry.set_swap(4, file.len() as u64);
        entry.set_store_ok();

        let reader = rig.reader(&entry);
        let got = Arc::new(Mutex::new(Vec::new()));
        reader.copy(
            CopyRequest {
                offset: 0,
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        rig.engine.run_until_idle();

        let replies = got.lock();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error);
        assert!(!reader.object_ok());
    }

    #[test]
    fn unregister_fails_pending_callback_and_quick_aborts() {
        let rig = Rig::new();
        let entry = rig
            .store
            .create_entry("http://example.org/qa", &Method::GET, None, true);
        entry.replace_reply(
            HttpReply::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n").unwrap(),
        );
        let reader = rig.reader(&entry);
        let got = Arc::new(Mutex::new(Vec::new()));
        reader.copy(
            CopyRequest {
                offset: entry.end_offset(),
                length: REQBUF,
            },
            collecting_cb(got.clone()),
        );
        rig.engine.run_until_idle();
        assert!(got.lock().is_empty());

        reader.unregister();
        rig.engine.run_until_idle();
        let replies = got.lock();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error);
        // 100000 - produced bytes is above max_kb << 10, so the orphaned
        // fetch was aborted
        assert!(entry.aborted());
    }

    #[test]
    fn quick_abort_spares_nearly_complete_objects() {
        let rig = Rig::new();
        let entry = rig
            .store
            .create_entry("http://example.org/near", &Method::GET, None, true);
        entry.replace_reply(
            HttpReply::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3000\r\n\r\n").unwrap(),
        );
        let pad = vec![b'x'; 2995];
        entry.append(&pad);
        assert!(!quick_abort_reasonable(&entry, &rig.config));

        let far = rig
            .store
            .create_entry("http://example.org/far", &Method::GET, None, true);
        far.replace_reply(
            HttpReply::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n").unwrap(),
        );
        assert!(quick_abort_reasonable(&far, &rig.config));

        // disabled by negative min
        let mut cfg = Config::default();
        cfg.quick_abort.min_kb = -1;
        assert!(!quick_abort_reasonable(&far, &cfg));
    }
}
