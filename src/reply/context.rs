//! The per-client reply state machine.
//!
//! One `ReplyContext` sits at the head of each client stream. It
//! identifies the cache entry for the request, classifies hit against
//! miss against revalidate against purge against conditional, drives
//! bytes from its store reader into the downstream sink, and rebuilds
//! the reply header on the way out. It is a [`Job`]: every step arrives
//! as an engine call through its weak handle, so a dead context silently
//! swallows late store callbacks.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;

use crate::core::Core;
use crate::errorpage::{self, ErrKind};
use crate::event::{Job, JobCtx, JobHandle, start};
use crate::forward::ForwardedRequest;
use crate::msg::HttpReply;
use crate::refresh;
use crate::store::reader::{CopyRequest, StoreCopyReply, StoreReader};
use crate::store::{RequestHints, Store, StoreEntry, StoreStatus, VaryOutcome};
use crate::stream::{ReplySink, StreamChunk};

use super::{LogType, Transaction};

/// Window size for each store read, and the margin allowed for headers
/// in the reply-size check.
pub(crate) const REQBUF_SZ: usize = 4096;

/// `PURGE` is not one of the `http` crate's named methods.
pub(crate) static METHOD_PURGE: Lazy<Method> =
    Lazy::new(|| Method::from_bytes(b"PURGE").expect("static method token"));

/// Where a store copy's bytes should be routed when they come back.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CopyRoute {
    SendMoreData,
    CacheHit,
    HandleImsReply,
}

impl CopyRoute {
    fn name(&self) -> &'static str {
        match self {
            CopyRoute::SendMoreData => "ReplyContext::sendMoreData",
            CopyRoute::CacheHit => "ReplyContext::cacheHit",
            CopyRoute::HandleImsReply => "ReplyContext::handleIMSReply",
        }
    }
}

#[derive(Default)]
pub(crate) struct ReplyFlags {
    pub storelogiccomplete: bool,
    pub complete: bool,
    pub headers_sent: bool,
    pub purging: bool,
}

/// Five-phase PURGE continuation, in lookup order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PurgePhase {
    FindGet,
    FindHead,
    DoGet,
    DoHead,
}

/// What the downstream driver should do with the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// Keep pulling.
    None,
    /// Done; the connection may persist.
    Complete,
    /// Done, but close the connection.
    UnplannedComplete,
    /// Broken; close the connection.
    Failed,
}

pub struct ReplyContext {
    pub(crate) core: Arc<Core>,
    pub(crate) tx: Transaction,
    pub(crate) sink: Box<dyn ReplySink>,
    handle: Option<JobHandle<ReplyContext>>,
    pub(crate) sc: Option<Arc<StoreReader>>,
    pub(crate) old_sc: Option<Arc<StoreReader>>,
    pub(crate) old_entry: Option<Arc<StoreEntry>>,
    /// Our working copy of the reply header, mangled for the client.
    pub(crate) reply: Option<HttpReply>,
    pub(crate) flags: ReplyFlags,
    pub(crate) purge_phase: Option<PurgePhase>,
    pub(crate) purge_status: StatusCode,
    pub(crate) reqofs: u64,
    pub(crate) reqsize: u64,
    saved_reqofs: u64,
    saved_reqsize: u64,
    pub(crate) headers_sz: usize,
    pub(crate) vary_retried: bool,
    holding: Option<StoreCopyReply>,
    pub(crate) lookup_tag: &'static str,
    /// Captured reply MIME headers when `log_mime_hdrs` is on.
    pub(crate) log_reply_headers: Option<String>,
}

impl Job for ReplyContext {
    fn type_name(&self) -> &'static str {
        "ReplyContext"
    }

    fn start(&mut self, ctx: &mut JobCtx<'_, Self>) -> Result<()> {
        self.handle = Some(ctx.handle());
        self.next_chunk()
    }

    fn done_all(&self) -> bool {
        false // lives until the client side stops it
    }

    fn swan_song(&mut self) {
        self.remove_client_store_reference();
        // old_entry may still be set if the revalidation reply never came
        self.remove_old_store_reference();
    }
}

impl ReplyContext {
    /// Create the context and schedule its first step.
    pub fn start(
        core: Arc<Core>,
        tx: Transaction,
        sink: Box<dyn ReplySink>,
    ) -> JobHandle<ReplyContext> {
        let engine = core.engine.clone();
        start(
            &engine,
            ReplyContext {
                core,
                tx,
                sink,
                handle: None,
                sc: None,
                old_sc: None,
                old_entry: None,
                reply: None,
                flags: ReplyFlags::default(),
                purge_phase: None,
                purge_status: StatusCode::NOT_FOUND,
                reqofs: 0,
                reqsize: 0,
                saved_reqofs: 0,
                saved_reqsize: 0,
                headers_sz: 0,
                vary_retried: false,
                holding: None,
                lookup_tag: "NONE",
                log_reply_headers: None,
            },
        )
    }

    /// The transaction this context is serving.
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// The downstream node wants more data.
    pub fn pull(handle: &JobHandle<ReplyContext>) {
        handle.call("ReplyContext::pull", |rc, _ctx| rc.next_chunk());
    }

    /// Detach and destroy the context.
    pub fn detach(handle: &JobHandle<ReplyContext>) {
        handle.stop("client stream detached");
    }

    pub(crate) fn handle(&self) -> JobHandle<ReplyContext> {
        self.handle.clone().expect("job has been started")
    }

    /// The module entry point: route by how far store logic has come.
    pub(crate) fn next_chunk(&mut self) -> Result<()> {
        // one outstanding copy at a time; the pending one will push
        if self.sc.as_ref().map(|sc| sc.pending()).unwrap_or(false) {
            return Ok(());
        }

        if self.flags.storelogiccomplete {
            if self.flags.complete || self.tx.flags.done_copying {
                // nothing left to copy (HEAD, or the reply finished);
                // repeat the end-of-stream signal instead of reading on
                self.sink.deliver(
                    None,
                    StreamChunk {
                        offset: self.tx.out.offset,
                        data: Bytes::new(),
                        error: false,
                    },
                );
                return Ok(());
            }
            let offset = self.tx.out.offset + self.headers_sz as u64;
            self.store_copy(offset, CopyRoute::SendMoreData);
            return Ok(());
        }

        if self.sc.is_some() || self.flags.purging {
            // classification is already in flight
            return Ok(());
        }

        if self.tx.method == *METHOD_PURGE {
            self.purge_request();
            return Ok(());
        }

        if self.tx.method == Method::TRACE {
            if self.tx.max_forwards() == Some(0) {
                return self.trace_reply();
            }
            self.tx.log_type = LogType::TcpMiss;
            self.do_get_more_data();
            return Ok(());
        }

        self.identify_store_object();
        Ok(())
    }

    // --- store lookup and classification -------------------------------

    pub(crate) fn identify_store_object(&mut self) {
        let found = if self.tx.flags.cachable || self.tx.flags.internal {
            self.core.store.get_public_variant(
                &self.tx.url,
                &self.tx.method,
                self.tx.vary_signature.as_deref(),
            )
        } else {
            None
        };
        let h = self.handle();
        h.call("ReplyContext::identifyFoundObject", move |rc, _ctx| {
            rc.identify_found_object(found)
        });
    }

    /// Apply the classification table; exactly one branch wins and every
    /// branch ends in `do_get_more_data`.
    fn identify_found_object(&mut self, found: Option<Arc<StoreEntry>>) -> Result<()> {
        let now = self.core.now();

        if self.tx.flags.no_cache {
            // reload: distrust cached name resolutions too
            self.core.ip_cache.invalidate_negative(&self.tx.host);
        }
        self.lookup_tag = if found.is_some() { "HIT" } else { "MISS" };

        let Some(entry) = found else {
            tracing::debug!(url = %self.tx.url, "store lookup: MISS");
            self.tx.entry = None;
            self.tx.log_type = LogType::TcpMiss;
            self.do_get_more_data();
            return Ok(());
        };

        if self.core.config.onoff.offline {
            tracing::debug!(url = %self.tx.url, "offline HIT");
            self.tx.entry = Some(entry);
            self.tx.log_type = LogType::TcpHit;
            self.do_get_more_data();
            return Ok(());
        }
        if self.tx.redirect.is_some() {
            tracing::debug!("redirect status forces a bodyless MISS");
            self.tx.entry = None;
            self.tx.log_type = LogType::TcpRedirect;
            self.do_get_more_data();
            return Ok(());
        }
        if !entry.valid_to_send(now) {
            tracing::debug!(url = %self.tx.url, "entry not valid to send, MISS");
            self.tx.entry = None;
            self.tx.log_type = LogType::TcpMiss;
            self.do_get_more_data();
            return Ok(());
        }
        if entry.special() {
            // special entries are always hits, no matter what the client says
            self.tx.entry = Some(entry);
            self.tx.log_type = LogType::TcpHit;
            self.do_get_more_data();
            return Ok(());
        }
        if self.tx.flags.no_cache {
            tracing::debug!("client no-cache, REFRESH MISS");
            self.tx.entry = None;
            self.tx.log_type = LogType::TcpClientRefreshMiss;
            self.do_get_more_data();
            return Ok(());
        }

        self.tx.entry = Some(entry);
        self.tx.log_type = LogType::TcpHit;
        self.do_get_more_data();
        Ok(())
    }

    pub(crate) fn do_get_more_data(&mut self) {
        if let Some(entry) = self.tx.entry.clone() {
            entry.lock();
            entry.ensure_mem_object();
            entry.set_hints(RequestHints {
                cachable: self.tx.flags.cachable,
                range_full_download: self.tx.flags.range_full_download,
            });
            self.sc = Some(self.attach_reader(&entry));
            self.reqofs = 0;
            self.store_copy(0, CopyRoute::CacheHit);
        } else {
            self.process_miss();
        }
    }

    pub(crate) fn attach_reader(&self, entry: &Arc<StoreEntry>) -> Arc<StoreReader> {
        StoreReader::attach(
            entry.clone(),
            self.core.store.clone(),
            self.core.swap.clone(),
            self.core.engine.clone(),
            self.core.config.clone(),
        )
    }

    pub(crate) fn store_copy(&mut self, offset: u64, route: CopyRoute) {
        let Some(sc) = self.sc.clone() else {
            tracing::debug!("store copy without a reader, stream is going away");
            return;
        };
        let h = self.handle();
        sc.copy(
            CopyRequest {
                offset,
                length: REQBUF_SZ,
            },
            Box::new(move |result| {
                h.call(route.name(), move |rc, _ctx| rc.on_copy(route, result));
            }),
        );
    }

    fn on_copy(&mut self, route: CopyRoute, result: StoreCopyReply) -> Result<()> {
        match route {
            CopyRoute::SendMoreData => self.send_more_data(result),
            CopyRoute::CacheHit => self.cache_hit(result),
            CopyRoute::HandleImsReply => self.handle_ims_reply(result),
        }
    }

    // --- the cache-hit path --------------------------------------------

    /// First bytes of a candidate hit. Runs until the reply headers have
    /// been seen, then hands off to the send, revalidate or miss paths.
    fn cache_hit(&mut self, result: StoreCopyReply) -> Result<()> {
        let Some(entry) = self.tx.entry.clone() else {
            tracing::debug!("cache hit: request aborted");
            return Ok(());
        };

        if result.error {
            tracing::debug!(url = %self.tx.url, "swap-in failure, restarting as miss");
            self.tx.log_type = LogType::TcpSwapfailMiss;
            self.remove_client_store_reference();
            self.process_miss();
            return Ok(());
        }
        if result.data.is_empty() {
            // the store could not produce enough data to identify the object
            self.tx.log_type = LogType::TcpMiss;
            self.remove_client_store_reference();
            self.process_miss();
            return Ok(());
        }

        self.reqsize = self.reqofs + result.data.len() as u64;

        if entry.url() != self.tx.url {
            tracing::warn!(stored = %entry.url(), requested = %self.tx.url, "URL mismatch");
            self.remove_client_store_reference();
            self.process_miss();
            return Ok(());
        }

        match Store::vary_evaluate_match(&entry, &self.tx.headers) {
            VaryOutcome::None | VaryOutcome::Match => {}
            VaryOutcome::Other => {
                self.remove_client_store_reference();
                if self.vary_retried {
                    // second mismatch in a row smells like an object loop
                    tracing::warn!(url = %self.tx.url, "Vary object loop");
                    self.process_miss();
                    return Ok(());
                }
                self.vary_retried = true;
                let vary = entry.reply().and_then(|r| r.vary().map(str::to_string));
                if let Some(vary) = vary {
                    self.tx.vary_signature =
                        Some(Store::vary_signature(&vary, &self.tx.headers));
                }
                tracing::debug!(url = %self.tx.url, "Vary mismatch, re-running lookup");
                self.identify_store_object();
                return Ok(());
            }
            VaryOutcome::Cancel => {
                tracing::warn!(url = %self.tx.url, "Vary cannot be satisfied");
                self.process_miss();
                return Ok(());
            }
        }

        if self.tx.method == *METHOD_PURGE {
            self.remove_client_store_reference();
            self.purge_request();
            return Ok(());
        }

        if entry.check_negative_hit(self.core.now()) && !self.tx.flags.no_cache {
            self.tx.log_type = LogType::TcpNegativeHit;
            return self.send_more_data(result);
        }

        if !self.tx.flags.internal && refresh::check_http(&entry, &self.tx.headers, self.core.now())
        {
            // we hold a stale copy; it needs to be validated
            self.tx.flags.need_validation = true;
            if entry.lastmod().is_none() {
                tracing::debug!("stale hit without Last-Modified, MISS");
                self.tx.log_type = LogType::TcpMiss;
                self.process_miss();
            } else if self.tx.flags.no_cache {
                self.tx.log_type = LogType::TcpClientRefreshMiss;
                self.process_miss();
            } else if self.tx.url.starts_with("http") {
                self.process_expired();
            } else {
                // no way to revalidate other schemes
                self.tx.log_type = LogType::TcpMiss;
                self.process_miss();
            }
            return Ok(());
        }

        if self.tx.conditional() {
            return self.process_conditional(result);
        }

        // plain old cache hit
        if entry.mem_status() == crate::store::MemStatus::InMemory {
            self.tx.log_type = LogType::TcpMemHit;
        } else if self.core.config.onoff.offline {
            self.tx.log_type = LogType::TcpOfflineHit;
        }
        self.send_more_data(result)
    }

    // --- miss and error paths ------------------------------------------

    pub(crate) fn process_miss(&mut self) {
        tracing::debug!(method = %self.tx.method, url = %self.tx.url, "processing miss");

        // a left-over entry from a failed hit or revalidation
        if let Some(entry) = self.tx.entry.clone() {
            if entry.special() {
                tracing::error!(url = %self.tx.url, "miss on a special object");
            }
            self.remove_client_store_reference();
        }

        if self.tx.method == *METHOD_PURGE {
            self.purge_request();
            return;
        }
        if !is_standard_method(&self.tx.method) {
            self.purge_all_cached();
        }
        if self.tx.flags.only_if_cached {
            self.process_only_if_cached_miss();
            return;
        }
        if self.tx.flags.loop_detected {
            self.tx.log_type = LogType::TcpDenied;
            self.start_error(ErrKind::AccessDenied, StatusCode::FORBIDDEN);
            return;
        }

        self.create_store_entry();
        self.trigger_initial_store_read();

        if let Some((status, location)) = self.tx.redirect.clone() {
            self.tx.log_type = LogType::TcpRedirect;
            let entry = self.tx.entry.clone().expect("entry just created");
            entry.release_request();
            let mut rep =
                HttpReply::synthesize(status, None, Some(0), self.core.now());
            rep.headers.insert(
                http::header::LOCATION,
                http::HeaderValue::from_str(&location)
                    .unwrap_or(http::HeaderValue::from_static("/")),
            );
            entry.replace_reply(rep);
            entry.complete();
            return;
        }

        let entry = self.tx.entry.clone().expect("entry just created");
        self.core.forwarder.start(&entry, &self.forwarded_request());
    }

    fn forwarded_request(&self) -> ForwardedRequest {
        ForwardedRequest {
            method: self.tx.method.clone(),
            url: self.tx.url.clone(),
            headers: self.tx.headers.clone(),
            if_modified_since: self.tx.lastmod,
            refresh: self.tx.flags.refresh,
        }
    }

    /// `only-if-cached` and nothing servable: 504 per RFC 2068.
    fn process_only_if_cached_miss(&mut self) {
        tracing::debug!(url = %self.tx.url, "only-if-cached miss");
        self.remove_client_store_reference();
        self.start_error(ErrKind::OnlyIfCachedMiss, StatusCode::GATEWAY_TIMEOUT);
    }

    /// Put an error page where the reply would have gone.
    pub(crate) fn start_error(&mut self, kind: ErrKind, status: StatusCode) {
        self.create_store_entry();
        self.trigger_initial_store_read();
        let entry = self.tx.entry.clone().expect("entry just created");
        errorpage::fill_entry(
            &entry,
            kind,
            status,
            Some(&self.tx.url),
            &self.core.config.visible_hostname,
            self.core.now(),
        );
    }

    /// Anonymous entry to hold whatever we are about to generate or
    /// fetch.
    pub(crate) fn create_store_entry(&mut self) {
        let entry =
            self.core
                .store
                .create_entry(&self.tx.url, &self.tx.method, None, false);
        entry.set_hints(RequestHints {
            cachable: self.tx.flags.cachable,
            range_full_download: self.tx.flags.range_full_download,
        });
        self.sc = Some(self.attach_reader(&entry));
        self.reqofs = 0;
        self.reqsize = 0;
        self.flags.storelogiccomplete = true;
        self.tx.entry = Some(entry);
    }

    pub(crate) fn trigger_initial_store_read(&mut self) {
        debug_assert_eq!(self.reqofs, 0);
        self.store_copy(0, CopyRoute::SendMoreData);
    }

    // --- stale revalidation --------------------------------------------

    /// Park the current store pair, fetch fresh with an IMS, and decide
    /// in `handle_ims_reply` which of the two the client gets.
    fn process_expired(&mut self) {
        tracing::debug!(url = %self.tx.url, "revalidating stale entry");
        if self.tx.flags.only_if_cached {
            self.process_only_if_cached_miss();
            return;
        }
        self.tx.flags.refresh = true;

        self.save_state();
        let entry =
            self.core
                .store
                .create_entry(&self.tx.url, &self.tx.method, None, false);
        self.sc = Some(self.attach_reader(&entry));
        self.tx.lastmod = self.old_entry.as_ref().and_then(|e| e.lastmod());
        self.tx.entry = Some(entry.clone());
        debug_assert_eq!(self.tx.out.offset, 0);

        self.core.forwarder.start(&entry, &self.forwarded_request());

        if entry.aborted() {
            tracing::error!("revalidation entry aborted before the first read");
        }
        // read the first frame of the fresh reply
        self.store_copy(0, CopyRoute::HandleImsReply);
    }

    pub(crate) fn save_state(&mut self) {
        debug_assert!(self.old_sc.is_none(), "state already saved");
        tracing::debug!("saving store context");
        self.old_entry = self.tx.entry.take();
        self.old_sc = self.sc.take();
        self.saved_reqsize = self.reqsize;
        self.saved_reqofs = self.reqofs;
        self.reqsize = 0;
        self.reqofs = 0;
    }

    pub(crate) fn restore_state(&mut self) {
        debug_assert!(self.old_sc.is_some(), "no saved state to restore");
        tracing::debug!("restoring store context");
        self.remove_client_store_reference();
        self.tx.entry = self.old_entry.take();
        self.sc = self.old_sc.take();
        self.reqsize = self.saved_reqsize;
        self.reqofs = self.saved_reqofs;
        self.saved_reqsize = 0;
        self.saved_reqofs = 0;
    }

    /// The fresh upstream reply is the one to send.
    fn send_client_upstream_response(&mut self, result: StoreCopyReply) -> Result<()> {
        self.remove_old_store_reference();
        self.saved_reqofs = 0;
        self.saved_reqsize = 0;
        self.reqofs = 0;
        self.reqsize = result.data.len() as u64;
        self.send_more_data(result)
    }

    /// The saved entry is still good; serve it.
    fn send_client_old_entry(&mut self) -> Result<()> {
        self.restore_state();
        self.reqofs = 0;
        self.reqsize = 0;
        self.store_copy(0, CopyRoute::SendMoreData);
        Ok(())
    }

    /// First frame of the revalidation fetch: dispatch on what the
    /// origin said.
    fn handle_ims_reply(&mut self, result: StoreCopyReply) -> Result<()> {
        let Some(entry) = self.tx.entry.clone() else {
            return Ok(());
        };
        tracing::debug!(url = %entry.url(), bytes = result.data.len(), "revalidation reply");

        if result.error && !entry.aborted() {
            return Ok(());
        }
        self.reqsize = self.reqofs + result.data.len() as u64;

        // request to origin was aborted
        if entry.aborted() {
            tracing::debug!("origin fetch aborted, sending the saved entry");
            self.tx.log_type = LogType::TcpRefreshFailOld;
            return self.send_client_old_entry();
        }

        let status = entry.reply().map(|r| r.status);
        let now = self.core.now();

        if status == Some(StatusCode::NOT_MODIFIED) {
            self.tx.log_type = LogType::TcpRefreshUnmodified;
            self.tx.flags.stale_if_hit = false; // the entry is no longer stale

            let old_entry = self
                .old_entry
                .clone()
                .ok_or_else(|| anyhow!("revalidation reply without a saved entry"))?;
            if let Some(fresh) = entry.reply() {
                old_entry.update_on_not_modified(&fresh);
            }
            old_entry.timestamps_set(now);

            let forward_304 = self.tx.flags.ims
                && self
                    .tx
                    .ims
                    .map(|ims| !old_entry.modified_since(ims))
                    .unwrap_or(false);
            if forward_304 {
                tracing::debug!("origin replied 304, forwarding it to the client");
                self.send_client_upstream_response(result)
            } else {
                tracing::debug!("origin replied 304, serving the revalidated entry");
                self.send_client_old_entry()
            }
        } else if matches!(status, Some(s) if s.as_u16() < 500) {
            self.tx.log_type = LogType::TcpRefreshModified;
            tracing::debug!(status = ?status, "origin replaced the entry");
            // the stale object is dead; drop it from the public table
            if let Some(old) = &self.old_entry {
                old.release();
            }
            self.send_client_upstream_response(result)
        } else if self.core.config.fail_on_validation_err
            || self.tx.flags.fail_on_validation_err
        {
            self.tx.log_type = LogType::TcpRefreshFailErr;
            tracing::debug!(status = ?status, "validation error forwarded to client");
            self.send_client_upstream_response(result)
        } else {
            self.tx.log_type = LogType::TcpRefreshFailOld;
            tracing::debug!(status = ?status, "validation error, serving the saved entry");
            self.send_client_old_entry()
        }
    }

    // --- conditional requests ------------------------------------------

    fn process_conditional(&mut self, result: StoreCopyReply) -> Result<()> {
        let Some(entry) = self.tx.entry.clone() else {
            return Ok(());
        };

        let stored_status = entry.reply().map(|r| r.status);
        if stored_status != Some(StatusCode::OK) {
            tracing::debug!(status = ?stored_status, "conditional against non-200, MISS");
            self.tx.log_type = LogType::TcpMiss;
            self.process_miss();
            return Ok(());
        }

        if self.tx.headers.contains_key(http::header::IF_MATCH)
            && !entry.has_if_match_etag(&self.tx.headers)
        {
            self.send_precondition_failed();
            return Ok(());
        }

        let mut matched_if_none_match = false;
        if self.tx.headers.contains_key(http::header::IF_NONE_MATCH) {
            if !entry.has_if_none_match_etag(&self.tx.headers) {
                // RFC 2616: ignore IMS if If-None-Match did not match
                self.tx.flags.ims = false;
                self.tx.ims = None;
                self.tx.headers.remove(http::header::IF_MODIFIED_SINCE);
                self.tx.log_type = LogType::TcpMiss;
                return self.send_more_data(result);
            }
            if !self.tx.flags.ims {
                self.send_not_modified_or_precondition_failed();
                return Ok(());
            }
            matched_if_none_match = true;
        }

        if self.tx.flags.ims {
            let modified = self
                .tx
                .ims
                .map(|ims| entry.modified_since(ims))
                .unwrap_or(true);
            if modified {
                self.tx.log_type = LogType::TcpImsHit;
                return self.send_more_data(result);
            }
            if matched_if_none_match {
                self.send_not_modified_or_precondition_failed();
                return Ok(());
            }
            self.send_not_modified();
            return Ok(());
        }

        // a satisfied If-Match alone: serve the entry
        self.send_more_data(result)
    }

    fn send_not_modified(&mut self) {
        let Some(entry) = self.tx.entry.clone() else {
            return;
        };
        let timestamp = entry.timestamp();
        let rep304 = entry
            .reply()
            .map(|r| r.make_304())
            .unwrap_or_else(|| HttpReply::synthesize(StatusCode::NOT_MODIFIED, None, None, self.core.now()));
        self.tx.log_type = LogType::TcpImsHit;
        self.remove_client_store_reference();
        self.create_store_entry();
        let e = self.tx.entry.clone().expect("entry just created");
        e.replace_reply(rep304);
        e.complete();
        // keep the original timestamp so Age stays meaningful
        e.timestamps_set(self.core.now());
        if let Some(t) = timestamp {
            e.set_timestamp(t);
        }
        self.trigger_initial_store_read();
    }

    fn send_precondition_failed(&mut self) {
        self.tx.log_type = LogType::TcpHit;
        self.remove_client_store_reference();
        self.reply = None;
        self.start_error(ErrKind::PreconditionFailed, StatusCode::PRECONDITION_FAILED);
    }

    fn send_not_modified_or_precondition_failed(&mut self) {
        if self.tx.method == Method::GET || self.tx.method == Method::HEAD {
            self.send_not_modified();
        } else {
            self.send_precondition_failed();
        }
    }

    // --- pushing bytes downstream --------------------------------------

    fn error_in_stream(&self, result: &StoreCopyReply) -> bool {
        let aborted = self
            .tx
            .entry
            .as_ref()
            .map(|e| e.aborted())
            .unwrap_or(false);
        aborted || result.error || self.reqofs == 0 && result.data.is_empty() && !self.flags.headers_sent
    }

    fn send_stream_error(&mut self, result: &StoreCopyReply) {
        tracing::debug!("stream error, marking complete and sending no data");
        self.flags.complete = true;
        self.tx.flags.stream_error = true;
        let _ = result;
        self.sink.deliver(None, StreamChunk::error());
    }

    fn push_stream_data(&mut self, result: StoreCopyReply) {
        if result.data.is_empty() {
            tracing::debug!("zero-length store result marks the reply complete");
            self.flags.complete = true;
        }
        debug_assert!(result.offset >= self.headers_sz as u64);
        let body_offset = result.offset.saturating_sub(self.headers_sz as u64);
        let len = result.data.len() as u64;
        self.tx.out.offset = body_offset + len;
        self.tx.out.size += len;
        self.sink.deliver(
            None,
            StreamChunk {
                offset: body_offset,
                data: result.data,
                error: false,
            },
        );
    }

    /// Accepts a chunk of the reply, parses and mangles the header on
    /// first contact, and writes onward.
    fn send_more_data(&mut self, result: StoreCopyReply) -> Result<()> {
        self.flags.storelogiccomplete = true;
        self.reqofs += result.data.len() as u64;
        self.reqsize = self.reqofs;

        if self.error_in_stream(&result) {
            self.send_stream_error(&result);
            return Ok(());
        }
        if self.flags.headers_sent {
            self.push_stream_data(result);
            return Ok(());
        }

        self.clone_reply(&result)?;

        if self.core.config.onoff.log_mime_hdrs {
            if let Some(reply) = &self.reply {
                let head = reply.to_bytes();
                self.log_reply_headers =
                    Some(String::from_utf8_lossy(&head).into_owned());
            }
        }

        self.holding = Some(result);
        self.process_reply_access();
        Ok(())
    }

    /// Copy the stored reply and run the header surgery on our copy.
    fn clone_reply(&mut self, result: &StoreCopyReply) -> Result<()> {
        debug_assert!(self.reply.is_none());
        let mut rep = self
            .tx
            .entry
            .as_ref()
            .and_then(|e| e.reply())
            .or_else(|| HttpReply::parse(&result.data))
            .ok_or_else(|| anyhow!("no parsable reply head in store entry"))?;
        if rep.version < http::Version::HTTP_11 {
            rep.version = http::Version::HTTP_11;
        }
        // hdr_sz must describe the bytes actually in the object stream
        self.reply = Some(rep);
        super::headers::build_reply_header(self);
        Ok(())
    }

    // --- reply access control ------------------------------------------

    fn always_allow(status: StatusCode) -> bool {
        status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
    }

    fn process_reply_access(&mut self) {
        let reply = self.reply.as_ref().expect("reply cloned before access check");
        self.headers_sz = reply.hdr_sz;

        // never block our own error responses or status messages
        if matches!(self.tx.log_type, LogType::TcpDenied | LogType::TcpDeniedReply)
            || Self::always_allow(reply.status)
        {
            self.process_reply_access_result(true);
            return;
        }

        if reply.expected_body_too_large(self.core.config.reply_body_max_size) {
            self.send_body_too_large();
            return;
        }

        match self.core.reply_access.clone() {
            None => self.process_reply_access_result(true),
            Some(acl) => {
                let h = self.handle();
                acl.check(
                    &self.tx.method,
                    &self.tx.url,
                    reply,
                    Box::new(move |allowed| {
                        h.call("ReplyContext::processReplyAccessResult", move |rc, _ctx| {
                            rc.process_reply_access_result(allowed);
                            Ok(())
                        });
                    }),
                );
            }
        }
    }

    fn send_body_too_large(&mut self) {
        tracing::debug!(url = %self.tx.url, "reply body exceeds reply_body_max_size");
        self.tx.log_type = LogType::TcpDeniedReply;
        self.remove_client_store_reference();
        self.reply = None;
        self.holding = None;
        self.start_error(ErrKind::TooBig, StatusCode::FORBIDDEN);
    }

    fn process_reply_access_result(&mut self, allowed: bool) {
        if !allowed {
            tracing::debug!(url = %self.tx.url, "reply denied by access control");
            self.tx.log_type = LogType::TcpDeniedReply;
            self.remove_client_store_reference();
            self.reply = None;
            self.holding = None;
            self.start_error(ErrKind::AccessDenied, StatusCode::FORBIDDEN);
            return;
        }

        let Some(result) = self.holding.take() else {
            return;
        };
        let reply = self.reply.clone().expect("reply present on allowed path");
        let hdr_sz = self.headers_sz;

        let mut body_size = self.reqofs.saturating_sub(hdr_sz as u64) as usize;
        if body_size == 0 {
            self.reqofs = hdr_sz as u64;
        }
        tracing::debug!(
            body = body_size,
            headers = hdr_sz,
            "appending body after headers"
        );

        if self.tx.method == Method::HEAD {
            // no body on HEAD replies
            body_size = 0;
            self.tx.flags.done_copying = true;
            self.flags.complete = true;
        }

        debug_assert!(!self.flags.headers_sent);
        self.flags.headers_sent = true;

        let body = if body_size > 0 && result.data.len() > hdr_sz {
            result.data.slice(hdr_sz..hdr_sz + body_size.min(result.data.len() - hdr_sz))
        } else {
            Bytes::new()
        };

        self.tx.out.headers_sz = hdr_sz;
        self.tx.out.size += hdr_sz as u64 + body.len() as u64;
        self.tx.out.offset = body.len() as u64;
        self.sink.deliver(
            Some(&reply),
            StreamChunk {
                offset: 0,
                data: body,
                error: false,
            },
        );
    }

    // --- transfer accounting -------------------------------------------

    fn check_transfer_done(&self) -> bool {
        let Some(entry) = self.tx.entry.as_ref() else {
            return false;
        };
        if self.tx.flags.done_copying {
            return true;
        }
        if self.tx.flags.chunked_reply && !self.flags.complete {
            // last-chunk has not been sent
            return false;
        }
        if entry.store_status() == StoreStatus::Ok {
            match entry.object_len() {
                Some(len) => self.tx.out.offset >= len.saturating_sub(self.headers_sz as u64),
                None => false,
            }
        } else {
            if self.headers_sz == 0 {
                return false;
            }
            let Some(content_length) =
                self.reply.as_ref().and_then(|r| r.content_length())
            else {
                return false;
            };
            self.tx.out.size >= content_length + self.tx.out.headers_sz as u64
        }
    }

    /// What the downstream driver should do next.
    pub fn reply_status(&self) -> StreamStatus {
        let Some(entry) = self.tx.entry.as_ref() else {
            return StreamStatus::Failed;
        };
        if entry.aborted() {
            return StreamStatus::Failed;
        }

        let done = self.check_transfer_done();
        if done || self.flags.complete {
            let expected_body = self
                .reply
                .as_ref()
                .and_then(|r| r.body_size(&self.tx.method));
            if !self.tx.flags.proxy_keepalive && expected_body.is_none() {
                return StreamStatus::Failed;
            }
            if !done {
                return StreamStatus::Failed;
            }
            if let Some(expected) = expected_body {
                let got = self.tx.out.size.saturating_sub(self.tx.out.headers_sz as u64);
                if got < expected {
                    return StreamStatus::UnplannedComplete;
                }
            }
            if self.tx.flags.proxy_keepalive {
                return StreamStatus::Complete;
            }
            return StreamStatus::UnplannedComplete;
        }

        let max = self.core.config.reply_body_max_size;
        if max > 0 && self.tx.out.offset > max + REQBUF_SZ as u64 {
            tracing::debug!("client reply body is too large");
            return StreamStatus::Failed;
        }
        StreamStatus::None
    }

    // --- TRACE ---------------------------------------------------------

    /// `TRACE` with `Max-Forwards: 0`: echo the request without any
    /// upstream contact.
    fn trace_reply(&mut self) -> Result<()> {
        let echo = self.tx.prefix_bytes();
        self.create_store_entry();
        let entry = self.tx.entry.clone().expect("entry just created");
        entry.release_request();
        entry.buffer();
        let rep = HttpReply::synthesize(
            StatusCode::OK,
            Some("message/http"),
            Some(echo.len() as u64),
            self.core.now(),
        );
        entry.replace_reply(rep);
        entry.append(&echo);
        entry.complete();
        self.trigger_initial_store_read();
        Ok(())
    }

    // --- reference bookkeeping -----------------------------------------

    pub(crate) fn remove_client_store_reference(&mut self) {
        if let (Some(sc), Some(entry)) = (self.sc.take(), self.tx.entry.take()) {
            sc.unregister();
            entry.unlock();
        } else {
            self.sc = None;
            self.tx.entry = None;
        }
    }

    pub(crate) fn remove_old_store_reference(&mut self) {
        if let (Some(sc), Some(entry)) = (self.old_sc.take(), self.old_entry.take()) {
            sc.unregister();
            entry.unlock();
        } else {
            self.old_sc = None;
            self.old_entry = None;
        }
    }
}

fn is_standard_method(m: &Method) -> bool {
    matches!(
        *m,
        Method::GET
            | Method::HEAD
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::OPTIONS
            | Method::TRACE
            | Method::CONNECT
            | Method::PATCH
    )
}
