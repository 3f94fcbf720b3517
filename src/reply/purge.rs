//! The `PURGE` state machine.
//!
//! A purge walks numbered store lookups: find a GET or HEAD object to
//! serve once as a parting hit, then actually release the GET, HEAD and
//! variant objects, then synthesize a `200 OK` or `404 Not Found`
//! depending on whether anything was dropped. The phase enum is the
//! continuation; each lookup result re-enters `purge_step`.

use std::sync::Arc;

use http::{Method, StatusCode};

use crate::errorpage::ErrKind;
use crate::msg::HttpReply;
use crate::store::{RequestHints, StoreEntry};

use super::LogType;
use super::context::{CopyRoute, PurgePhase, ReplyContext};

impl ReplyContext {
    pub(crate) fn purge_request(&mut self) {
        if !self.core.config.onoff.enable_purge {
            tracing::debug!(url = %self.tx.url, "PURGE disabled by configuration");
            self.tx.log_type = LogType::TcpDenied;
            self.start_error(ErrKind::AccessDenied, StatusCode::FORBIDDEN);
            return;
        }

        // drop cached name resolutions for the host as well
        self.core.ip_cache.invalidate(&self.tx.host);

        if !self.flags.purging {
            self.flags.purging = true;
            self.purge_phase = Some(PurgePhase::FindGet);
            self.purge_lookup(Method::GET);
        } else {
            self.purge_do_miss_purge();
        }
    }

    /// Issue the phase's store lookup and re-enter asynchronously.
    fn purge_lookup(&mut self, method: Method) {
        let found = self.core.store.get_public(&self.tx.url, &method);
        let h = self.handle();
        h.call("ReplyContext::purgeStep", move |rc, _ctx| {
            rc.purge_step(found);
            Ok(())
        });
    }

    fn purge_step(&mut self, found: Option<Arc<StoreEntry>>) {
        match self.purge_phase {
            Some(PurgePhase::FindGet) => match found {
                Some(entry) => self.purge_found_object(entry),
                None => {
                    self.purge_phase = Some(PurgePhase::FindHead);
                    self.purge_lookup(Method::HEAD);
                }
            },
            Some(PurgePhase::FindHead) => match found {
                Some(entry) => self.purge_found_object(entry),
                None => self.purge_do_miss_purge(),
            },
            Some(PurgePhase::DoGet) => {
                self.purge_status = StatusCode::NOT_FOUND;
                if let Some(entry) = found {
                    tracing::debug!(url = %entry.url(), "purging GET");
                    self.core.peers.clear(&self.tx.url, &Method::GET);
                    entry.release();
                    self.purge_status = StatusCode::OK;
                }
                self.purge_phase = Some(PurgePhase::DoHead);
                self.purge_lookup(Method::HEAD);
            }
            Some(PurgePhase::DoHead) => {
                if let Some(entry) = found {
                    tracing::debug!(url = %entry.url(), "purging HEAD");
                    self.core.peers.clear(&self.tx.url, &Method::HEAD);
                    entry.release();
                    self.purge_status = StatusCode::OK;
                }
                // variants stored under selecting-header signatures
                if self.core.store.release_by_url(&self.tx.url) > 0 {
                    self.purge_status = StatusCode::OK;
                }
                self.purge_phase = None;
                self.purge_finish();
            }
            None => {
                tracing::warn!("purge step without a phase");
            }
        }
    }

    /// Serve the object being purged as one last hit; the hit path loops
    /// back into `purge_request` with `purging` already set.
    fn purge_found_object(&mut self, entry: Arc<StoreEntry>) {
        if entry.special() {
            self.tx.log_type = LogType::TcpDenied;
            self.start_error(ErrKind::AccessDenied, StatusCode::FORBIDDEN);
            return;
        }

        entry.lock();
        entry.ensure_mem_object();
        entry.set_hints(RequestHints {
            cachable: false,
            range_full_download: false,
        });
        self.sc = Some(self.attach_reader(&entry));
        self.tx.entry = Some(entry);
        self.tx.log_type = LogType::TcpHit;
        self.reqofs = 0;
        self.store_copy(0, CopyRoute::CacheHit);
    }

    fn purge_do_miss_purge(&mut self) {
        self.tx.log_type = LogType::TcpMiss;
        self.purge_phase = Some(PurgePhase::DoGet);
        self.purge_lookup(Method::GET);
    }

    /// Make a fresh entry holding the synthesized purge verdict.
    fn purge_finish(&mut self) {
        self.create_store_entry();
        self.trigger_initial_store_read();
        let entry = self.tx.entry.clone().expect("entry just created");
        let rep = HttpReply::synthesize(self.purge_status, None, Some(0), self.core.now());
        entry.replace_reply(rep);
        entry.complete();
    }

    /// Extension-method fallout: drop every cached variant of the URL.
    pub(crate) fn purge_all_cached(&mut self) {
        let mut cleared = false;
        for method in [Method::GET, Method::HEAD] {
            if let Some(entry) = self.core.store.get_public(&self.tx.url, &method) {
                tracing::debug!(url = %self.tx.url, %method, "releasing cached object");
                self.core.peers.clear(&self.tx.url, &method);
                entry.release();
                cleared = true;
            }
        }
        self.core.store.release_by_url(&self.tx.url);
        if !cleared {
            // tell peers anyway; they may hold what we never did
            self.core.peers.clear(&self.tx.url, &Method::GET);
        }
    }
}
