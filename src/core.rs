//! The wiring hub: one `Core` ties the engine, the store, the seams and
//! the configuration together for the reply pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use http::HeaderMap;

use crate::config::Config;
use crate::dns::Resolver;
use crate::event::Engine;
use crate::forward::{Forwarder, IpCache, NullForwarder, NullIpCache, NullPeers, PeerNotifier};
use crate::reply::ReplyAccess;
use crate::store::Store;
use crate::store::swap::{MemSwapStore, SwapStore};

/// Hook applied to outgoing reply headers after all standard surgery.
pub type ReplyMangler = Arc<dyn Fn(&mut HeaderMap) + Send + Sync>;

pub struct Core {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
    pub store: Arc<Store>,
    pub swap: Arc<dyn SwapStore>,
    pub forwarder: Arc<dyn Forwarder>,
    pub ip_cache: Arc<dyn IpCache>,
    pub peers: Arc<dyn PeerNotifier>,
    pub reply_access: Option<Arc<dyn ReplyAccess>>,
    pub reply_mangler: Option<ReplyMangler>,
    pub resolver: Option<Arc<Resolver>>,
    shutting_down: AtomicBool,
    fd_usage_high: AtomicBool,
}

impl Core {
    pub fn builder(config: Config) -> CoreBuilder {
        CoreBuilder::new(config)
    }

    pub fn now(&self) -> SystemTime {
        self.engine.now()
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Flip during shutdown: persistent connections stop being offered.
    pub fn set_shutting_down(&self, on: bool) {
        self.shutting_down.store(on, Ordering::Relaxed);
    }

    pub fn fd_usage_high(&self) -> bool {
        self.fd_usage_high.load(Ordering::Relaxed)
    }

    pub fn set_fd_usage_high(&self, on: bool) {
        self.fd_usage_high.store(on, Ordering::Relaxed);
    }
}

/// Assembles a [`Core`], defaulting every seam to its null (or
/// memory-backed) implementation.
pub struct CoreBuilder {
    config: Config,
    engine: Option<Arc<Engine>>,
    store: Option<Arc<Store>>,
    swap: Option<Arc<dyn SwapStore>>,
    forwarder: Option<Arc<dyn Forwarder>>,
    ip_cache: Option<Arc<dyn IpCache>>,
    peers: Option<Arc<dyn PeerNotifier>>,
    reply_access: Option<Arc<dyn ReplyAccess>>,
    reply_mangler: Option<ReplyMangler>,
    resolver: Option<Arc<Resolver>>,
}

impl CoreBuilder {
    pub fn new(config: Config) -> CoreBuilder {
        CoreBuilder {
            config,
            engine: None,
            store: None,
            swap: None,
            forwarder: None,
            ip_cache: None,
            peers: None,
            reply_access: None,
            reply_mangler: None,
            resolver: None,
        }
    }

    pub fn engine(mut self, engine: Arc<Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn swap(mut self, swap: Arc<dyn SwapStore>) -> Self {
        self.swap = Some(swap);
        self
    }

    pub fn forwarder(mut self, f: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(f);
        self
    }

    pub fn ip_cache(mut self, c: Arc<dyn IpCache>) -> Self {
        self.ip_cache = Some(c);
        self
    }

    pub fn peers(mut self, p: Arc<dyn PeerNotifier>) -> Self {
        self.peers = Some(p);
        self
    }

    pub fn reply_access(mut self, a: Arc<dyn ReplyAccess>) -> Self {
        self.reply_access = Some(a);
        self
    }

    pub fn reply_mangler(mut self, m: ReplyMangler) -> Self {
        self.reply_mangler = Some(m);
        self
    }

    pub fn resolver(mut self, r: Arc<Resolver>) -> Self {
        self.resolver = Some(r);
        self
    }

    pub fn build(self) -> Arc<Core> {
        let engine = self.engine.unwrap_or_else(Engine::new);
        let swap = self
            .swap
            .unwrap_or_else(|| MemSwapStore::new(engine.clone()) as Arc<dyn SwapStore>);
        Arc::new(Core {
            config: Arc::new(self.config),
            store: self.store.unwrap_or_else(Store::new),
            swap,
            forwarder: self.forwarder.unwrap_or_else(|| Arc::new(NullForwarder)),
            ip_cache: self.ip_cache.unwrap_or_else(|| Arc::new(NullIpCache)),
            peers: self.peers.unwrap_or_else(|| Arc::new(NullPeers)),
            reply_access: self.reply_access,
            reply_mangler: self.reply_mangler,
            resolver: self.resolver,
            shutting_down: AtomicBool::new(false),
            fd_usage_high: AtomicBool::new(false),
            engine,
        })
    }
}
