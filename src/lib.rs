#![cfg_attr(docsrs, feature(doc_cfg))]

//! The request-to-reply core of a caching HTTP proxy.
//!
//! Ikura mediates between clients, a shared object store and upstream
//! origins. It is not a complete proxy: the HTTP front-end, the
//! forwarding engine and the access-control machinery live elsewhere and
//! plug in through narrow trait seams. What lives here is the hard
//! middle:
//!
//! - the per-request reply state machine ([`reply`]) deciding hit, miss,
//!   revalidate, purge or conditional, and rebuilding reply headers;
//! - the reader half of the object store ([`store`]), streaming bytes
//!   from entries that may still be arriving, in memory or on disk
//!   behind a metadata envelope;
//! - an internal recursive DNS stub resolver ([`dns`]) with retransmit
//!   backoff, TCP fallback and parallel A/AAAA lookups;
//! - the cooperative call/job engine ([`event`]) that sequences all of
//!   the above without locks in anger.
//!
//! # Concurrency model
//!
//! Single-threaded cooperative: nothing suspends mid-operation. Work
//! that must wait schedules a deferred call; socket readers and timers
//! feed completions into the same queue. Long-lived objects are jobs
//! addressed through weak handles, so callbacks into dead objects
//! cancel silently instead of dereferencing freed state.
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use ikura::config::Config;
//! use ikura::core::Core;
//! use ikura::reply::{ReplyContext, Transaction};
//! use ikura::stream::BufferSink;
//! use http::{Method, Version, HeaderMap};
//!
//! let core = Core::builder(Config::default()).build();
//! let tx = Transaction::from_request(
//!     Method::GET,
//!     &"http://example.org/".parse().unwrap(),
//!     Version::HTTP_11,
//!     HeaderMap::new(),
//! );
//! let sink = BufferSink::new();
//! let handle = ReplyContext::start(core.clone(), tx, Box::new(sink.clone()));
//! core.engine.run_until_idle();
//! ```

/// Runtime configuration.
pub mod config;

/// The wiring hub tying engine, store, seams and configuration together.
pub mod core;

/// The internal DNS stub resolver.
pub mod dns;

/// Synthesized error replies.
pub mod errorpage;

/// The cooperative call queue, timers and job lifecycle.
pub mod event;

/// Seams toward forwarding, the IP cache and cache peers.
pub mod forward;

/// Parsed HTTP reply heads.
pub mod msg;

/// Freshness checking for stored objects.
pub mod refresh;

/// The per-request reply pipeline.
pub mod reply;

/// The shared object store and its reader half.
pub mod store;

/// The downstream client-stream seam.
pub mod stream;

/// Tracing subscriber setup.
#[cfg(feature = "ikura-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "ikura-tracing")))]
pub mod trace;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};

pub use crate::core::Core;
pub use config::Config;
pub use event::Engine;
pub use reply::{ReplyContext, Transaction};
