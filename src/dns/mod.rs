//! The internal recursive DNS stub resolver.
//!
//! Forwarding resolves origin names through [`Resolver`]: UDP with
//! truncation fallback to per-nameserver TCP circuits, retransmit
//! backoff, search-path expansion, parallel A/AAAA and coalescing of
//! identical lookups. See [`resolver`] for the lifecycle, [`message`]
//! for the wire codec, and [`wire`] for the socket seam.

pub mod message;
pub mod resolver;
pub(crate) mod vc;
pub mod wire;

pub use message::{ResourceRecord, RrData, rcode_text};
pub use resolver::{DnsCallback, DnsStats, MAX_ATTEMPT, Resolver};
pub use wire::{MockWire, TokioWire, Wire};
