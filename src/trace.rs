//! Tracing subscriber setup for applications embedding the proxy core.
//!
//! The core only emits `tracing` events — call names entering and
//! leaving the engine queue, store reader decisions, DNS retransmits.
//! This helper wires a formatted subscriber at the verbosity the
//! [`Config`] asks for, so an embedder gets useful cache diagnostics
//! without assembling layers by hand. Anything fancier (JSON output,
//! OTLP export) belongs to the embedding application.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Resolve the configured `log_level` string, treating anything
/// unparsable as `info` rather than silencing the process.
pub fn level_filter(config: &Config) -> LevelFilter {
    config.log_level.parse().unwrap_or(LevelFilter::INFO)
}

/// Install the global subscriber for the proxy core's diagnostics.
///
/// # Examples
///
/// ```rust,no_run
/// use ikura::config::Config;
///
/// ikura::trace::init_tracing(&Config::default().log_level("debug"));
/// ```
pub fn init_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(level_filter(config)),
        )
        .init();
}
