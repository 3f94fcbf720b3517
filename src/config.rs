//! Runtime configuration for the proxy core.
//!
//! One `Config` value is built at startup and shared read-only for the
//! lifetime of the process. All fields carry serde defaults so a partial
//! JSON/TOML document deserializes into a usable configuration, and the
//! builder-style setters allow programmatic construction in tests and
//! embedding applications.
//!
//! # Examples
//!
//! ```rust
//! use ikura::config::Config;
//!
//! let cfg = Config::default()
//!     .visible_hostname("cache-1.example.net")
//!     .enable_purge(true);
//! assert!(cfg.onoff.enable_purge);
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration shared by every subsystem.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hostname advertised in `Via`, `X-Cache` and generated error pages.
    pub visible_hostname: String,
    /// Diagnostic verbosity for the built-in tracing subscriber
    /// (`error`..`trace`, or `off`). Only consulted by
    /// `trace::init_tracing`.
    pub log_level: String,
    /// Treat this instance as the origin server: swap `Date` to now on hits
    /// and preserve the upstream values in `X-Origin-*` headers.
    pub act_as_origin: bool,
    /// Login mode configured for the next-hop peer, when any. `PASS` and
    /// `PASSTHRU` keep `Proxy-Authenticate` in replies.
    pub peer_login: Option<String>,
    /// Boolean feature switches.
    pub onoff: Switches,
    /// Internal DNS resolver settings.
    pub dns: DnsConfig,
    /// Early-abort policy for half-fetched objects.
    pub quick_abort: QuickAbort,
    /// Largest object kept in the memory cache, in bytes.
    pub max_in_mem_obj_size: u64,
    /// Upper bound on reply bodies relayed to clients. `0` disables the check.
    pub reply_body_max_size: u64,
    /// Maximum simultaneously open swap-in files before readers are failed
    /// over to a miss.
    pub max_open_disk_files: usize,
    /// Forward origin validation errors (5xx on revalidation) instead of
    /// serving the stale object.
    pub fail_on_validation_err: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            visible_hostname: "localhost".to_string(),
            log_level: "info".to_string(),
            act_as_origin: false,
            peer_login: None,
            onoff: Switches::default(),
            dns: DnsConfig::default(),
            quick_abort: QuickAbort::default(),
            max_in_mem_obj_size: 512 * 1024,
            reply_body_max_size: 0,
            max_open_disk_files: 128,
            fail_on_validation_err: false,
        }
    }
}

impl Config {
    pub fn visible_hostname(mut self, h: impl Into<String>) -> Self {
        self.visible_hostname = h.into();
        self
    }
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
    pub fn act_as_origin(mut self, yes: bool) -> Self {
        self.act_as_origin = yes;
        self
    }
    pub fn peer_login(mut self, mode: impl Into<String>) -> Self {
        self.peer_login = Some(mode.into());
        self
    }
    pub fn offline(mut self, yes: bool) -> Self {
        self.onoff.offline = yes;
        self
    }
    pub fn enable_purge(mut self, yes: bool) -> Self {
        self.onoff.enable_purge = yes;
        self
    }
    pub fn memory_cache_disk(mut self, yes: bool) -> Self {
        self.onoff.memory_cache_disk = yes;
        self
    }
    pub fn max_in_mem_obj_size(mut self, n: u64) -> Self {
        self.max_in_mem_obj_size = n;
        self
    }
    pub fn reply_body_max_size(mut self, n: u64) -> Self {
        self.reply_body_max_size = n;
        self
    }
    pub fn fail_on_validation_err(mut self, yes: bool) -> Self {
        self.fail_on_validation_err = yes;
        self
    }
    pub fn nameservers(mut self, ns: Vec<IpAddr>) -> Self {
        self.dns.nameservers = ns;
        self
    }
}

/// On/off switches, grouped the way operators think about them.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Switches {
    /// Serve everything we have as a hit and never contact origins.
    pub offline: bool,
    /// Copy disk reads back into the memory cache for small objects.
    pub memory_cache_disk: bool,
    /// Append our hop to the `Via` reply header.
    pub via: bool,
    /// Allow persistent client connections on error replies.
    pub error_pconns: bool,
    /// Allow persistent client connections at all.
    pub client_pconns: bool,
    /// Accept the `PURGE` method.
    pub enable_purge: bool,
    /// Capture reply MIME headers into the access log record.
    pub log_mime_hdrs: bool,
    /// Drop DNS datagrams that do not come from a configured nameserver.
    pub ignore_unknown_nameservers: bool,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            offline: false,
            memory_cache_disk: true,
            via: true,
            error_pconns: true,
            client_pconns: true,
            enable_purge: false,
            log_mime_hdrs: false,
            ignore_unknown_nameservers: true,
        }
    }
}

/// Internal DNS resolver settings. Timeouts are in milliseconds, matching
/// the granularity of the retransmit schedule.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Nameservers in priority order. When empty, the platform resolver
    /// configuration is consulted, then `127.0.0.1`.
    pub nameservers: Vec<IpAddr>,
    /// Issue parallel AAAA queries and accept IPv6 nameservers.
    pub ipv6: bool,
    /// Total time allowed for one lookup before it fails, in ms.
    pub query_timeout_ms: u64,
    /// Base retransmit interval, in ms. Doubles per full sweep of the
    /// nameserver pool.
    pub retransmit_ms: u64,
    /// Expand unqualified names through the search path.
    pub res_defnames: bool,
    /// Names with fewer dots than this get the search path applied first.
    pub ndots: u32,
    /// Advertised EDNS payload size; `0` disables EDNS advertising.
    pub packet_max: u16,
    /// Put A records ahead of AAAA records in merged answers.
    pub v4_first: bool,
    /// Search-path suffixes for unqualified names.
    pub search: Vec<String>,
    /// Connect timeout for the per-nameserver TCP channel, in ms.
    pub vc_connect_timeout_ms: u64,
    /// Platform resolver configuration to fall back to; `None` disables the
    /// fallback entirely (useful in tests).
    pub resolv_conf: Option<PathBuf>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            ipv6: true,
            query_timeout_ms: 30_000,
            retransmit_ms: 5_000,
            res_defnames: false,
            ndots: 1,
            packet_max: 0,
            v4_first: true,
            search: Vec::new(),
            vc_connect_timeout_ms: 30_000,
            resolv_conf: Some(PathBuf::from("/etc/resolv.conf")),
        }
    }
}

impl DnsConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
    pub fn retransmit(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }
    pub fn vc_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.vc_connect_timeout_ms)
    }
}

/// Thresholds deciding whether a half-transferred object keeps downloading
/// after its last reader detaches. Sizes are in KB; a negative `min_kb`
/// disables early aborts entirely.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QuickAbort {
    pub min_kb: i64,
    pub max_kb: i64,
    pub pct: i64,
}

impl Default for QuickAbort {
    fn default() -> Self {
        Self {
            min_kb: 16,
            max_kb: 16,
            pct: 95,
        }
    }
}
