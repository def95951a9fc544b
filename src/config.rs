//! Configuration types for routebeacon.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Admin API configuration.
    pub api: ApiConfig,

    /// BGP announcement configuration.
    #[serde(default)]
    pub bgp: BgpConfig,

    /// Resolver configuration.
    pub dns: DnsConfig,

    /// Bootstrap domain list configuration.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Grace period for in-flight work on shutdown, in seconds.
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Config {
    /// Shutdown window as a [`Duration`].
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

/// Admin API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address for the admin HTTP server to listen on.
    pub address: SocketAddr,
}

/// BGP announcement configuration.
///
/// `clients` lists the peers the session layer keeps established; a closed
/// session for one of them is reconnected after `reconnect_backoff_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpConfig {
    /// Whether route announcement is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen network for the session layer, e.g. "tcp".
    #[serde(default = "default_network")]
    pub network: String,

    /// Address for the BGP session layer to listen on.
    #[serde(default = "default_bgp_address")]
    pub address: SocketAddr,

    /// Router ID used by the session layer, also the NEXT_HOP fallback.
    #[serde(default = "default_router_id")]
    pub router_id: Ipv4Addr,

    /// Local autonomous system number.
    #[serde(default = "default_asn")]
    pub local_as: u32,

    /// Remote autonomous system number.
    #[serde(default = "default_asn")]
    pub remote_as: u32,

    /// LOCAL_PREF attached to every announced route.
    #[serde(default = "default_local_pref")]
    pub local_pref: u32,

    /// ORIGIN attribute: "igp", "egp" or "incomplete".
    #[serde(default = "default_origin")]
    pub origin: String,

    /// NEXT_HOP for announced routes; `router_id` when unset.
    #[serde(default)]
    pub next_hop: Option<Ipv4Addr>,

    /// Peers to keep established.
    #[serde(default)]
    pub clients: Vec<Ipv4Addr>,

    /// Delay between session establishment and the first write, in
    /// milliseconds. Capped at one second.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Backoff before asking the session layer to re-establish a configured
    /// peer that closed, in seconds.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

impl BgpConfig {
    /// Settle delay as a [`Duration`], capped at one second.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms.min(1_000))
    }

    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl Default for BgpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            network: default_network(),
            address: default_bgp_address(),
            router_id: default_router_id(),
            local_as: default_asn(),
            remote_as: default_asn(),
            local_pref: default_local_pref(),
            origin: default_origin(),
            next_hop: None,
            clients: Vec::new(),
            settle_delay_ms: default_settle_delay_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Upstream DNS servers, e.g. `1.1.1.1:53`. Every expired domain is asked
    /// on every server each tick.
    pub servers: Vec<SocketAddr>,

    /// Seconds between refresh ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Wall-clock budget for one tick's queries, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum in-flight queries per tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl DnsConfig {
    /// Tick interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-tick query deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where the initial domain list comes from.
///
/// A non-empty `list` wins; otherwise `link` is fetched over HTTP and split
/// on newlines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// URL serving a newline-separated domain list.
    #[serde(default)]
    pub link: Option<String>,

    /// Static domain list.
    #[serde(default)]
    pub list: Vec<String>,

    /// Fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl BootstrapConfig {
    /// Fetch timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "debug", "routebeacon=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_bgp_address() -> SocketAddr {
    "0.0.0.0:179".parse().expect("static default")
}

fn default_router_id() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_asn() -> u32 {
    65001
}

fn default_local_pref() -> u32 {
    100
}

fn default_origin() -> String {
    "egp".to_string()
}

fn default_settle_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_backoff_secs() -> u64 {
    1
}

fn default_interval_secs() -> u64 {
    15
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_concurrency() -> usize {
    32
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_shutdown_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "api": {"address": "127.0.0.1:8080"},
                "dns": {"servers": ["1.1.1.1:53"]}
            }"#,
        )
        .unwrap();

        assert!(cfg.bgp.enabled);
        assert_eq!(cfg.bgp.local_as, 65001);
        assert_eq!(cfg.bgp.origin, "egp");
        assert_eq!(cfg.dns.interval(), Duration::from_secs(15));
        assert_eq!(cfg.shutdown(), Duration::from_secs(5));
        assert!(cfg.bootstrap.list.is_empty());
    }

    #[test]
    fn settle_delay_is_capped() {
        let bgp = BgpConfig {
            settle_delay_ms: 30_000,
            ..BgpConfig::default()
        };
        assert_eq!(bgp.settle_delay(), Duration::from_secs(1));
    }
}
