use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// Top-level proxy settings, loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<UpstreamSettings>,
    #[serde(default)]
    pub fallbacks: Vec<UpstreamSettings>,
    /// Domains resolved through fallbacks even when regular upstreams are healthy.
    #[serde(default = "default_fallback_domains")]
    pub fallback_domains: Vec<String>,
    #[serde(default)]
    pub dns64: Option<Dns64Settings>,
    #[serde(default = "default_blocked_response_ttl")]
    pub blocked_response_ttl_secs: u32,
    #[serde(default)]
    pub filter_params: FilterParams,
    #[serde(default)]
    pub listeners: Vec<ListenerSettings>,
    #[serde(default)]
    pub outbound_proxy: Option<OutboundProxySettings>,
    #[serde(default)]
    pub block_ipv6: bool,
    #[serde(default = "default_true")]
    pub ipv6_available: bool,
    #[serde(default = "default_adblock_blocking_mode")]
    pub adblock_rules_blocking_mode: BlockingMode,
    #[serde(default = "default_hosts_blocking_mode")]
    pub hosts_rules_blocking_mode: BlockingMode,
    #[serde(default)]
    pub custom_blocking_ipv4: Option<String>,
    #[serde(default)]
    pub custom_blocking_ipv6: Option<String>,
    #[serde(default = "default_dns_cache_size")]
    pub dns_cache_size: u64,
    #[serde(default = "default_true")]
    pub optimistic_cache: bool,
    #[serde(default)]
    pub enable_dnssec_ok: bool,
    #[serde(default)]
    pub enable_retransmission_handling: bool,
    #[serde(default)]
    pub block_ech: bool,
    #[serde(default)]
    pub enable_parallel_upstream_queries: bool,
    #[serde(default)]
    pub enable_fallback_on_upstreams_failure: bool,
    #[serde(default = "default_true")]
    pub enable_servfail_on_upstreams_failure: bool,
    #[serde(default)]
    pub enable_http3: bool,
    /// Per-exchange deadline in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings deserialize")
    }
}

impl ProxySettings {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// The address returned for ADDRESS-mode A blocks. All-zeroes unless overridden.
    pub fn blocking_ipv4(&self) -> Ipv4Addr {
        self.custom_blocking_ipv4
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// The address returned for ADDRESS-mode AAAA blocks.
    pub fn blocking_ipv6(&self) -> Ipv6Addr {
        self.custom_blocking_ipv6
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Address descriptor: "8.8.8.8:53", "8.8.8.8" or "tcp://9.9.9.9:53".
    pub address: String,
    pub id: i32,
    /// Dial directly even when an outbound proxy is configured.
    #[serde(default)]
    pub ignore_outbound_proxy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dns64Settings {
    pub upstreams: Vec<UpstreamSettings>,
    #[serde(default = "default_dns64_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_dns64_wait_time_ms")]
    pub wait_time_ms: u64,
}

impl Dns64Settings {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterParams {
    #[serde(default)]
    pub filters: Vec<FilterListSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterListSettings {
    pub id: i32,
    /// Path to a rule list file. Mutually exclusive with `rules`.
    #[serde(default)]
    pub path: Option<String>,
    /// In-memory rule text, one rule per line.
    #[serde(default)]
    pub rules: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    /// "0.0.0.0:5353" style bind address, served over both UDP and TCP.
    pub address: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    Refused,
    Nxdomain,
    Address,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundProxyProtocol {
    HttpConnect,
    HttpsConnect,
    Socks4,
    Socks5,
    Socks5Udp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundProxySettings {
    pub protocol: OutboundProxyProtocol,
    pub address: String,
    pub port: u16,
    /// Addresses of resolvers used to bootstrap a non-literal proxy address.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default)]
    pub auth: Option<OutboundProxyAuth>,
    #[serde(default)]
    pub trust_any_certificate: bool,
    /// Fall back to direct connections if the proxy is unreachable.
    #[serde(default)]
    pub ignore_if_unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundProxyAuth {
    pub username: String,
    pub password: String,
}

pub fn load_settings(path: &Path) -> Result<ProxySettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: ProxySettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;

    // Early validation: catch unparsable addresses before listeners come up.
    for us in settings.upstreams.iter().chain(settings.fallbacks.iter()) {
        crate::upstream::parse_address_descriptor(&us.address)
            .with_context(|| format!("upstream address: {}", us.address))?;
    }
    if let Some(ip) = settings.custom_blocking_ipv4.as_deref() {
        let _parsed: Ipv4Addr = ip.parse().with_context(|| format!("custom_blocking_ipv4: {ip}"))?;
    }
    if let Some(ip) = settings.custom_blocking_ipv6.as_deref() {
        let _parsed: Ipv6Addr = ip.parse().with_context(|| format!("custom_blocking_ipv6: {ip}"))?;
    }
    if let Some(proxy) = settings.outbound_proxy.as_ref() {
        if proxy.bootstrap.is_empty() {
            let _parsed: IpAddr = proxy
                .address
                .parse()
                .with_context(|| format!("outbound proxy address: {}", proxy.address))?;
        }
    }

    info!(target = "config", upstreams = settings.upstreams.len(), "settings loaded");
    Ok(settings)
}

fn default_true() -> bool {
    true
}

fn default_upstreams() -> Vec<UpstreamSettings> {
    vec![
        UpstreamSettings {
            address: "8.8.8.8:53".to_string(),
            id: 1,
            ignore_outbound_proxy: false,
        },
        UpstreamSettings {
            address: "8.8.4.4:53".to_string(),
            id: 2,
            ignore_outbound_proxy: false,
        },
    ]
}

// Hosts that must keep resolving through fallbacks: local names, Wi-Fi
// calling ePDGs, router admin hosts.
fn default_fallback_domains() -> Vec<String> {
    [
        "*.local",
        "*.lan",
        "epdg.epc.aptg.com.tw",
        "epdg.epc.att.net",
        "epdg.mobileone.net.sg",
        "primgw.vowifina.spcsdns.net",
        "swu-loopback-epdg.qualcomm.com",
        "vowifi.jio.com",
        "weconnect.globe.com.ph",
        "wlan.three.com.hk",
        "wo.vzwwo.com",
        "epdg.epc.*.pub.3gppnetwork.org",
        "ss.epdg.epc.*.pub.3gppnetwork.org",
        "dengon.docomo.ne.jp",
        "dlinkap",
        "dlinkrouter",
        "edimax.setup",
        "fritz.box",
        "gateway.2wire.net",
        "miwifi.com",
        "my.firewall",
        "my.keenetic.net",
        "netis.cc",
        "pocket.wifi",
        "router.asus.com",
        "repeater.asus.com",
        "routerlogin.com",
        "routerlogin.net",
        "tendawifi.com",
        "tendawifi.net",
        "tplinklogin.net",
        "tplinkwifi.net",
        "tplinkrepeater.net",
        "oppowifi.com",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_blocked_response_ttl() -> u32 {
    3600
}

fn default_adblock_blocking_mode() -> BlockingMode {
    BlockingMode::Refused
}

fn default_hosts_blocking_mode() -> BlockingMode {
    BlockingMode::Address
}

fn default_dns_cache_size() -> u64 {
    1000
}

fn default_dns64_max_tries() -> u32 {
    5
}

fn default_dns64_wait_time_ms() -> u64 {
    1000
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_cover_every_field() {
        let settings = ProxySettings::default();
        assert_eq!(settings.upstreams.len(), 2);
        assert_eq!(settings.upstreams[0].id, 1);
        assert_eq!(settings.blocked_response_ttl_secs, 3600);
        assert_eq!(settings.adblock_rules_blocking_mode, BlockingMode::Refused);
        assert_eq!(settings.hosts_rules_blocking_mode, BlockingMode::Address);
        assert!(settings.optimistic_cache);
        assert!(settings.enable_servfail_on_upstreams_failure);
        assert!(!settings.enable_parallel_upstream_queries);
        assert!(settings.fallback_domains.iter().any(|d| d == "*.local"));
    }

    #[test]
    fn blocking_mode_parses_snake_case() {
        let raw = json!({
            "adblock_rules_blocking_mode": "nxdomain",
            "hosts_rules_blocking_mode": "address"
        });
        let settings: ProxySettings = serde_json::from_value(raw).expect("parse");
        assert_eq!(settings.adblock_rules_blocking_mode, BlockingMode::Nxdomain);
        assert_eq!(settings.hosts_rules_blocking_mode, BlockingMode::Address);
    }

    #[test]
    fn outbound_proxy_parses() {
        let raw = json!({
            "outbound_proxy": {
                "protocol": "socks5_udp",
                "address": "127.0.0.1",
                "port": 1080,
                "auth": { "username": "u", "password": "p" }
            }
        });
        let settings: ProxySettings = serde_json::from_value(raw).expect("parse");
        let proxy = settings.outbound_proxy.expect("proxy");
        assert_eq!(proxy.protocol, OutboundProxyProtocol::Socks5Udp);
        assert_eq!(proxy.port, 1080);
        assert!(proxy.auth.is_some());
    }

    #[test]
    fn custom_blocking_addresses_fall_back_to_unspecified() {
        let settings = ProxySettings::default();
        assert_eq!(settings.blocking_ipv4(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(settings.blocking_ipv6(), Ipv6Addr::UNSPECIFIED);
    }
}
