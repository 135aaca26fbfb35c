//! Proxy configuration translation
//!
//! The proxy core consumes a JSON configuration with `inbounds`, `outbounds`
//! and optional `dns`, `routing`, `policy` and `stats` sections. This module
//! reads what the session needs out of it (local ports, the remote endpoint,
//! DNS servers) and, when statistics are requested, rewrites the policy and
//! stats sections so the core exposes per-outbound traffic counters.

use std::net::{IpAddr, Ipv4Addr};

use flux_route::BypassPolicy;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Policy level the instrumentation block is attached to
const STATS_POLICY_LEVEL: &str = "8";

/// Remote proxy server extracted from the first outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Hostname or IP literal
    pub address: String,
    /// Server port, if the outbound states a valid one
    pub port: Option<u16>,
}

impl ProxyEndpoint {
    /// The address as an IPv4 literal, if it is one
    ///
    /// Hostnames are not resolved.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Normalized, immutable configuration for one session
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    remark: String,
    raw_config: String,
    local_socks_port: u16,
    local_http_port: Option<u16>,
    proxy_endpoint: Option<ProxyEndpoint>,
    stats_enabled: bool,
    blocked_apps: Vec<String>,
    bypass_policy: BypassPolicy,
    dns_servers: Vec<IpAddr>,
}

impl ProxyConfig {
    /// Session name shown by the host
    pub fn remark(&self) -> &str {
        &self.remark
    }

    /// Configuration handed to the engine (instrumented if stats are enabled)
    pub fn raw_config(&self) -> &str {
        &self.raw_config
    }

    /// Port of the local SOCKS inbound
    pub fn local_socks_port(&self) -> u16 {
        self.local_socks_port
    }

    /// Port of the local HTTP inbound, if any
    pub fn local_http_port(&self) -> Option<u16> {
        self.local_http_port
    }

    /// Remote proxy server, if it could be extracted
    pub fn proxy_endpoint(&self) -> Option<&ProxyEndpoint> {
        self.proxy_endpoint.as_ref()
    }

    /// Proxy server address usable for route exclusion
    pub fn proxy_server_ipv4(&self) -> Option<Ipv4Addr> {
        self.proxy_endpoint.as_ref().and_then(ProxyEndpoint::ipv4)
    }

    /// Whether the engine config carries traffic counters
    pub fn stats_enabled(&self) -> bool {
        self.stats_enabled
    }

    /// Applications kept out of the tunnel
    pub fn blocked_apps(&self) -> &[String] {
        &self.blocked_apps
    }

    /// Which traffic enters the tunnel
    pub fn bypass_policy(&self) -> &BypassPolicy {
        &self.bypass_policy
    }

    /// DNS servers listed in the config's `dns.servers` section
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }
}

/// Validates and normalizes caller-supplied proxy configurations
#[derive(Debug, Clone)]
pub struct ConfigTranslator {
    stats_enabled: bool,
}

impl Default for ConfigTranslator {
    fn default() -> Self {
        Self { stats_enabled: true }
    }
}

impl ConfigTranslator {
    /// Create a translator
    pub fn new(stats_enabled: bool) -> Self {
        Self { stats_enabled }
    }

    /// Translate a raw proxy configuration into a [`ProxyConfig`]
    ///
    /// Fails with [`Error::ConfigParse`] if the input is not a JSON object and
    /// with [`Error::MissingInboundPort`] if no SOCKS inbound is declared. A
    /// missing or unrecognized outbound is not fatal: the endpoint is left
    /// empty and route self-exclusion is skipped.
    pub fn translate<S: AsRef<str>>(
        &self,
        remark: &str,
        raw_config: &str,
        blocked_apps: &[S],
        bypass_subnets: &[S],
    ) -> Result<ProxyConfig> {
        let mut root = parse_object(raw_config)?;

        let (local_socks_port, local_http_port) = inbound_ports(&root)?;

        let proxy_endpoint = first_outbound_endpoint(&root);
        match &proxy_endpoint {
            Some(endpoint) => log::debug!("Proxy endpoint: {}", endpoint),
            None => log::warn!("Can't parse server address and port from the first outbound"),
        }

        let dns_servers = dns_servers(&root);

        let raw_config = if self.stats_enabled {
            instrument_stats(&mut root);
            serde_json::to_string(&Value::Object(root))
                .map_err(|e| Error::ConfigParse(format!("failed to serialize config: {}", e)))?
        } else {
            raw_config.to_string()
        };

        Ok(ProxyConfig {
            remark: remark.to_string(),
            raw_config,
            local_socks_port,
            local_http_port,
            proxy_endpoint,
            stats_enabled: self.stats_enabled,
            blocked_apps: blocked_apps.iter().map(|s| s.as_ref().to_string()).collect(),
            bypass_policy: BypassPolicy::from_subnets(bypass_subnets),
            dns_servers,
        })
    }
}

/// Remove `routing.rules` so an outbound can be measured directly
///
/// The rest of the `routing` section is kept. Input that is not a JSON object
/// is returned unchanged.
pub fn strip_routing_rules(raw_config: &str) -> String {
    let Ok(mut root) = parse_object(raw_config) else {
        log::debug!("Config is not a JSON object, probing it unchanged");
        return raw_config.to_string();
    };

    if let Some(Value::Object(routing)) = root.get_mut("routing") {
        routing.remove("rules");
    }

    serde_json::to_string(&Value::Object(root)).unwrap_or_else(|_| raw_config.to_string())
}

fn parse_object(raw_config: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw_config).map_err(|e| Error::ConfigParse(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::ConfigParse(format!(
            "expected a JSON object at the top level, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Read a port that may be a JSON number or a numeric string
fn port_value(value: Option<&Value>) -> Option<u16> {
    let port = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u16::try_from(port).ok().filter(|p| *p != 0)
}

fn inbound_ports(root: &Map<String, Value>) -> Result<(u16, Option<u16>)> {
    let inbounds = root
        .get("inbounds")
        .and_then(Value::as_array)
        .ok_or(Error::MissingInboundPort)?;

    let mut socks = None;
    let mut http = None;

    for inbound in inbounds {
        let port = port_value(inbound.get("port"));
        match inbound.get("protocol").and_then(Value::as_str) {
            Some("socks") if socks.is_none() => socks = port,
            Some("http") if http.is_none() => http = port,
            _ => {}
        }
    }

    let socks = socks.ok_or(Error::MissingInboundPort)?;
    Ok((socks, http))
}

fn first_outbound_endpoint(root: &Map<String, Value>) -> Option<ProxyEndpoint> {
    let settings = root
        .get("outbounds")?
        .as_array()?
        .first()?
        .get("settings")?;

    // vmess/vless list servers under "vnext"; shadowsocks, socks and trojan
    // under "servers"
    let server = ["vnext", "servers"]
        .iter()
        .find_map(|key| settings.get(*key)?.as_array()?.first())?;

    let address = server.get("address")?.as_str()?.trim();
    if address.is_empty() {
        return None;
    }

    // The address alone is enough to keep the server out of the tunnel
    let port = port_value(server.get("port"));
    if port.is_none() {
        log::debug!("Outbound server {} has no usable port", address);
    }

    Some(ProxyEndpoint {
        address: address.to_string(),
        port,
    })
}

fn dns_servers(root: &Map<String, Value>) -> Vec<IpAddr> {
    let Some(servers) = root
        .get("dns")
        .and_then(|dns| dns.get("servers"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    servers
        .iter()
        .filter_map(|entry| {
            let address = match entry {
                Value::String(s) => s.as_str(),
                Value::Object(obj) => obj.get("address")?.as_str()?,
                _ => return None,
            };
            match address.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    log::debug!("Skipping non-IP DNS server '{}'", address);
                    None
                }
            }
        })
        .collect()
}

/// Replace `policy` and `stats` with the traffic-counter instrumentation block
fn instrument_stats(root: &mut Map<String, Value>) {
    root.remove("policy");
    root.remove("stats");

    let mut levels = Map::new();
    levels.insert(
        STATS_POLICY_LEVEL.to_string(),
        json!({
            "connIdle": 300,
            "downlinkOnly": 1,
            "handshake": 4,
            "uplinkOnly": 1
        }),
    );

    root.insert(
        "policy".to_string(),
        json!({
            "levels": Value::Object(levels),
            "system": {
                "statsOutboundUplink": true,
                "statsOutboundDownlink": true
            }
        }),
    );
    root.insert("stats".to_string(), json!({}));
}
