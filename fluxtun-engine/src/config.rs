//! Daemon settings
//!
//! Proxy configurations are JSON documents supplied per session. The settings
//! here configure the daemon that runs those sessions: where its control
//! socket lives, how sessions are sampled, how the tunnel interface looks,
//! and which external programs make up the engine.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{ConnectionMode, SessionOptions};
use crate::stats::{CounterMode, DEFAULT_TRAFFIC_CLASSES};

/// Placeholder replaced by the path of the written proxy config
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Placeholder replaced by the tunnel descriptor
pub const FD_PLACEHOLDER: &str = "{fd}";

/// Daemon settings
///
/// # Example Settings
///
/// ```toml
/// [common]
/// log_level = "info"
/// control_socket = "/run/fluxtun.sock"
///
/// [session]
/// mode = "vpn_tun"
/// stats_enabled = true
///
/// [engine]
/// core = ["xray", "run", "-c", "{config}"]
/// tun2socks = ["hev-socks5-tunnel", "{config}", "{fd}"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Shared daemon settings
    #[serde(default)]
    pub common: CommonSettings,

    /// Session behavior
    #[serde(default)]
    pub session: SessionSettings,

    /// Tunnel interface parameters
    #[serde(default)]
    pub tun: TunSection,

    /// External engine programs
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.session.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }

        if self.session.delay_timeout_secs == 0 {
            return Err(Error::Config("delay_timeout_secs must be positive".into()));
        }

        if self.session.traffic_classes.is_empty() {
            return Err(Error::Config("at least one traffic class is required".into()));
        }

        url::Url::parse(&self.session.delay_url).map_err(|e| {
            Error::Config(format!("invalid delay_url '{}': {}", self.session.delay_url, e))
        })?;

        if self.tun.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.tun.mtu
            )));
        }

        let max_prefix = if self.tun.address.is_ipv4() { 32 } else { 128 };
        if self.tun.prefix_len > max_prefix {
            return Err(Error::Config(format!(
                "prefix length /{} is invalid for {}",
                self.tun.prefix_len, self.tun.address
            )));
        }

        self.engine.validate()
    }

    /// Session controller options derived from these settings
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mode: self.session.mode,
            stats_enabled: self.session.stats_enabled,
            tick_interval: Duration::from_millis(self.session.tick_interval_ms),
            delay_timeout: Duration::from_secs(self.session.delay_timeout_secs),
            engine_start_timeout: Duration::from_secs(self.engine.start_timeout_secs),
            counter_mode: self.session.counter_mode,
            traffic_classes: self.session.traffic_classes.clone(),
            mtu: self.tun.mtu,
            tun_address: self.tun.address,
            tun_prefix_len: self.tun.prefix_len,
            fallback_dns: self.tun.fallback_dns.clone(),
            ..SessionOptions::default()
        }
    }

    /// Control socket path, falling back to the default
    pub fn control_socket_path(&self) -> PathBuf {
        PathBuf::from(
            self.common
                .control_socket
                .as_deref()
                .unwrap_or(crate::control::DEFAULT_SOCKET_PATH),
        )
    }

    /// Generate sample settings
    pub fn sample() -> String {
        r#"# FluxTun daemon settings

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Control socket used by `fluxtun start/stop/status/delay`
# control_socket = "/var/run/fluxtun.sock"

[session]
# "vpn_tun" captures traffic through a tunnel interface,
# "proxy_only" only runs the proxy core
mode = "vpn_tun"

# Instrument proxy configs with traffic counters
stats_enabled = true

# Stats sampling period in milliseconds
tick_interval_ms = 1000

# Upper bound for a delay measurement
delay_timeout_secs = 15

# URL requested by delay measurements
delay_url = "https://www.gstatic.com/generate_204"

# "delta" if the core resets counters on read, "cumulative" otherwise
counter_mode = "delta"

# Outbound tags summed into the session totals
traffic_classes = ["block", "proxy"]

[tun]
mtu = 1500
address = "10.1.0.2"
prefix_len = 24

# Used when the proxy config has no dns.servers section
fallback_dns = ["8.8.8.8", "8.8.4.4"]

[engine]
# Proxy core; {config} is replaced by the path of the session config
core = ["xray", "run", "-c", "{config}"]

# SOCKS-to-TUN forwarder; {config} is its generated YAML, {fd} the tunnel fd
tun2socks = ["hev-socks5-tunnel", "{config}", "{fd}"]

# Where session configs are written
runtime_dir = "/tmp/fluxtun"

# Seconds to wait for the engine to come up
start_timeout_secs = 30
"#
        .to_string()
    }
}

/// Shared daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSettings {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Control socket path
    #[serde(default)]
    pub control_socket: Option<String>,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            control_socket: None,
        }
    }
}

/// Session behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub mode: ConnectionMode,

    #[serde(default = "default_true")]
    pub stats_enabled: bool,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_delay_timeout_secs")]
    pub delay_timeout_secs: u64,

    #[serde(default = "default_delay_url")]
    pub delay_url: String,

    #[serde(default)]
    pub counter_mode: CounterMode,

    #[serde(default = "default_traffic_classes")]
    pub traffic_classes: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            stats_enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            delay_timeout_secs: default_delay_timeout_secs(),
            delay_url: default_delay_url(),
            counter_mode: CounterMode::default(),
            traffic_classes: default_traffic_classes(),
        }
    }
}

/// Tunnel interface parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSection {
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_tun_address")]
    pub address: IpAddr,

    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: Vec<IpAddr>,
}

impl Default for TunSection {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            address: default_tun_address(),
            prefix_len: default_prefix_len(),
            fallback_dns: default_fallback_dns(),
        }
    }
}

/// External engine programs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Proxy core command line; must contain `{config}`
    #[serde(default = "default_core_command")]
    pub core: Vec<String>,

    /// SOCKS-to-TUN forwarder command line, if tunnel mode is used
    #[serde(default)]
    pub tun2socks: Option<Vec<String>>,

    /// Directory for generated config files
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Seconds to wait for the engine to come up
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            core: default_core_command(),
            tun2socks: None,
            runtime_dir: default_runtime_dir(),
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl EngineSettings {
    /// Validate the command templates
    pub fn validate(&self) -> Result<()> {
        if self.core.is_empty() {
            return Err(Error::Config("engine.core command is empty".into()));
        }
        if !self.core.iter().any(|arg| arg.contains(CONFIG_PLACEHOLDER)) {
            return Err(Error::Config(format!(
                "engine.core must reference {}",
                CONFIG_PLACEHOLDER
            )));
        }

        if let Some(ref tun2socks) = self.tun2socks {
            if tun2socks.is_empty() {
                return Err(Error::Config("engine.tun2socks command is empty".into()));
            }
            if !tun2socks.iter().any(|arg| arg.contains(FD_PLACEHOLDER)) {
                return Err(Error::Config(format!(
                    "engine.tun2socks must reference {}",
                    FD_PLACEHOLDER
                )));
            }
        }

        if self.start_timeout_secs == 0 {
            return Err(Error::Config("start_timeout_secs must be positive".into()));
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_delay_timeout_secs() -> u64 {
    15
}

fn default_delay_url() -> String {
    crate::DEFAULT_DELAY_URL.to_string()
}

fn default_traffic_classes() -> Vec<String> {
    DEFAULT_TRAFFIC_CLASSES.iter().map(|s| s.to_string()).collect()
}

fn default_mtu() -> u16 {
    1500
}

fn default_tun_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2))
}

fn default_prefix_len() -> u8 {
    24
}

fn default_fallback_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
    ]
}

fn default_core_command() -> Vec<String> {
    ["xray", "run", "-c", CONFIG_PLACEHOLDER]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("fluxtun")
}

fn default_start_timeout_secs() -> u64 {
    30
}
