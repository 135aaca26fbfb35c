//! FluxTun Engine
//!
//! This crate orchestrates a single local proxy tunnel session: it turns a
//! proxy configuration into a running session, decides which traffic enters
//! the tunnel, and reports live throughput to callers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   fluxtun-cli   │              │  Mobile host / FFI  │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   fluxtun-engine                       │ │
//! │  │  - SessionController (command queue, state machine)    │ │
//! │  │  - ConfigTranslator (proxy JSON normalization)         │ │
//! │  │  - StatsAggregator (per-second traffic accounting)     │ │
//! │  │  - Events (state changes, stats snapshots)             │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ┌─────────────────┐    ┌─────────────────────────────┐     │
//! │  │   flux-route    │    │  TunnelEngine / TunProvider │     │
//! │  │  - Punch-hole   │    │  (external proxy core and   │     │
//! │  │  - Bypass list  │    │   SOCKS-to-TUN forwarder)   │     │
//! │  └─────────────────┘    └─────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod process;
pub mod proxy;
pub mod session;
pub mod stats;
pub mod tunnel;

pub use config::Settings;
pub use control::{
    ControlClient, ControlRequest, ControlResponse, ControlServer, StatusInfo, DEFAULT_SOCKET_PATH,
};
pub use error::{Error, Result};
pub use event::{EventHandler, LoggingEventHandler, SessionEvent, SessionState, StatsSnapshot};
pub use process::{InheritedFdProvider, NoTunProvider, ProcessEngine};
pub use proxy::{ConfigTranslator, ProxyConfig, ProxyEndpoint};
pub use session::{
    ConnectionMode, SessionBuilder, SessionController, SessionOptions, StartRequest, DELAY_UNAVAILABLE,
};
pub use stats::{
    format_bytes, format_speed, CounterMode, DurationCounter, StatsAggregator, HEALTH_WARNING_THRESHOLD,
};
pub use tunnel::{
    Direction, EngineNotifier, TunInterface, TunProvider, TunSettings, TunnelEngine, TunnelHandle,
    NO_TUN_FD,
};

/// URL requested by delay measurement when the caller does not supply one
pub const DEFAULT_DELAY_URL: &str = "https://www.gstatic.com/generate_204";
