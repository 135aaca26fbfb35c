//! Seams to the external packet-forwarding engines
//!
//! The session controller never moves packets itself. It drives a
//! [`TunnelEngine`] (the proxy core plus its SOCKS-to-TUN forwarder) and
//! obtains tunnel descriptors from a [`TunProvider`].

pub mod mock;

use std::net::IpAddr;

use async_trait::async_trait;
use flux_route::RouteSet;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;

/// Descriptor passed to the engine when no tunnel device is used
pub const NO_TUN_FD: i32 = -1;

/// Traffic direction of an engine counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    /// Counter name suffix used by the proxy core
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit report from an engine, tagged with the session it belongs to
#[derive(Debug, Clone)]
pub(crate) struct EngineExit {
    pub(crate) generation: u64,
    pub(crate) reason: String,
}

/// Channel handed to the engine so it can report an unexpected exit
#[derive(Debug, Clone)]
pub struct EngineNotifier {
    generation: u64,
    tx: Option<mpsc::UnboundedSender<EngineExit>>,
}

impl EngineNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineExit>) -> Self {
        Self {
            generation,
            tx: Some(tx),
        }
    }

    /// Notifier that goes nowhere, for engines driven outside a controller
    pub fn detached() -> Self {
        Self {
            generation: 0,
            tx: None,
        }
    }

    /// Session generation this notifier was issued for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the engine stopped on its own
    pub fn engine_exited(&self, reason: impl Into<String>) {
        let reason = reason.into();
        match &self.tx {
            Some(tx) => {
                if tx
                    .send(EngineExit {
                        generation: self.generation,
                        reason,
                    })
                    .is_err()
                {
                    log::debug!("Engine exit reported after the controller shut down");
                }
            }
            None => log::debug!("Engine exited: {}", reason),
        }
    }
}

/// Interface to the proxy core and its forwarder
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Start forwarding for `config`
    ///
    /// `tun_fd` is [`NO_TUN_FD`] in proxy-only mode. Returns `Ok(false)` if the
    /// engine declined to start.
    async fn start(
        &self,
        config: &ProxyConfig,
        tun_fd: i32,
        routes: &RouteSet,
        notifier: EngineNotifier,
    ) -> Result<bool>;

    /// Stop forwarding
    async fn stop(&self) -> Result<()>;

    /// Read a traffic counter for an outbound class
    async fn query_stats(&self, class: &str, direction: Direction) -> Result<i64>;

    /// Delay in milliseconds of a request through the running session
    async fn measure_delay(&self, url: &str) -> Result<i64>;

    /// Delay in milliseconds of a request through a config that is not running
    async fn measure_outbound_delay(&self, _config: &str, _url: &str) -> Result<i64> {
        Err(Error::Unsupported(
            "outbound delay measurement is not available for this engine".into(),
        ))
    }

    /// Check if the engine is currently running
    fn is_running(&self) -> bool;
}

/// Parameters for establishing a tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunSettings {
    /// Session name shown by the host
    pub session_name: String,
    /// Interface MTU
    pub mtu: u16,
    /// Interface address
    pub address: IpAddr,
    /// Interface prefix length
    pub prefix_len: u8,
    /// DNS servers pushed to the interface
    pub dns_servers: Vec<IpAddr>,
    /// Applications kept out of the tunnel
    pub disallowed_apps: Vec<String>,
}

/// An open tunnel interface
pub trait TunInterface: Send + Sync {
    /// Raw descriptor handed to the engine
    fn fd(&self) -> i32;

    /// Close the interface
    fn close(&mut self) -> Result<()>;
}

/// Source of tunnel interfaces
pub trait TunProvider: Send + Sync {
    /// Open a tunnel interface with the given routes installed
    fn establish(&self, settings: &TunSettings, routes: &RouteSet) -> Result<TunnelHandle>;
}

/// Owned token for the live tunnel descriptor
///
/// Released exactly once: either explicitly through [`TunnelHandle::release`]
/// or, as a fallback, on drop.
pub struct TunnelHandle {
    fd: i32,
    iface: Option<Box<dyn TunInterface>>,
}

impl TunnelHandle {
    /// Wrap an open interface
    pub fn new(iface: Box<dyn TunInterface>) -> Self {
        Self {
            fd: iface.fd(),
            iface: Some(iface),
        }
    }

    /// Handle without a tunnel device (proxy-only sessions)
    pub fn detached() -> Self {
        Self {
            fd: NO_TUN_FD,
            iface: None,
        }
    }

    /// Descriptor to pass to the engine
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Check if this handle owns a tunnel device
    pub fn has_interface(&self) -> bool {
        self.iface.is_some()
    }

    /// Close the interface
    pub fn release(mut self) -> Result<()> {
        match self.iface.take() {
            Some(mut iface) => iface.close(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("fd", &self.fd)
            .field("open", &self.iface.is_some())
            .finish()
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(mut iface) = self.iface.take() {
            log::warn!("Tunnel handle dropped without release, closing fd {}", self.fd);
            if let Err(e) = iface.close() {
                log::warn!("Failed to close tunnel interface: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTunProvider;
    use super::*;

    fn settings() -> TunSettings {
        TunSettings {
            session_name: "test".into(),
            mtu: 1500,
            address: "10.1.0.2".parse().unwrap(),
            prefix_len: 24,
            dns_servers: vec![],
            disallowed_apps: vec![],
        }
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_handle_is_shareable_across_tasks() {
        // The session actor holds handles across awaits on a spawned task
        assert_send_sync::<TunnelHandle>();
        assert_send_sync::<Box<dyn TunInterface>>();
        assert_send_sync::<crate::SessionController>();
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(Direction::Uplink.as_str(), "uplink");
        assert_eq!(Direction::Downlink.to_string(), "downlink");
    }

    #[test]
    fn test_detached_handle() {
        let handle = TunnelHandle::detached();
        assert_eq!(handle.fd(), NO_TUN_FD);
        assert!(!handle.has_interface());
        handle.release().unwrap();
    }

    #[test]
    fn test_release_closes_once() {
        let provider = MockTunProvider::new();
        let handle = provider.establish(&settings(), &RouteSet::default_v4()).unwrap();
        assert!(handle.fd() >= 0);
        handle.release().unwrap();
        assert_eq!(provider.closed_count(), 1);
    }

    #[test]
    fn test_drop_closes_unreleased() {
        let provider = MockTunProvider::new();
        {
            let _handle = provider.establish(&settings(), &RouteSet::new()).unwrap();
        }
        assert_eq!(provider.established_count(), 1);
        assert_eq!(provider.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_notifier_carries_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = EngineNotifier::new(7, tx);
        notifier.engine_exited("core crashed");

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.generation, 7);
        assert_eq!(exit.reason, "core crashed");

        // Detached notifiers just log
        EngineNotifier::detached().engine_exited("ignored");
    }
}
