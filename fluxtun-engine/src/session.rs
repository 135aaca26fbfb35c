//! Session controller
//!
//! One [`SessionController`] owns the single tunnel session of the process.
//! Start, stop and mode changes are queued to an actor task that applies them
//! one at a time, so concurrent callers never interleave a teardown with a
//! bring-up. Reads (`connection_state`, `snapshot`) and delay measurements
//! run on the caller's task against the shared session state.
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──engine ok──▶ Connected
//!        ▲                      │                        │
//!        └──────engine failed───┘◀────stop / exit────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use flux_route::RouteSet;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{
    EventHandler, EventPublisher, LoggingEventHandler, SessionEvent, SessionState, StatsSnapshot,
};
use crate::proxy::{strip_routing_rules, ConfigTranslator, ProxyConfig};
use crate::stats::{CounterMode, StatsAggregator, DEFAULT_TRAFFIC_CLASSES};
use crate::tunnel::{EngineExit, EngineNotifier, TunProvider, TunSettings, TunnelEngine, TunnelHandle};

/// Delay reported when no measurement could be taken
pub const DELAY_UNAVAILABLE: i64 = -1;

const COMMAND_QUEUE_SIZE: usize = 16;

/// How traffic reaches the proxy core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Capture device traffic through a tunnel interface
    #[default]
    VpnTun,
    /// Only run the proxy core; apps use its local inbounds directly
    ProxyOnly,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::VpnTun => write!(f, "vpn-tun"),
            ConnectionMode::ProxyOnly => write!(f, "proxy-only"),
        }
    }
}

/// Tuning for a session controller
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Initial connection mode
    pub mode: ConnectionMode,
    /// Instrument configs with traffic counters
    pub stats_enabled: bool,
    /// Stats sampling period
    pub tick_interval: Duration,
    /// Upper bound for a delay measurement
    pub delay_timeout: Duration,
    /// Upper bound for the engine to come up
    pub engine_start_timeout: Duration,
    /// How the engine reports counters
    pub counter_mode: CounterMode,
    /// Outbound classes summed into the totals
    pub traffic_classes: Vec<String>,
    /// Tunnel interface MTU
    pub mtu: u16,
    /// Tunnel interface address
    pub tun_address: IpAddr,
    /// Tunnel interface prefix length
    pub tun_prefix_len: u8,
    /// DNS servers used when the proxy config lists none
    pub fallback_dns: Vec<IpAddr>,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            stats_enabled: true,
            tick_interval: Duration::from_secs(1),
            delay_timeout: Duration::from_secs(15),
            engine_start_timeout: Duration::from_secs(30),
            counter_mode: CounterMode::default(),
            traffic_classes: DEFAULT_TRAFFIC_CLASSES.iter().map(|s| s.to_string()).collect(),
            mtu: 1500,
            tun_address: IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2)),
            tun_prefix_len: 24,
            fallback_dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            event_capacity: 256,
        }
    }
}

/// Parameters of a session start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Session name
    pub remark: String,
    /// Proxy configuration JSON
    pub raw_config: String,
    /// Applications kept out of the tunnel
    #[serde(default)]
    pub blocked_apps: Vec<String>,
    /// Subnets to route; empty routes everything except the proxy server
    #[serde(default)]
    pub bypass_subnets: Vec<String>,
}

impl StartRequest {
    pub fn new(remark: impl Into<String>, raw_config: impl Into<String>) -> Self {
        Self {
            remark: remark.into(),
            raw_config: raw_config.into(),
            ..Default::default()
        }
    }

    pub fn with_blocked_apps(mut self, apps: Vec<String>) -> Self {
        self.blocked_apps = apps;
        self
    }

    pub fn with_bypass_subnets(mut self, subnets: Vec<String>) -> Self {
        self.bypass_subnets = subnets;
        self
    }
}

/// Session state visible outside the actor
#[derive(Debug, Default)]
pub(crate) struct SharedSession {
    pub(crate) state: SessionState,
    pub(crate) snapshot: Option<StatsSnapshot>,
    pub(crate) mode: ConnectionMode,
    pub(crate) remark: Option<String>,
}

pub(crate) type SharedSessionRef = Arc<RwLock<SharedSession>>;

enum Command {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetMode {
        mode: ConnectionMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for a [`SessionController`]
pub struct SessionBuilder {
    engine: Arc<dyn TunnelEngine>,
    tun_provider: Arc<dyn TunProvider>,
    options: SessionOptions,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl SessionBuilder {
    /// Replace the default options
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Add an event handler
    ///
    /// Without any handler, events are logged through [`LoggingEventHandler`].
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Start the controller's actor task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> SessionController {
        let handlers = if self.handlers.is_empty() {
            vec![Arc::new(LoggingEventHandler) as Arc<dyn EventHandler>]
        } else {
            self.handlers
        };

        let events = EventPublisher::new(handlers, self.options.event_capacity);
        let shared = Arc::new(RwLock::new(SharedSession {
            mode: self.options.mode,
            ..Default::default()
        }));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let delay_timeout = self.options.delay_timeout;

        let actor = SessionActor {
            engine: self.engine.clone(),
            tun_provider: self.tun_provider,
            translator: ConfigTranslator::new(self.options.stats_enabled),
            options: self.options,
            shared: shared.clone(),
            events: events.clone(),
            exit_tx,
            generation: 0,
            active: None,
        };
        tokio::spawn(actor.run(command_rx, exit_rx));

        SessionController {
            commands: command_tx,
            shared,
            engine: self.engine,
            events,
            delay_timeout,
        }
    }
}

/// Handle to the single tunnel session
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    shared: SharedSessionRef,
    engine: Arc<dyn TunnelEngine>,
    events: EventPublisher,
    delay_timeout: Duration,
}

impl SessionController {
    /// Create a builder
    pub fn builder(engine: Arc<dyn TunnelEngine>, tun_provider: Arc<dyn TunProvider>) -> SessionBuilder {
        SessionBuilder {
            engine,
            tun_provider,
            options: SessionOptions::default(),
            handlers: Vec::new(),
        }
    }

    /// Spawn a controller with the given options and logging handler
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        tun_provider: Arc<dyn TunProvider>,
        options: SessionOptions,
    ) -> Self {
        Self::builder(engine, tun_provider).options(options).spawn()
    }

    /// Receive every event the controller publishes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session, replacing the active one if there is one
    ///
    /// Configuration errors are returned before any state change, so a bad
    /// config leaves a running session untouched.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { request, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop the active session
    ///
    /// Never fails: engine errors during teardown are logged and the session
    /// still ends up disconnected.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).await.is_err() || rx.await.is_err() {
            log::debug!("Stop requested after the controller shut down");
        }
    }

    /// Change the connection mode; only allowed while disconnected
    pub async fn set_connection_mode(&self, mode: ConnectionMode) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetMode { mode, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop the active session and end the actor task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Current session state
    pub async fn connection_state(&self) -> SessionState {
        self.shared.read().await.state
    }

    /// Latest statistics, `None` while disconnected
    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        self.shared.read().await.snapshot.clone()
    }

    /// Name of the active session
    pub async fn remark(&self) -> Option<String> {
        self.shared.read().await.remark.clone()
    }

    /// Current connection mode
    pub async fn connection_mode(&self) -> ConnectionMode {
        self.shared.read().await.mode
    }

    /// Delay in milliseconds through the connected session
    ///
    /// Returns [`DELAY_UNAVAILABLE`] without contacting the engine unless the
    /// session is connected, and on engine error or timeout.
    pub async fn measure_delay(&self, url: &str) -> i64 {
        let state = self.connection_state().await;
        if !state.is_connected() {
            log::debug!("Not measuring delay while {}", state);
            return DELAY_UNAVAILABLE;
        }

        Self::bounded_delay(self.delay_timeout, self.engine.measure_delay(url)).await
    }

    /// Delay in milliseconds through a config that is not running
    ///
    /// Routing rules are removed so the request goes straight through the
    /// config's first outbound. Works in any state.
    pub async fn measure_server_delay(&self, raw_config: &str, url: &str) -> i64 {
        let config = strip_routing_rules(raw_config);
        Self::bounded_delay(
            self.delay_timeout,
            self.engine.measure_outbound_delay(&config, url),
        )
        .await
    }

    async fn bounded_delay(
        limit: Duration,
        measurement: impl std::future::Future<Output = Result<i64>>,
    ) -> i64 {
        match tokio::time::timeout(limit, measurement).await {
            Ok(Ok(millis)) if millis >= 0 => millis,
            Ok(Ok(_)) => DELAY_UNAVAILABLE,
            Ok(Err(e)) => {
                log::debug!("Delay measurement failed: {}", e);
                DELAY_UNAVAILABLE
            }
            Err(_) => {
                log::debug!("Delay measurement timed out after {:?}", limit);
                DELAY_UNAVAILABLE
            }
        }
    }
}

/// Resources of the running session
struct ActiveSession {
    generation: u64,
    handle: TunnelHandle,
    ticker_shutdown: broadcast::Sender<()>,
    ticker: JoinHandle<()>,
}

struct SessionActor {
    engine: Arc<dyn TunnelEngine>,
    tun_provider: Arc<dyn TunProvider>,
    translator: ConfigTranslator,
    options: SessionOptions,
    shared: SharedSessionRef,
    events: EventPublisher,
    exit_tx: mpsc::UnboundedSender<EngineExit>,
    generation: u64,
    active: Option<ActiveSession>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut exits: mpsc::UnboundedReceiver<EngineExit>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { request, reply }) => {
                        let result = self.start(request).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Stop { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    Some(Command::SetMode { mode, reply }) => {
                        let result = self.set_mode(mode).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(exit) = exits.recv() => self.on_engine_exit(exit).await,
            }
        }

        log::debug!("Session controller stopped");
    }

    async fn start(&mut self, request: StartRequest) -> Result<()> {
        let config = self.translator.translate(
            &request.remark,
            &request.raw_config,
            &request.blocked_apps,
            &request.bypass_subnets,
        )?;

        if self.active.is_some() {
            log::info!("Replacing active session with '{}'", config.remark());
            self.stop().await;
        }

        self.generation += 1;
        let generation = self.generation;
        let mode = self.shared.read().await.mode;

        self.set_state(SessionState::Connecting, Some(config.remark().to_string()))
            .await;

        let handle = match self.bring_up(&config, mode, generation).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to start session '{}': {}", config.remark(), e);
                self.enter_disconnected().await;
                self.events
                    .emit(SessionEvent::Error {
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    })
                    .await;
                return Err(e);
            }
        };

        self.set_state(SessionState::Connected, None).await;

        let (ticker_shutdown, shutdown_rx) = broadcast::channel(1);
        let aggregator = StatsAggregator::new(
            self.options.counter_mode,
            self.options.traffic_classes.clone(),
            config.stats_enabled(),
        );
        let ticker = tokio::spawn(aggregator.run(
            self.engine.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.options.tick_interval,
            shutdown_rx,
        ));

        log::info!(
            "Session '{}' connected ({}, socks port {})",
            config.remark(),
            mode,
            config.local_socks_port()
        );

        self.active = Some(ActiveSession {
            generation,
            handle,
            ticker_shutdown,
            ticker,
        });
        Ok(())
    }

    /// Routes, tunnel interface and engine start; leaves nothing behind on error
    async fn bring_up(
        &self,
        config: &ProxyConfig,
        mode: ConnectionMode,
        generation: u64,
    ) -> Result<TunnelHandle> {
        let (routes, handle) = match mode {
            ConnectionMode::VpnTun => {
                let routes = RouteSet::for_policy(config.bypass_policy(), config.proxy_server_ipv4())?;
                log::debug!("Routing {} blocks through the tunnel", routes.len());
                let handle = self.tun_provider.establish(&self.tun_settings(config), &routes)?;
                (routes, handle)
            }
            ConnectionMode::ProxyOnly => (RouteSet::new(), TunnelHandle::detached()),
        };

        let notifier = EngineNotifier::new(generation, self.exit_tx.clone());
        let started = tokio::time::timeout(
            self.options.engine_start_timeout,
            self.engine.start(config, handle.fd(), &routes, notifier),
        )
        .await;

        let failure = match started {
            Ok(Ok(true)) => return Ok(handle),
            Ok(Ok(false)) => Error::EngineStartFailure("engine declined to start".into()),
            Ok(Err(Error::EngineStartFailure(message))) => Error::EngineStartFailure(message),
            Ok(Err(e)) => Error::EngineStartFailure(e.to_string()),
            Err(_) => Error::EngineStartFailure(format!(
                "engine did not start within {:?}",
                self.options.engine_start_timeout
            )),
        };

        if self.engine.is_running() {
            if let Err(e) = self.engine.stop().await {
                log::warn!("Failed to stop partially started engine: {}", e);
            }
        }
        if let Err(e) = handle.release() {
            log::warn!("Failed to release tunnel: {}", e);
        }
        Err(failure)
    }

    fn tun_settings(&self, config: &ProxyConfig) -> TunSettings {
        let dns_servers = if config.dns_servers().is_empty() {
            self.options.fallback_dns.clone()
        } else {
            config.dns_servers().to_vec()
        };

        TunSettings {
            session_name: config.remark().to_string(),
            mtu: self.options.mtu,
            address: self.options.tun_address,
            prefix_len: self.options.tun_prefix_len,
            dns_servers,
            disallowed_apps: config.blocked_apps().to_vec(),
        }
    }

    async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            log::debug!("No active session to stop");
            return;
        };

        // No tick may run against a stopped engine
        let _ = active.ticker_shutdown.send(());
        if let Err(e) = active.ticker.await {
            log::warn!("Stats ticker ended abnormally: {}", e);
        }

        if let Err(e) = self.engine.stop().await {
            log::warn!("Engine stop failed: {}", e);
        }
        if let Err(e) = active.handle.release() {
            log::warn!("Failed to release tunnel: {}", e);
        }

        self.enter_disconnected().await;
        log::info!("Session stopped");
    }

    async fn on_engine_exit(&mut self, exit: EngineExit) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(exit.generation) {
            log::debug!(
                "Ignoring exit of a previous engine (generation {}): {}",
                exit.generation,
                exit.reason
            );
            return;
        }

        log::warn!("Engine exited: {}", exit.reason);
        self.events
            .emit(SessionEvent::Error {
                message: format!("engine exited: {}", exit.reason),
                recoverable: false,
            })
            .await;
        self.stop().await;
    }

    async fn set_mode(&mut self, mode: ConnectionMode) -> Result<()> {
        let mut shared = self.shared.write().await;
        if shared.state != SessionState::Disconnected {
            return Err(Error::InvalidState(format!(
                "connection mode can only change while disconnected (currently {})",
                shared.state
            )));
        }
        if shared.mode != mode {
            log::info!("Connection mode: {} -> {}", shared.mode, mode);
            shared.mode = mode;
        }
        Ok(())
    }

    async fn set_state(&self, new: SessionState, remark: Option<String>) {
        let old = {
            let mut shared = self.shared.write().await;
            let old = shared.state;
            shared.state = new;
            shared.snapshot = Some(StatsSnapshot::zeroed(new));
            if remark.is_some() {
                shared.remark = remark;
            }
            old
        };

        if old != new {
            self.events.emit(SessionEvent::StateChanged { old, new }).await;
        }
    }

    /// Move to `Disconnected` and publish the terminal zeroed snapshot
    async fn enter_disconnected(&self) {
        let old = {
            let mut shared = self.shared.write().await;
            let old = shared.state;
            shared.state = SessionState::Disconnected;
            shared.snapshot = None;
            shared.remark = None;
            old
        };

        if old != SessionState::Disconnected {
            self.events
                .emit(SessionEvent::StateChanged {
                    old,
                    new: SessionState::Disconnected,
                })
                .await;
            self.events
                .emit(SessionEvent::Stats(StatsSnapshot::zeroed(
                    SessionState::Disconnected,
                )))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::mock::{MockTunProvider, MockTunnelEngine};

    const CONFIG: &str = r#"{
        "inbounds": [{"protocol": "socks", "port": 10808}],
        "outbounds": [{"protocol": "vmess", "settings": {"vnext": [{"address": "1.2.3.4", "port": 443}]}}]
    }"#;

    fn controller() -> (SessionController, Arc<MockTunnelEngine>, MockTunProvider) {
        let engine = Arc::new(MockTunnelEngine::new());
        let provider = MockTunProvider::new();
        let controller = SessionController::new(
            engine.clone(),
            Arc::new(provider.clone()),
            SessionOptions::default(),
        );
        (controller, engine, provider)
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.mtu, 1500);
        assert_eq!(options.tun_address.to_string(), "10.1.0.2");
        assert_eq!(options.tun_prefix_len, 24);
        assert_eq!(options.delay_timeout, Duration::from_secs(15));
        assert_eq!(options.traffic_classes, vec!["block", "proxy"]);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (controller, engine, provider) = controller();

        controller.start(StartRequest::new("home", CONFIG)).await.unwrap();
        assert_eq!(controller.connection_state().await, SessionState::Connected);
        assert_eq!(controller.remark().await.as_deref(), Some("home"));
        assert!(controller.snapshot().await.is_some());

        match engine.last_start() {
            Some(crate::tunnel::mock::EngineCall::Start { tun_fd, routes, .. }) => {
                assert_eq!(tun_fd, 100);
                assert_eq!(routes.len(), 32);
            }
            other => panic!("unexpected call: {:?}", other),
        }

        controller.stop().await;
        assert_eq!(controller.connection_state().await, SessionState::Disconnected);
        assert!(controller.snapshot().await.is_none());
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(provider.open_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_config_leaves_session_untouched() {
        let (controller, engine, _provider) = controller();
        controller.start(StartRequest::new("home", CONFIG)).await.unwrap();

        let err = controller
            .start(StartRequest::new("broken", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingInboundPort));
        assert_eq!(controller.connection_state().await, SessionState::Connected);
        assert_eq!(controller.remark().await.as_deref(), Some("home"));
        assert_eq!(engine.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_mode_change_requires_disconnected() {
        let (controller, engine, provider) = controller();

        controller
            .set_connection_mode(ConnectionMode::ProxyOnly)
            .await
            .unwrap();
        controller.start(StartRequest::new("proxy", CONFIG)).await.unwrap();

        match engine.last_start() {
            Some(crate::tunnel::mock::EngineCall::Start { tun_fd, routes, .. }) => {
                assert_eq!(tun_fd, crate::tunnel::NO_TUN_FD);
                assert!(routes.is_empty());
            }
            other => panic!("unexpected call: {:?}", other),
        }
        assert_eq!(provider.established_count(), 0);

        let err = controller
            .set_connection_mode(ConnectionMode::VpnTun)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        controller.stop().await;
        controller
            .set_connection_mode(ConnectionMode::VpnTun)
            .await
            .unwrap();
        assert_eq!(controller.connection_mode().await, ConnectionMode::VpnTun);
    }

    #[tokio::test]
    async fn test_fallback_dns_applied() {
        let (controller, _engine, provider) = controller();
        controller.start(StartRequest::new("home", CONFIG)).await.unwrap();

        let requests = provider.requests();
        let (settings, _) = &requests[0];
        assert_eq!(settings.session_name, "home");
        let dns: Vec<String> = settings.dns_servers.iter().map(|d| d.to_string()).collect();
        assert_eq!(dns, vec!["8.8.8.8", "8.8.4.4"]);
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let (controller, _engine, provider) = controller();
        controller.start(StartRequest::new("home", CONFIG)).await.unwrap();

        controller.shutdown().await;
        assert_eq!(provider.open_count(), 0);

        let err = controller
            .start(StartRequest::new("again", CONFIG))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
