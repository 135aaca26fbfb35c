//! Mock engine and tunnel provider for testing
//!
//! [`MockTunnelEngine`] records every call it receives and lets tests script
//! start failures, stop failures, traffic counters and delay results.
//! [`MockTunProvider`] hands out fake descriptors and counts how many were
//! closed, so tests can check that every tunnel handle is released exactly
//! once.
//!
//! # Example
//!
//! ```ignore
//! use fluxtun_engine::tunnel::mock::MockTunnelEngine;
//! use fluxtun_engine::Direction;
//!
//! let engine = MockTunnelEngine::new();
//! engine.set_counter("proxy", Direction::Downlink, 4096);
//! engine.fail_start("core refused config");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use flux_route::RouteSet;

use super::{Direction, EngineNotifier, TunInterface, TunProvider, TunSettings, TunnelEngine, TunnelHandle};
use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;

/// A call received by [`MockTunnelEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start {
        remark: String,
        tun_fd: i32,
        routes: RouteSet,
        stats_enabled: bool,
    },
    Stop,
    QueryStats {
        class: String,
        direction: Direction,
    },
    MeasureDelay {
        url: String,
    },
    MeasureOutboundDelay {
        config: String,
        url: String,
    },
}

#[derive(Debug, Clone)]
enum StartBehavior {
    Accept,
    Decline,
    Fail(String),
}

#[derive(Debug, Clone)]
enum DelayBehavior {
    Value(i64),
    Fail,
    Hang,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<EngineCall>,
    start: StartBehavior,
    fail_stop: bool,
    counters: HashMap<(String, Direction), i64>,
    fail_stats: bool,
    failing_classes: HashSet<String>,
    delay: DelayBehavior,
    outbound_delay: Option<i64>,
    notifiers: Vec<EngineNotifier>,
}

/// Scriptable [`TunnelEngine`] that records its calls
#[derive(Debug)]
pub struct MockTunnelEngine {
    state: Mutex<MockState>,
    running: AtomicBool,
}

impl Default for MockTunnelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTunnelEngine {
    /// Engine that accepts every start and reports zero traffic
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                start: StartBehavior::Accept,
                fail_stop: false,
                counters: HashMap::new(),
                fail_stats: false,
                failing_classes: HashSet::new(),
                delay: DelayBehavior::Value(0),
                outbound_delay: None,
                notifiers: Vec::new(),
            }),
            running: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded calls
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `start` return `Ok(false)` until reset
    pub fn decline_start(&self) {
        self.state().start = StartBehavior::Decline;
    }

    /// Make `start` return an error until reset
    pub fn fail_start(&self, message: impl Into<String>) {
        self.state().start = StartBehavior::Fail(message.into());
    }

    /// Accept starts again
    pub fn accept_start(&self) {
        self.state().start = StartBehavior::Accept;
    }

    /// Make `stop` return an error
    pub fn set_fail_stop(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    /// Value returned for a counter
    pub fn set_counter(&self, class: &str, direction: Direction, value: i64) {
        self.state().counters.insert((class.to_string(), direction), value);
    }

    /// Make every counter query fail
    pub fn set_fail_stats(&self, fail: bool) {
        self.state().fail_stats = fail;
    }

    /// Make counter queries for one traffic class fail
    pub fn set_fail_class(&self, class: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_classes.insert(class.to_string());
        } else {
            state.failing_classes.remove(class);
        }
    }

    /// Delay returned by `measure_delay`
    pub fn set_delay(&self, millis: i64) {
        self.state().delay = DelayBehavior::Value(millis);
    }

    /// Make `measure_delay` return an error
    pub fn fail_delay(&self) {
        self.state().delay = DelayBehavior::Fail;
    }

    /// Make `measure_delay` never complete
    pub fn hang_delay(&self) {
        self.state().delay = DelayBehavior::Hang;
    }

    /// Enable `measure_outbound_delay` with a fixed result
    pub fn set_outbound_delay(&self, millis: i64) {
        self.state().outbound_delay = Some(millis);
    }

    /// Simulate the engine dying on its own
    ///
    /// Returns `false` if the engine was never started.
    pub fn trigger_exit(&self, reason: &str) -> bool {
        let notifier = self.state().notifiers.last().cloned();
        match notifier {
            Some(notifier) => {
                self.running.store(false, Ordering::SeqCst);
                notifier.engine_exited(reason);
                true
            }
            None => false,
        }
    }

    /// Notifier handed to the `index`-th `start` call
    pub fn notifier(&self, index: usize) -> Option<EngineNotifier> {
        self.state().notifiers.get(index).cloned()
    }

    /// All recorded calls, oldest first
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    /// Number of `start` calls
    pub fn start_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Start { .. }))
    }

    /// Number of `stop` calls
    pub fn stop_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Stop))
    }

    /// Number of `query_stats` calls
    pub fn stats_query_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::QueryStats { .. }))
    }

    /// Number of `measure_delay` calls
    pub fn delay_call_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::MeasureDelay { .. }))
    }

    /// The most recent `start` call
    pub fn last_start(&self) -> Option<EngineCall> {
        self.state()
            .calls
            .iter()
            .rev()
            .find(|c| matches!(c, EngineCall::Start { .. }))
            .cloned()
    }

    fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl TunnelEngine for MockTunnelEngine {
    async fn start(
        &self,
        config: &ProxyConfig,
        tun_fd: i32,
        routes: &RouteSet,
        notifier: EngineNotifier,
    ) -> Result<bool> {
        let behavior = {
            let mut state = self.state();
            state.calls.push(EngineCall::Start {
                remark: config.remark().to_string(),
                tun_fd,
                routes: routes.clone(),
                stats_enabled: config.stats_enabled(),
            });
            state.notifiers.push(notifier);
            state.start.clone()
        };

        match behavior {
            StartBehavior::Accept => {
                self.running.store(true, Ordering::SeqCst);
                Ok(true)
            }
            StartBehavior::Decline => Ok(false),
            StartBehavior::Fail(message) => Err(Error::EngineStartFailure(message)),
        }
    }

    async fn stop(&self) -> Result<()> {
        let fail = {
            let mut state = self.state();
            state.calls.push(EngineCall::Stop);
            state.fail_stop
        };
        self.running.store(false, Ordering::SeqCst);

        if fail {
            Err(Error::EngineUnreachable("mock stop failure".into()))
        } else {
            Ok(())
        }
    }

    async fn query_stats(&self, class: &str, direction: Direction) -> Result<i64> {
        let mut state = self.state();
        state.calls.push(EngineCall::QueryStats {
            class: class.to_string(),
            direction,
        });
        if state.fail_stats || state.failing_classes.contains(class) {
            return Err(Error::EngineUnreachable("mock stats failure".into()));
        }
        Ok(state
            .counters
            .get(&(class.to_string(), direction))
            .copied()
            .unwrap_or(0))
    }

    async fn measure_delay(&self, url: &str) -> Result<i64> {
        let behavior = {
            let mut state = self.state();
            state.calls.push(EngineCall::MeasureDelay {
                url: url.to_string(),
            });
            state.delay.clone()
        };

        match behavior {
            DelayBehavior::Value(millis) => Ok(millis),
            DelayBehavior::Fail => Err(Error::EngineUnreachable("mock delay failure".into())),
            DelayBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(-1)
            }
        }
    }

    async fn measure_outbound_delay(&self, config: &str, url: &str) -> Result<i64> {
        let result = {
            let mut state = self.state();
            state.calls.push(EngineCall::MeasureOutboundDelay {
                config: config.to_string(),
                url: url.to_string(),
            });
            state.outbound_delay
        };
        result.ok_or_else(|| Error::Unsupported("mock outbound delay".into()))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Fake tunnel interface that counts closes
struct MockTunInterface {
    fd: i32,
    closed: bool,
    close_count: Arc<AtomicUsize>,
}

impl TunInterface for MockTunInterface {
    fn fd(&self) -> i32 {
        self.fd
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// [`TunProvider`] that hands out fake descriptors
#[derive(Debug, Clone)]
pub struct MockTunProvider {
    next_fd: Arc<AtomicI32>,
    established: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<(TunSettings, RouteSet)>>>,
}

impl Default for MockTunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTunProvider {
    /// Create a provider; descriptors start at 100
    pub fn new() -> Self {
        Self {
            next_fd: Arc::new(AtomicI32::new(100)),
            established: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make `establish` fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of interfaces handed out
    pub fn established_count(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    /// Number of interfaces closed
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Interfaces handed out and not yet closed
    pub fn open_count(&self) -> usize {
        self.established_count() - self.closed_count()
    }

    /// Settings and routes of every `establish` call
    pub fn requests(&self) -> Vec<(TunSettings, RouteSet)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TunProvider for MockTunProvider {
    fn establish(&self, settings: &TunSettings, routes: &RouteSet) -> Result<TunnelHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mock establish failure",
            )));
        }

        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((settings.clone(), routes.clone()));
        self.established.fetch_add(1, Ordering::SeqCst);

        Ok(TunnelHandle::new(Box::new(MockTunInterface {
            fd: self.next_fd.fetch_add(1, Ordering::SeqCst),
            closed: false,
            close_count: self.closed.clone(),
        })))
    }
}
