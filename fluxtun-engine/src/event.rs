//! Session events and state

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::stats::{format_bytes, format_speed};

/// Tunnel session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session is running
    #[default]
    Disconnected,
    /// Bringing up the engine
    Connecting,
    /// Engine running and forwarding traffic
    Connected,
}

impl SessionState {
    /// Check if a session exists (connecting or connected)
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// Check if the session is fully connected
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting...",
            SessionState::Connected => "Connected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Point-in-time traffic statistics for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Seconds since the session connected
    pub elapsed_seconds: u64,
    /// Session duration as `hh:mm:ss`, wrapping at 24 hours
    pub duration: String,
    /// Bytes uploaded during the last tick
    pub upload_speed_bps: u64,
    /// Bytes downloaded during the last tick
    pub download_speed_bps: u64,
    /// Bytes uploaded since the session connected
    pub total_upload_bytes: u64,
    /// Bytes downloaded since the session connected
    pub total_download_bytes: u64,
    /// Session state when the snapshot was taken
    pub state: SessionState,
}

impl StatsSnapshot {
    /// All-zero snapshot carrying the given state
    pub fn zeroed(state: SessionState) -> Self {
        Self {
            elapsed_seconds: 0,
            duration: "00:00:00".to_string(),
            upload_speed_bps: 0,
            download_speed_bps: 0,
            total_upload_bytes: 0,
            total_download_bytes: 0,
            state,
        }
    }

    /// Check if all counters are zero
    pub fn is_zeroed(&self) -> bool {
        self.elapsed_seconds == 0
            && self.upload_speed_bps == 0
            && self.download_speed_bps == 0
            && self.total_upload_bytes == 0
            && self.total_download_bytes == 0
    }
}

/// Events emitted by the session controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// Statistics tick, or the terminal zeroed snapshot on disconnect
    Stats(StatsSnapshot),

    /// Stats sampling has failed several ticks in a row
    HealthWarning {
        /// Number of consecutive failed samples
        consecutive_failures: u32,
    },

    /// Error occurred
    Error {
        /// Error message
        message: String,
        /// Whether the session survives the error
        recoverable: bool,
    },
}

/// Event handler trait for receiving session events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a session event
    async fn on_event(&self, event: SessionEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new } => {
                log::info!("Session state: {} -> {}", old, new);
            }
            SessionEvent::Stats(snapshot) => {
                log::debug!(
                    "Stats: {} up={} ({}) down={} ({})",
                    snapshot.duration,
                    format_speed(snapshot.upload_speed_bps),
                    format_bytes(snapshot.total_upload_bytes),
                    format_speed(snapshot.download_speed_bps),
                    format_bytes(snapshot.total_download_bytes),
                );
            }
            SessionEvent::HealthWarning {
                consecutive_failures,
            } => {
                log::warn!(
                    "Engine stats unavailable for {} consecutive ticks",
                    consecutive_failures
                );
            }
            SessionEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
        }
    }
}

/// Fan-out of session events to handlers and channel subscribers
#[derive(Clone)]
pub(crate) struct EventPublisher {
    handlers: Vec<Arc<dyn EventHandler>>,
    channel: broadcast::Sender<SessionEvent>,
}

impl EventPublisher {
    pub(crate) fn new(handlers: Vec<Arc<dyn EventHandler>>, capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self { handlers, channel }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.channel.subscribe()
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        for handler in &self.handlers {
            handler.on_event(event.clone()).await;
        }
        // No subscribers is fine
        let _ = self.channel.send(event);
    }
}
