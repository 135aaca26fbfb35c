//! Traffic statistics and session duration accounting
//!
//! While a session is connected the aggregator samples the engine's per-class
//! counters once per tick, derives the speed for that tick, accumulates
//! totals, and advances a wall-clock style duration counter. Sampling errors
//! never end the session: the sample is skipped, the previous values are
//! reported again, and a health warning is raised once a streak of failures
//! reaches [`HEALTH_WARNING_THRESHOLD`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Error;
use crate::event::{EventPublisher, SessionEvent, SessionState, StatsSnapshot};
use crate::session::SharedSessionRef;
use crate::tunnel::{Direction, TunnelEngine};

/// Consecutive failed samples before a health warning is raised
pub const HEALTH_WARNING_THRESHOLD: u32 = 3;

/// Outbound classes sampled by default
pub const DEFAULT_TRAFFIC_CLASSES: [&str; 2] = ["block", "proxy"];

/// How the engine reports its counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterMode {
    /// Counters reset on every read; each value is the traffic since the last read
    #[default]
    Delta,
    /// Counters grow for the lifetime of the engine
    Cumulative,
}

/// Session duration as hours, minutes and seconds
///
/// Minutes and seconds wrap at 60, hours at 24.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationCounter {
    elapsed: u64,
    hours: u8,
    minutes: u8,
    seconds: u8,
}

impl DurationCounter {
    /// Counter at `00:00:00`
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one second
    pub fn tick(&mut self) {
        self.elapsed += 1;
        self.seconds += 1;
        if self.seconds == 60 {
            self.seconds = 0;
            self.minutes += 1;
            if self.minutes == 60 {
                self.minutes = 0;
                self.hours += 1;
                if self.hours == 24 {
                    self.hours = 0;
                }
            }
        }
    }

    /// Total ticks since the counter was created, without wrapping
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed
    }
}

impl fmt::Display for DurationCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

/// Counters read during one tick
#[derive(Debug, Default)]
struct Sample {
    upload: u64,
    download: u64,
    /// First read that failed; later counters were not read
    error: Option<Error>,
}

impl Sample {
    fn add(&mut self, direction: Direction, value: u64) {
        match direction {
            Direction::Uplink => self.upload = self.upload.saturating_add(value),
            Direction::Downlink => self.download = self.download.saturating_add(value),
        }
    }
}

/// Per-session traffic accounting
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    mode: CounterMode,
    traffic_classes: Vec<String>,
    stats_enabled: bool,
    duration: DurationCounter,
    upload_speed: u64,
    download_speed: u64,
    total_upload: u64,
    total_download: u64,
    last_upload_counter: u64,
    last_download_counter: u64,
    consecutive_failures: u32,
}

impl StatsAggregator {
    /// Create an aggregator for a fresh session
    pub fn new(mode: CounterMode, traffic_classes: Vec<String>, stats_enabled: bool) -> Self {
        Self {
            mode,
            traffic_classes,
            stats_enabled,
            duration: DurationCounter::new(),
            upload_speed: 0,
            download_speed: 0,
            total_upload: 0,
            total_download: 0,
            last_upload_counter: 0,
            last_download_counter: 0,
            consecutive_failures: 0,
        }
    }

    /// Current failure streak
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Session duration so far
    pub fn duration(&self) -> &DurationCounter {
        &self.duration
    }

    /// Run one tick against the engine
    ///
    /// Returns the failure streak length when a health warning is due.
    pub async fn tick(&mut self, engine: &dyn TunnelEngine) -> Option<u32> {
        self.advance();

        if !self.stats_enabled {
            return None;
        }

        let sample = self.sample(engine).await;
        match sample.error {
            None => {
                self.record_sample(sample.upload, sample.download);
                None
            }
            Some(Error::Unsupported(reason)) => {
                log::info!("Engine reports no traffic counters ({}), tracking duration only", reason);
                self.stats_enabled = false;
                None
            }
            Some(e) => {
                log::debug!("Skipping stats sample: {}", e);
                self.record_partial(sample.upload, sample.download);
                self.record_failure()
            }
        }
    }

    /// Read every counter, stopping at the first failed read
    async fn sample(&self, engine: &dyn TunnelEngine) -> Sample {
        let mut sample = Sample::default();

        for class in &self.traffic_classes {
            for direction in [Direction::Uplink, Direction::Downlink] {
                match engine.query_stats(class, direction).await {
                    Ok(value) => sample.add(direction, clamp_counter(value)),
                    Err(e) => {
                        sample.error = Some(e);
                        return sample;
                    }
                }
            }
        }

        sample
    }

    /// Advance the duration by one second
    pub fn advance(&mut self) {
        self.duration.tick();
    }

    /// Fold a successful sample of summed counters into the totals
    pub fn record_sample(&mut self, upload: u64, download: u64) {
        let (upload_speed, download_speed) = match self.mode {
            CounterMode::Delta => (upload, download),
            CounterMode::Cumulative => {
                let speeds = (
                    upload.saturating_sub(self.last_upload_counter),
                    download.saturating_sub(self.last_download_counter),
                );
                self.last_upload_counter = upload;
                self.last_download_counter = download;
                speeds
            }
        };

        self.upload_speed = upload_speed;
        self.download_speed = download_speed;
        self.total_upload = self.total_upload.saturating_add(upload_speed);
        self.total_download = self.total_download.saturating_add(download_speed);
        self.consecutive_failures = 0;
    }

    /// Keep counters drained by the reads that succeeded in a failed sample
    ///
    /// Only delta counters lose traffic once read; cumulative counters are
    /// picked up again by the next successful sample. Speeds are left as they
    /// were.
    pub fn record_partial(&mut self, upload: u64, download: u64) {
        if self.mode == CounterMode::Delta {
            self.total_upload = self.total_upload.saturating_add(upload);
            self.total_download = self.total_download.saturating_add(download);
        }
    }

    /// Record a skipped sample
    ///
    /// Returns the streak length exactly once per streak, when it reaches the
    /// warning threshold.
    pub fn record_failure(&mut self) -> Option<u32> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        (self.consecutive_failures == HEALTH_WARNING_THRESHOLD).then_some(self.consecutive_failures)
    }

    /// Snapshot of the current values
    pub fn snapshot(&self, state: SessionState) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_seconds: self.duration.elapsed_seconds(),
            duration: self.duration.to_string(),
            upload_speed_bps: self.upload_speed,
            download_speed_bps: self.download_speed,
            total_upload_bytes: self.total_upload,
            total_download_bytes: self.total_download,
            state,
        }
    }

    /// Tick until `shutdown` fires
    ///
    /// The first tick happens one `period` after the call. Snapshots are
    /// written to the shared session and published only while it is
    /// connected.
    pub(crate) async fn run(
        mut self,
        engine: Arc<dyn TunnelEngine>,
        shared: SharedSessionRef,
        events: EventPublisher,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let warning = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                warning = self.tick(engine.as_ref()) => warning,
            };

            let snapshot = {
                let mut session = shared.write().await;
                if !session.state.is_connected() {
                    continue;
                }
                let snapshot = self.snapshot(SessionState::Connected);
                session.snapshot = Some(snapshot.clone());
                snapshot
            };

            events.emit(SessionEvent::Stats(snapshot)).await;

            if let Some(consecutive_failures) = warning {
                events
                    .emit(SessionEvent::HealthWarning {
                        consecutive_failures,
                    })
                    .await;
            }
        }

        log::debug!("Stats ticker stopped after {}", self.duration);
    }
}

fn clamp_counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn format_scaled(bytes: u64, suffix: &str) -> String {
    let value = bytes as f64;
    if bytes < 1024 {
        format!("{} B{}", bytes, suffix)
    } else if value < MIB {
        format!("{:.1} KB{}", value / KIB, suffix)
    } else if value < GIB {
        format!("{:.1} MB{}", value / MIB, suffix)
    } else {
        format!("{:.2} GB{}", value / GIB, suffix)
    }
}

/// Format a byte rate for display, e.g. `1.5 KB/s`
pub fn format_speed(bytes_per_second: u64) -> String {
    format_scaled(bytes_per_second, "/s")
}

/// Format a byte count for display, e.g. `2.00 GB`
pub fn format_bytes(bytes: u64) -> String {
    format_scaled(bytes, "")
}
