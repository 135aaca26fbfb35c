//! Session controller behavior against the mock engine
//!
//! Time is paused in every test, so the one-second stats ticker and the
//! delay timeout run instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use fluxtun_engine::tunnel::mock::{EngineCall, MockTunProvider, MockTunnelEngine};
use fluxtun_engine::{
    Direction, Error, SessionController, SessionEvent, SessionOptions, SessionState,
    StartRequest, StatsSnapshot, DEFAULT_DELAY_URL, DELAY_UNAVAILABLE,
};
use tokio::sync::broadcast;

const VMESS_CONFIG: &str = r#"{
    "inbounds": [
        {"protocol": "socks", "port": 10808},
        {"protocol": "http", "port": 10809}
    ],
    "outbounds": [{
        "protocol": "vmess",
        "tag": "proxy",
        "settings": {"vnext": [{"address": "93.184.216.34", "port": 443}]}
    }],
    "routing": {"domainStrategy": "AsIs", "rules": [{"type": "field", "outboundTag": "direct"}]}
}"#;

struct Harness {
    controller: SessionController,
    engine: Arc<MockTunnelEngine>,
    provider: MockTunProvider,
    events: broadcast::Receiver<SessionEvent>,
}

fn harness() -> Harness {
    let engine = Arc::new(MockTunnelEngine::new());
    let provider = MockTunProvider::new();
    let controller = SessionController::new(
        engine.clone(),
        Arc::new(provider.clone()),
        SessionOptions::default(),
    );
    let events = controller.subscribe();
    Harness {
        controller,
        engine,
        provider,
        events,
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn transitions(events: &[SessionEvent]) -> Vec<(SessionState, SessionState)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { old, new } => Some((*old, *new)),
            _ => None,
        })
        .collect()
}

fn terminal_snapshots(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, SessionEvent::Stats(s) if s.state == SessionState::Disconnected && s.is_zeroed())
        })
        .count()
}

fn connected_snapshots(events: &[SessionEvent]) -> Vec<StatsSnapshot> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Stats(s) if s.state == SessionState::Connected => Some(s.clone()),
            _ => None,
        })
        .collect()
}

/// Wait until the session reaches `state`, returning the events seen on the way
async fn wait_for_state(
    events: &mut broadcast::Receiver<SessionEvent>,
    state: SessionState,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed");
        let reached = matches!(event, SessionEvent::StateChanged { new, .. } if new == state);
        seen.push(event);
        if reached {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_state_sequence_end_to_end() {
    let mut h = harness();

    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert!(h.controller.snapshot().await.is_none());

    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    let events = drain(&mut h.events);
    assert_eq!(
        transitions(&events),
        vec![
            (SessionState::Disconnected, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Connected),
        ]
    );

    h.controller.stop().await;

    let events = drain(&mut h.events);
    assert_eq!(
        transitions(&events),
        vec![(SessionState::Connected, SessionState::Disconnected)]
    );
    assert_eq!(terminal_snapshots(&events), 1);
    match events.last() {
        Some(SessionEvent::Stats(snapshot)) => {
            assert!(snapshot.is_zeroed());
            assert_eq!(snapshot.state, SessionState::Disconnected);
        }
        other => panic!("expected terminal snapshot last, got {:?}", other),
    }

    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert!(h.controller.snapshot().await.is_none());
    assert_eq!(h.engine.start_count(), 1);
    assert_eq!(h.engine.stop_count(), 1);
    assert_eq!(h.provider.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_receives_punched_routes() {
    let h = harness();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    match h.engine.last_start() {
        Some(EngineCall::Start {
            remark,
            tun_fd,
            routes,
            stats_enabled,
        }) => {
            assert_eq!(remark, "home");
            assert!(tun_fd >= 0);
            assert!(stats_enabled);
            assert_eq!(routes.len(), 32);
            assert!(!routes.covers("93.184.216.34".parse().unwrap()));
            assert!(routes.covers("93.184.216.35".parse().unwrap()));
        }
        other => panic!("unexpected call: {:?}", other),
    }

    let (settings, routes) = h.provider.requests().remove(0);
    assert_eq!(settings.mtu, 1500);
    assert_eq!(settings.address.to_string(), "10.1.0.2");
    assert_eq!(settings.prefix_len, 24);
    assert_eq!(routes.len(), 32);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_bypass_subnets_replace_auto_exclusion() {
    let h = harness();
    let request = StartRequest::new("lan", VMESS_CONFIG)
        .with_bypass_subnets(vec!["10.0.0.0/8".into(), "nonsense".into(), "192.168.1.7/24".into()])
        .with_blocked_apps(vec!["com.example.bank".into()]);
    h.controller.start(request).await.unwrap();

    let (settings, routes) = h.provider.requests().remove(0);
    assert_eq!(routes.to_string(), "10.0.0.0/8, 192.168.1.0/24");
    assert_eq!(settings.disallowed_apps, vec!["com.example.bank".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_releases_previous_handle_once() {
    let mut h = harness();

    h.controller
        .start(StartRequest::new("first", VMESS_CONFIG))
        .await
        .unwrap();
    drain(&mut h.events);

    h.controller
        .start(StartRequest::new("second", VMESS_CONFIG))
        .await
        .unwrap();

    let events = drain(&mut h.events);
    assert_eq!(
        transitions(&events),
        vec![
            (SessionState::Connected, SessionState::Disconnected),
            (SessionState::Disconnected, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Connected),
        ]
    );
    assert_eq!(terminal_snapshots(&events), 1);

    assert_eq!(h.provider.established_count(), 2);
    assert_eq!(h.provider.closed_count(), 1);
    assert_eq!(h.engine.stop_count(), 1);
    assert_eq!(h.controller.remark().await.as_deref(), Some("second"));

    h.controller.stop().await;
    assert_eq!(h.provider.closed_count(), 2);
    assert_eq!(h.provider.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_disconnected_is_noop() {
    let mut h = harness();

    h.controller.stop().await;
    assert!(drain(&mut h.events).is_empty());
    assert_eq!(h.engine.stop_count(), 0);

    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();
    h.controller.stop().await;
    drain(&mut h.events);

    h.controller.stop().await;
    let events = drain(&mut h.events);
    assert_eq!(terminal_snapshots(&events), 0);
    assert!(events.is_empty());
    assert_eq!(h.engine.stop_count(), 1);
    assert_eq!(h.provider.closed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_survives_engine_failure() {
    let h = harness();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    h.engine.set_fail_stop(true);
    h.controller.stop().await;

    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert_eq!(h.provider.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_measure_delay_while_disconnected() {
    let h = harness();
    h.engine.set_delay(120);

    assert_eq!(
        h.controller.measure_delay(DEFAULT_DELAY_URL).await,
        DELAY_UNAVAILABLE
    );
    assert_eq!(h.engine.delay_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_measure_delay_while_connected() {
    let h = harness();
    h.engine.set_delay(87);
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    assert_eq!(h.controller.measure_delay(DEFAULT_DELAY_URL).await, 87);
    assert_eq!(h.engine.delay_call_count(), 1);

    h.engine.fail_delay();
    assert_eq!(
        h.controller.measure_delay(DEFAULT_DELAY_URL).await,
        DELAY_UNAVAILABLE
    );

    h.engine.set_delay(-5);
    assert_eq!(
        h.controller.measure_delay(DEFAULT_DELAY_URL).await,
        DELAY_UNAVAILABLE
    );
}

#[tokio::test(start_paused = true)]
async fn test_measure_delay_times_out() {
    let h = harness();
    h.engine.hang_delay();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        h.controller.measure_delay(DEFAULT_DELAY_URL).await,
        DELAY_UNAVAILABLE
    );
    assert!(started.elapsed() >= Duration::from_secs(15));

    // The session itself is unaffected
    assert_eq!(h.controller.connection_state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_server_delay_strips_routing_rules() {
    let h = harness();
    h.engine.set_outbound_delay(230);

    let delay = h
        .controller
        .measure_server_delay(VMESS_CONFIG, DEFAULT_DELAY_URL)
        .await;
    assert_eq!(delay, 230);

    let stripped = h
        .engine
        .calls()
        .into_iter()
        .find_map(|c| match c {
            EngineCall::MeasureOutboundDelay { config, .. } => Some(config),
            _ => None,
        })
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
    assert!(value["routing"].get("rules").is_none());
    assert_eq!(value["routing"]["domainStrategy"], "AsIs");
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_returns_to_disconnected() {
    let mut h = harness();
    h.engine.fail_start("core refused config");

    let err = h
        .controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineStartFailure(_)));

    let events = drain(&mut h.events);
    assert_eq!(
        transitions(&events),
        vec![
            (SessionState::Disconnected, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Disconnected),
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Error { recoverable: false, .. })));
    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert!(h.controller.snapshot().await.is_none());
    assert_eq!(h.provider.open_count(), 0);

    // Declined starts are failures too
    h.engine.decline_start();
    let err = h
        .controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineStartFailure(_)));
    assert_eq!(h.provider.open_count(), 0);

    // A later start works
    h.engine.accept_start();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();
    assert_eq!(h.controller.connection_state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_config_error_never_enters_connecting() {
    let mut h = harness();

    let err = h
        .controller
        .start(StartRequest::new("broken", "{\"inbounds\": []}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingInboundPort));

    let err = h
        .controller
        .start(StartRequest::new("broken", "not json"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigParse(_)));

    assert!(transitions(&drain(&mut h.events)).is_empty());
    assert_eq!(h.engine.start_count(), 0);
    assert_eq!(h.provider.established_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_exit_tears_down_session() {
    let mut h = harness();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();
    drain(&mut h.events);

    assert!(h.engine.trigger_exit("core crashed"));

    let events = wait_for_state(&mut h.events, SessionState::Disconnected).await;
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Error { message, recoverable: false } if message.contains("core crashed")
    )));
    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert_eq!(h.provider.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_engine_exit_is_ignored() {
    let h = harness();
    h.controller
        .start(StartRequest::new("first", VMESS_CONFIG))
        .await
        .unwrap();
    h.controller
        .start(StartRequest::new("second", VMESS_CONFIG))
        .await
        .unwrap();

    let stale = h.engine.notifier(0).unwrap();
    assert_ne!(stale.generation(), h.engine.notifier(1).unwrap().generation());
    stale.engine_exited("old core finally died");

    // Give the actor a chance to process the notification
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.controller.connection_state().await, SessionState::Connected);
    assert_eq!(h.controller.remark().await.as_deref(), Some("second"));
    assert_eq!(h.engine.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stats_ticks_while_connected() {
    let mut h = harness();
    h.engine.set_counter("proxy", Direction::Uplink, 1000);
    h.engine.set_counter("proxy", Direction::Downlink, 4000);
    h.engine.set_counter("block", Direction::Downlink, 24);

    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let snapshots = connected_snapshots(&drain(&mut h.events));
    assert_eq!(snapshots.len(), 3);

    let last = snapshots.last().unwrap();
    assert_eq!(last.elapsed_seconds, 3);
    assert_eq!(last.duration, "00:00:03");
    assert_eq!(last.upload_speed_bps, 1000);
    assert_eq!(last.download_speed_bps, 4024);
    assert_eq!(last.total_upload_bytes, 3000);
    assert_eq!(last.total_download_bytes, 12072);

    assert_eq!(h.controller.snapshot().await.as_ref(), Some(last));

    // No tick reaches the engine after stop
    h.controller.stop().await;
    let queries = h.engine.stats_query_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.engine.stats_query_count(), queries);
    assert!(connected_snapshots(&drain(&mut h.events)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_health_warning_after_three_failed_samples() {
    let mut h = harness();
    h.engine.set_fail_stats(true);

    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5500)).await;

    let events = drain(&mut h.events);
    let warnings: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::HealthWarning {
                consecutive_failures,
            } => Some(*consecutive_failures),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![3]);

    // Skipped samples still advance the duration
    let snapshots = connected_snapshots(&events);
    assert_eq!(snapshots.len(), 5);
    assert_eq!(snapshots[4].duration, "00:00:05");
    assert_eq!(snapshots[4].total_download_bytes, 0);

    // No transition happened
    assert_eq!(h.controller.connection_state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_session_restarts_counters() {
    let mut h = harness();
    h.engine.set_counter("proxy", Direction::Uplink, 10);

    h.controller
        .start(StartRequest::new("first", VMESS_CONFIG))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    h.controller
        .start(StartRequest::new("second", VMESS_CONFIG))
        .await
        .unwrap();
    drain(&mut h.events);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let snapshots = connected_snapshots(&drain(&mut h.events));
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].elapsed_seconds, 1);
    assert_eq!(snapshots[0].total_upload_bytes, 10);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_active_session() {
    let h = harness();
    h.controller
        .start(StartRequest::new("home", VMESS_CONFIG))
        .await
        .unwrap();

    h.controller.shutdown().await;
    assert_eq!(h.controller.connection_state().await, SessionState::Disconnected);
    assert_eq!(h.provider.open_count(), 0);
    assert_eq!(h.engine.stop_count(), 1);
}
