//! Control socket round trips against a mock-backed controller

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fluxtun_engine::tunnel::mock::{MockTunProvider, MockTunnelEngine};
use fluxtun_engine::{
    ConnectionMode, ControlClient, ControlServer, Error, SessionController, SessionOptions,
    SessionState, StartRequest,
};

const CONFIG: &str = r#"{
    "inbounds": [{"protocol": "socks", "port": 10808}],
    "outbounds": [{"protocol": "trojan", "settings": {"servers": [{"address": "203.0.113.9", "port": 443}]}}]
}"#;

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fluxtun-test-{}-{}.sock", name, std::process::id()))
}

async fn serve(name: &str) -> (ControlClient, Arc<MockTunnelEngine>, tokio::task::JoinHandle<()>) {
    let path = socket_path(name);
    let engine = Arc::new(MockTunnelEngine::new());
    let controller = SessionController::new(
        engine.clone(),
        Arc::new(MockTunProvider::new()),
        SessionOptions::default(),
    );

    let server = ControlServer::new(&path, controller, "http://delay.test/generate_204");
    let task = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            panic!("control server failed: {}", e);
        }
    });

    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    (ControlClient::new(&path), engine, task)
}

#[tokio::test]
async fn test_status_start_stop_over_socket() {
    let (client, engine, task) = serve("lifecycle").await;

    let status = client.status().await.unwrap();
    assert_eq!(status.state, SessionState::Disconnected);
    assert_eq!(status.mode, ConnectionMode::VpnTun);
    assert!(status.stats.is_none());

    client
        .start(StartRequest::new("office", CONFIG))
        .await
        .unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.remark.as_deref(), Some("office"));
    assert!(status.stats.is_some());

    client.stop().await.unwrap();
    assert_eq!(
        client.status().await.unwrap().state,
        SessionState::Disconnected
    );
    assert_eq!(engine.stop_count(), 1);

    task.abort();
}

#[tokio::test]
async fn test_start_error_reported_to_client() {
    let (client, _engine, task) = serve("bad-config").await;

    let err = client
        .start(StartRequest::new("broken", "[]"))
        .await
        .unwrap_err();
    match err {
        Error::Protocol(message) => assert!(message.contains("JSON object")),
        other => panic!("unexpected error: {:?}", other),
    }

    task.abort();
}

#[tokio::test]
async fn test_delay_uses_default_url() {
    let (client, engine, task) = serve("delay").await;
    engine.set_delay(42);

    // Disconnected sessions never reach the engine
    assert_eq!(client.delay(None).await.unwrap(), -1);

    client
        .start(StartRequest::new("office", CONFIG))
        .await
        .unwrap();
    assert_eq!(client.delay(None).await.unwrap(), 42);

    let urls: Vec<String> = engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            fluxtun_engine::tunnel::mock::EngineCall::MeasureDelay { url } => Some(url),
            _ => None,
        })
        .collect();
    assert_eq!(urls, vec!["http://delay.test/generate_204".to_string()]);

    task.abort();
}

#[tokio::test]
async fn test_client_without_daemon() {
    let client = ControlClient::new(socket_path("missing"));
    let err = client.status().await.unwrap_err();
    assert!(matches!(err, Error::EngineUnreachable(_)));
}
