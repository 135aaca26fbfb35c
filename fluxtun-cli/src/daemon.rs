//! Foreground daemon: one session controller behind the control socket

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use fluxtun_engine::{
    ConnectionMode, ControlServer, InheritedFdProvider, NoTunProvider, ProcessEngine,
    SessionController, Settings, StartRequest, TunProvider,
};

pub async fn run(
    settings: Settings,
    socket: PathBuf,
    tun_fd: Option<i32>,
    autostart: Option<(String, PathBuf)>,
) -> Result<()> {
    info!("Starting FluxTun daemon...");

    let tun_provider: Arc<dyn TunProvider> = match tun_fd {
        Some(fd) => Arc::new(
            InheritedFdProvider::new(fd).context("Failed to use the tunnel descriptor")?,
        ),
        None => {
            if settings.session.mode == ConnectionMode::VpnTun {
                warn!("No --tun-fd given; vpn_tun sessions will fail to start");
            }
            Arc::new(NoTunProvider)
        }
    };

    let engine = Arc::new(ProcessEngine::new(
        settings.engine.clone(),
        settings.tun.clone(),
    ));
    let controller = SessionController::builder(engine, tun_provider)
        .options(settings.session_options())
        .spawn();

    let server = Arc::new(ControlServer::new(
        &socket,
        controller.clone(),
        settings.session.delay_url.clone(),
    ));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Control server error: {}", e);
            }
        })
    };

    if let Some((remark, path)) = autostart {
        let raw_config = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read proxy config {:?}", path))?;
        match controller.start(StartRequest::new(remark, raw_config)).await {
            Ok(()) => info!("Session from {:?} started", path),
            Err(e) if e.is_config_error() => {
                controller.shutdown().await;
                server_task.abort();
                return Err(e).with_context(|| format!("Invalid proxy config {:?}", path));
            }
            Err(e) => error!("Failed to start session from {:?}: {}", path, e),
        }
    }

    wait_for_shutdown().await?;

    info!("Shutting down daemon...");

    if tokio::time::timeout(Duration::from_secs(10), controller.shutdown())
        .await
        .is_err()
    {
        warn!("Session did not stop within 10s");
    }

    server_task.abort();
    server.cleanup();

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
