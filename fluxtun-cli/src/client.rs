//! Control socket client commands

use std::path::Path;

use anyhow::{Context, Result};

use fluxtun_engine::{format_bytes, format_speed, ControlClient, StartRequest, DELAY_UNAVAILABLE};

pub async fn start(
    socket: &Path,
    proxy_config: &Path,
    remark: Option<String>,
    blocked_apps: Vec<String>,
    bypass_subnets: Vec<String>,
) -> Result<()> {
    let raw_config = read_config(proxy_config)?;
    let remark = remark.unwrap_or_else(|| default_remark(proxy_config));

    let request = StartRequest::new(remark.clone(), raw_config)
        .with_blocked_apps(blocked_apps)
        .with_bypass_subnets(bypass_subnets);

    ControlClient::new(socket)
        .start(request)
        .await
        .with_context(|| format!("Failed to start session '{}'", remark))?;

    println!("Session '{}' connected", remark);
    Ok(())
}

pub async fn stop(socket: &Path) -> Result<()> {
    ControlClient::new(socket)
        .stop()
        .await
        .context("Failed to stop session")?;

    println!("Session stopped");
    Ok(())
}

pub async fn status(socket: &Path) -> Result<()> {
    let info = ControlClient::new(socket)
        .status()
        .await
        .context("Failed to get status")?;

    println!("State:    {}", info.state.description());
    println!("Mode:     {}", info.mode);
    if let Some(remark) = &info.remark {
        println!("Session:  {}", remark);
    }
    if let Some(stats) = &info.stats {
        println!("Duration: {}", stats.duration);
        println!(
            "Upload:   {} (total {})",
            format_speed(stats.upload_speed_bps),
            format_bytes(stats.total_upload_bytes)
        );
        println!(
            "Download: {} (total {})",
            format_speed(stats.download_speed_bps),
            format_bytes(stats.total_download_bytes)
        );
    }

    Ok(())
}

pub async fn delay(socket: &Path, url: Option<String>) -> Result<()> {
    let ms = ControlClient::new(socket)
        .delay(url)
        .await
        .context("Failed to measure delay")?;

    print_delay(ms);
    Ok(())
}

pub async fn server_delay(socket: &Path, proxy_config: &Path, url: Option<String>) -> Result<()> {
    let raw_config = read_config(proxy_config)?;
    let ms = ControlClient::new(socket)
        .server_delay(raw_config, url)
        .await
        .context("Failed to measure server delay")?;

    print_delay(ms);
    Ok(())
}

fn print_delay(ms: i64) {
    if ms == DELAY_UNAVAILABLE {
        println!("Delay: unavailable");
    } else {
        println!("Delay: {} ms", ms);
    }
}

pub(crate) fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read proxy config {:?}", path))
}

/// Session name from the config file name
fn default_remark(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}
