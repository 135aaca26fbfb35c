//! Offline inspection commands; no daemon needed

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;

use flux_route::{exclude_address, RouteSet};
use fluxtun_engine::ConfigTranslator;

use crate::client::read_config;

pub fn routes(target: &str, exclude: Option<&str>) -> Result<()> {
    let target: Ipv4Net = target
        .trim()
        .parse()
        .with_context(|| format!("Invalid target block '{}'", target))?;
    let exclude = exclude
        .map(|addr| {
            addr.trim()
                .parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid IPv4 address '{}'", addr))
        })
        .transpose()?;

    let outcome = exclude_address(target, exclude).context("Failed to compute routes")?;
    if outcome.is_degenerate() {
        println!("# {} is too small to split, no routes", target);
    }

    for route in outcome.into_routes() {
        println!("{}", route);
    }

    Ok(())
}

pub fn translate(path: &Path, stats_enabled: bool, raw: bool) -> Result<()> {
    let raw_config = read_config(path)?;
    let remark = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let no_entries: &[&str] = &[];
    let config = ConfigTranslator::new(stats_enabled)
        .translate(&remark, &raw_config, no_entries, no_entries)
        .with_context(|| format!("Failed to translate {:?}", path))?;

    if raw {
        let value: serde_json::Value = serde_json::from_str(config.raw_config())
            .context("Translated config is not valid JSON")?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Session:    {}", config.remark());
    println!("SOCKS port: {}", config.local_socks_port());
    match config.local_http_port() {
        Some(port) => println!("HTTP port:  {}", port),
        None => println!("HTTP port:  none"),
    }
    match config.proxy_endpoint() {
        Some(endpoint) => println!("Server:     {}", endpoint),
        None => println!("Server:     unknown"),
    }
    if !config.dns_servers().is_empty() {
        let dns: Vec<String> = config.dns_servers().iter().map(|d| d.to_string()).collect();
        println!("DNS:        {}", dns.join(", "));
    }
    println!("Stats:      {}", if config.stats_enabled() { "on" } else { "off" });

    let routes = RouteSet::for_policy(config.bypass_policy(), config.proxy_server_ipv4())
        .context("Failed to compute routes")?;
    println!("Routes ({}):", routes.len());
    for route in &routes {
        println!("  {}", route);
    }

    Ok(())
}
