//! FluxTun CLI
//!
//! Runs the tunnel daemon and talks to it over its control socket.

mod client;
mod daemon;
mod inspect;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fluxtun_engine::{Settings, DEFAULT_SOCKET_PATH};

/// FluxTun - single-session proxy tunnel daemon
#[derive(Parser)]
#[command(name = "fluxtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the daemon settings file
    #[arg(short, long, default_value = "fluxtun.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Control socket path (overrides the settings file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Tunnel device descriptor opened by the host
        #[arg(long)]
        tun_fd: Option<i32>,

        /// Proxy config to start right away
        #[arg(long)]
        proxy_config: Option<PathBuf>,

        /// Session name for --proxy-config
        #[arg(long, default_value = "default")]
        remark: String,
    },

    /// Start a session on the running daemon
    Start {
        /// Proxy config JSON file
        proxy_config: PathBuf,

        /// Session name
        #[arg(short, long)]
        remark: Option<String>,

        /// Application kept out of the tunnel (repeatable)
        #[arg(long = "block-app")]
        blocked_apps: Vec<String>,

        /// Subnet routed through the tunnel instead of everything (repeatable)
        #[arg(long = "bypass")]
        bypass_subnets: Vec<String>,
    },

    /// Stop the active session
    Stop,

    /// Show session status
    Status,

    /// Measure delay through the active session
    Delay {
        /// URL to request
        #[arg(long)]
        url: Option<String>,
    },

    /// Measure delay of a proxy config without starting it
    ServerDelay {
        /// Proxy config JSON file
        proxy_config: PathBuf,

        /// URL to request
        #[arg(long)]
        url: Option<String>,
    },

    /// Print the routes that punch an address out of a block
    Routes {
        /// Covering block
        #[arg(short, long, default_value = flux_route::DEFAULT_ROUTE_V4)]
        target: String,

        /// IPv4 address to exclude
        #[arg(short, long)]
        exclude: Option<String>,
    },

    /// Show what the daemon extracts from a proxy config
    Translate {
        /// Proxy config JSON file
        proxy_config: PathBuf,

        /// Leave the config without traffic counters
        #[arg(long)]
        no_stats: bool,

        /// Print the normalized config instead of the summary
        #[arg(long)]
        raw: bool,
    },

    /// Generate a sample settings file
    GenConfig {
        /// Output path for the settings file
        #[arg(short, long, default_value = "fluxtun.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run {
            tun_fd,
            proxy_config,
            remark,
        } => {
            let settings = load_settings(&cli.config)?;
            let socket = cli
                .socket
                .unwrap_or_else(|| settings.control_socket_path());
            daemon::run(settings, socket, tun_fd, proxy_config.map(|p| (remark, p))).await
        }
        Commands::Start {
            proxy_config,
            remark,
            blocked_apps,
            bypass_subnets,
        } => {
            let socket = socket_path(cli.socket, &cli.config);
            client::start(&socket, &proxy_config, remark, blocked_apps, bypass_subnets).await
        }
        Commands::Stop => client::stop(&socket_path(cli.socket, &cli.config)).await,
        Commands::Status => client::status(&socket_path(cli.socket, &cli.config)).await,
        Commands::Delay { url } => client::delay(&socket_path(cli.socket, &cli.config), url).await,
        Commands::ServerDelay { proxy_config, url } => {
            client::server_delay(&socket_path(cli.socket, &cli.config), &proxy_config, url).await
        }
        Commands::Routes { target, exclude } => inspect::routes(&target, exclude.as_deref()),
        Commands::Translate {
            proxy_config,
            no_stats,
            raw,
        } => inspect::translate(&proxy_config, !no_stats, raw),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("Failed to load settings from {:?}", path))
}

/// Control socket for client commands
///
/// A missing settings file is fine here: clients fall back to the default
/// socket path.
fn socket_path(explicit: Option<PathBuf>, settings_path: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if settings_path.exists() {
        match Settings::load(settings_path) {
            Ok(settings) => return settings.control_socket_path(),
            Err(e) => tracing::warn!("Ignoring unreadable settings {:?}: {}", settings_path, e),
        }
    }
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Settings::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write settings to {:?}", output))?;

    info!("Generated sample settings at {:?}", output);
    println!("Sample settings written to {:?}", output);
    println!("\nPoint [engine] core at your proxy core binary before running the daemon.");

    Ok(())
}
