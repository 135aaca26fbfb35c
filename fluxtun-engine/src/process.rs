//! Engine backed by external programs
//!
//! [`ProcessEngine`] runs a proxy core and, in tunnel mode, a SOCKS-to-TUN
//! forwarder as child processes. Both are supervised: if either exits on its
//! own the session is told through its [`EngineNotifier`].
//!
//! [`InheritedFdProvider`] serves hosts that open the tunnel device
//! themselves and hand the daemon its descriptor.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flux_route::RouteSet;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{EngineSettings, TunSection, CONFIG_PLACEHOLDER, FD_PLACEHOLDER};
use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;
use crate::tunnel::{
    Direction, EngineNotifier, TunInterface, TunProvider, TunSettings, TunnelEngine, TunnelHandle,
    NO_TUN_FD,
};

/// How long a freshly spawned program must stay up to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Upper bound for one delay request
const DELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a throwaway core gets to open its delay inbound
const DELAY_INBOUND_WAIT: Duration = Duration::from_secs(5);
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const CORE_CONFIG_FILE: &str = "config.json";
const TUN2SOCKS_CONFIG_FILE: &str = "tun2socks.yml";

/// Render the forwarder's YAML configuration
pub fn render_tun2socks_config(mtu: u16, address: IpAddr, socks_port: u16) -> String {
    format!(
        "tunnel:\n  mtu: {mtu}\n  ipv4: {address}\nsocks5:\n  port: {socks_port}\n  address: 127.0.0.1\n  udp: 'udp'\nmisc:\n  tcp-read-write-timeout: 300000\n  udp-read-write-timeout: 60000\n  log-level: warn\n"
    )
}

/// Substitute placeholders in a command template
fn render_command(template: &[String], replacements: &[(&str, &str)]) -> Result<Command> {
    let mut args = template.iter().map(|arg| {
        replacements
            .iter()
            .fold(arg.clone(), |acc, (from, to)| acc.replace(from, to))
    });

    let program = args
        .next()
        .ok_or_else(|| Error::Config("empty command template".into()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    Ok(command)
}

/// A child process and the task watching it
struct Supervised {
    name: &'static str,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Supervised {
    /// Spawn `command` and watch it until it exits or is killed
    async fn spawn(
        name: &'static str,
        mut command: Command,
        notifier: EngineNotifier,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut child = command
            .spawn()
            .map_err(|e| Error::EngineStartFailure(format!("failed to spawn {}: {}", name, e)))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait()? {
            return Err(Error::EngineStartFailure(format!(
                "{} exited during startup with {}",
                name, status
            )));
        }

        log::info!("Started {} (pid {:?})", name, child.id());

        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(Self::watch(name, child, kill_rx, notifier, running));

        Ok(Self {
            name,
            kill: Some(kill_tx),
            task,
        })
    }

    async fn watch(
        name: &'static str,
        mut child: Child,
        kill: oneshot::Receiver<()>,
        notifier: EngineNotifier,
        running: Arc<AtomicBool>,
    ) {
        tokio::select! {
            status = child.wait() => {
                running.store(false, Ordering::SeqCst);
                let reason = match status {
                    Ok(status) => format!("{} exited with {}", name, status),
                    Err(e) => format!("failed to wait for {}: {}", name, e),
                };
                notifier.engine_exited(reason);
            }
            _ = kill => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill {}: {}", name, e);
                }
            }
        }
    }

    async fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Err(e) = (&mut self.task).await {
            log::warn!("Supervisor for {} ended abnormally: {}", self.name, e);
        }
    }
}

struct RunningEngine {
    core: Supervised,
    tun2socks: Option<Supervised>,
    http_port: Option<u16>,
    files: Vec<PathBuf>,
}

/// [`TunnelEngine`] that runs the proxy core and forwarder as child processes
///
/// Traffic counters are not available; sessions track duration only.
pub struct ProcessEngine {
    settings: EngineSettings,
    tun: TunSection,
    running: Arc<AtomicBool>,
    current: Mutex<Option<RunningEngine>>,
}

impl ProcessEngine {
    /// Create an engine from daemon settings
    pub fn new(settings: EngineSettings, tun: TunSection) -> Self {
        Self {
            settings,
            tun,
            running: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    async fn write_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.settings.runtime_dir).await?;
        let path = self.settings.runtime_dir.join(name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    async fn spawn_all(
        &self,
        config: &ProxyConfig,
        tun_fd: i32,
        notifier: EngineNotifier,
        files: &mut Vec<PathBuf>,
    ) -> Result<RunningEngine> {
        let core_path = self.write_file(CORE_CONFIG_FILE, config.raw_config()).await?;
        files.push(core_path.clone());

        let core_arg = path_arg(&core_path);
        let command = render_command(&self.settings.core, &[(CONFIG_PLACEHOLDER, core_arg.as_str())])?;
        let core = Supervised::spawn("proxy core", command, notifier.clone(), self.running.clone())
            .await?;

        let tun2socks = if tun_fd == NO_TUN_FD {
            None
        } else {
            let template = match self.settings.tun2socks.as_ref() {
                Some(template) => template,
                None => {
                    core.terminate().await;
                    return Err(Error::EngineStartFailure(
                        "tunnel mode requires an engine.tun2socks command".into(),
                    ));
                }
            };

            let yaml = render_tun2socks_config(
                self.tun.mtu,
                self.tun.address,
                config.local_socks_port(),
            );
            let yaml_path = self.write_file(TUN2SOCKS_CONFIG_FILE, &yaml).await?;
            files.push(yaml_path.clone());

            let yaml_arg = path_arg(&yaml_path);
            let fd = tun_fd.to_string();
            let command = render_command(
                template,
                &[(CONFIG_PLACEHOLDER, yaml_arg.as_str()), (FD_PLACEHOLDER, fd.as_str())],
            )?;

            match Supervised::spawn("tun2socks", command, notifier, self.running.clone()).await {
                Ok(supervised) => Some(supervised),
                Err(e) => {
                    core.terminate().await;
                    return Err(e);
                }
            }
        };

        Ok(RunningEngine {
            core,
            tun2socks,
            http_port: config.local_http_port(),
            files: Vec::new(),
        })
    }

    async fn http_port(&self) -> Result<u16> {
        let current = self.current.lock().await;
        let running = current
            .as_ref()
            .ok_or_else(|| Error::EngineUnreachable("engine is not running".into()))?;
        running.http_port.ok_or_else(|| {
            Error::Unsupported("delay measurement needs an http inbound in the proxy config".into())
        })
    }
}

impl ProcessEngine {
    /// Run a second core on `config_path` just long enough to time one request
    async fn measure_with_throwaway_core(
        &self,
        config_path: &Path,
        port: u16,
        url: &str,
    ) -> Result<i64> {
        let config_arg = path_arg(config_path);
        let command = render_command(
            &self.settings.core,
            &[(CONFIG_PLACEHOLDER, config_arg.as_str())],
        )?;
        let core = Supervised::spawn(
            "delay core",
            command,
            EngineNotifier::detached(),
            Arc::new(AtomicBool::new(true)),
        )
        .await?;

        let result = match wait_for_port(port, DELAY_INBOUND_WAIT).await {
            Ok(()) => time_request_through_http_proxy(port, url).await,
            Err(e) => Err(e),
        };

        core.terminate().await;
        result
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn start(
        &self,
        config: &ProxyConfig,
        tun_fd: i32,
        routes: &RouteSet,
        notifier: EngineNotifier,
    ) -> Result<bool> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(Error::InvalidState("engine is already running".into()));
        }

        log::debug!(
            "Starting engine for '{}' (fd {}, {} routes)",
            config.remark(),
            tun_fd,
            routes.len()
        );

        let mut files = Vec::new();
        match self.spawn_all(config, tun_fd, notifier, &mut files).await {
            Ok(mut engine) => {
                engine.files = files;
                self.running.store(true, Ordering::SeqCst);
                *current = Some(engine);
                Ok(true)
            }
            Err(e) => {
                remove_files(&files).await;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let engine = self.current.lock().await.take();
        self.running.store(false, Ordering::SeqCst);

        let Some(engine) = engine else {
            return Ok(());
        };

        // Forwarder first so it never writes into a dead SOCKS port
        if let Some(tun2socks) = engine.tun2socks {
            tun2socks.terminate().await;
        }
        engine.core.terminate().await;
        remove_files(&engine.files).await;

        log::info!("Engine stopped");
        Ok(())
    }

    async fn query_stats(&self, _class: &str, _direction: Direction) -> Result<i64> {
        Err(Error::Unsupported(
            "child-process engine exposes no traffic counters".into(),
        ))
    }

    async fn measure_delay(&self, url: &str) -> Result<i64> {
        let port = self.http_port().await?;
        time_request_through_http_proxy(port, url).await
    }

    async fn measure_outbound_delay(&self, config: &str, url: &str) -> Result<i64> {
        let port = free_local_port()?;
        let delay_config = with_delay_inbound(config, port)?;
        let path = self
            .write_file(&format!("delay-{}.json", port), &delay_config)
            .await?;

        let result = self.measure_with_throwaway_core(&path, port, url).await;
        remove_files(std::slice::from_ref(&path)).await;
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn remove_files(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            log::debug!("Failed to remove {:?}: {}", file, e);
        }
    }
}

/// Time a full `GET` of `url` through the local HTTP proxy inbound
///
/// Redirects are not followed; any 2xx or 3xx status counts as success.
pub async fn time_request_through_http_proxy(proxy_port: u16, url: &str) -> Result<i64> {
    let target = Url::parse(url).map_err(|e| Error::Config(format!("invalid url '{}': {}", url, e)))?;
    match target.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Unsupported(format!(
                "delay request over '{}' is not supported",
                other
            )))
        }
    }

    let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{}", proxy_port))
        .map_err(|e| Error::Config(format!("invalid proxy port {}: {}", proxy_port, e)))?;
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .proxy(proxy)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(DELAY_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

    let started = Instant::now();
    let response = client.get(target).send().await.map_err(delay_request_error)?;
    let status = response.status();
    response.bytes().await.map_err(delay_request_error)?;
    let elapsed = started.elapsed();

    if !(status.is_success() || status.is_redirection()) {
        return Err(Error::EngineUnreachable(format!(
            "request to {} returned HTTP {}",
            url,
            status.as_u16()
        )));
    }

    Ok(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

fn delay_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("delay request: {}", e))
    } else {
        Error::EngineUnreachable(format!("delay request: {}", e))
    }
}

/// Replace the inbounds of `raw_config` with a single local HTTP inbound
fn with_delay_inbound(raw_config: &str, port: u16) -> Result<String> {
    let mut root = match serde_json::from_str::<Value>(raw_config) {
        Ok(Value::Object(root)) => root,
        Ok(_) => return Err(Error::ConfigParse("expected a JSON object at the top level".into())),
        Err(e) => return Err(Error::ConfigParse(e.to_string())),
    };

    root.insert(
        "inbounds".to_string(),
        json!([{
            "tag": "delay-inbound",
            "protocol": "http",
            "listen": "127.0.0.1",
            "port": port,
        }]),
    );

    serde_json::to_string(&Value::Object(root))
        .map_err(|e| Error::ConfigParse(format!("failed to serialize config: {}", e)))
}

/// Pick a loopback port nobody is listening on
fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Wait until something accepts connections on `port`
async fn wait_for_port(port: u16, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::EngineUnreachable(format!(
                "delay inbound on port {} did not come up within {:?}",
                port, limit
            )));
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

/// Tunnel descriptor duplicated from one opened by the host
#[cfg(unix)]
struct InheritedFd {
    fd: i32,
    closed: bool,
}

#[cfg(unix)]
impl TunInterface for InheritedFd {
    fn fd(&self) -> i32 {
        self.fd
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // SAFETY: `fd` was returned by `dup` and is closed only here
        if unsafe { libc::close(self.fd) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// [`TunProvider`] for a tunnel device opened by the host process
///
/// Each session receives its own duplicate of the descriptor, closed when the
/// session releases its handle. Routes, DNS and excluded apps are the host's
/// responsibility and are only logged here.
pub struct InheritedFdProvider {
    fd: i32,
}

impl InheritedFdProvider {
    /// Wrap a descriptor inherited from the host
    pub fn new(fd: i32) -> Result<Self> {
        if fd < 0 {
            return Err(Error::Config(format!("invalid tunnel descriptor {}", fd)));
        }
        Ok(Self { fd })
    }
}

impl TunProvider for InheritedFdProvider {
    #[cfg(unix)]
    fn establish(&self, settings: &TunSettings, routes: &RouteSet) -> Result<TunnelHandle> {
        // SAFETY: dup has no memory-safety preconditions; failure is checked
        let fd = unsafe { libc::dup(self.fd) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        log::info!(
            "Session '{}' on inherited fd {} (mtu {}, {}/{}), routes: {}",
            settings.session_name,
            fd,
            settings.mtu,
            settings.address,
            settings.prefix_len,
            routes
        );
        if !settings.disallowed_apps.is_empty() {
            log::debug!("Apps kept out of the tunnel: {:?}", settings.disallowed_apps);
        }

        Ok(TunnelHandle::new(Box::new(InheritedFd { fd, closed: false })))
    }

    #[cfg(not(unix))]
    fn establish(&self, _settings: &TunSettings, _routes: &RouteSet) -> Result<TunnelHandle> {
        Err(Error::Unsupported(
            "inherited tunnel descriptors are only supported on Unix".into(),
        ))
    }
}

/// Provider for daemons started without a tunnel descriptor
pub struct NoTunProvider;

impl TunProvider for NoTunProvider {
    fn establish(&self, _settings: &TunSettings, _routes: &RouteSet) -> Result<TunnelHandle> {
        Err(Error::Unsupported(
            "no tunnel descriptor was provided; start the daemon with --tun-fd or use proxy_only mode"
                .into(),
        ))
    }
}
