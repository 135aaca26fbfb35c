//! Control socket for driving a running daemon
//!
//! Requests and responses are single JSON lines wrapped in a versioned
//! envelope:
//!
//! ```text
//! → {"version":1,"type":"delay","url":null}
//! ← {"version":1,"type":"delay","ms":142}
//! ```
//!
//! Envelopes with an unknown version are answered with an error response.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::event::{SessionState, StatsSnapshot};
use crate::session::{ConnectionMode, SessionController, StartRequest};

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/fluxtun.sock";

/// Envelope version understood by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Get session state and statistics
    Status,

    /// Start a session, replacing the active one
    Start {
        remark: String,
        config: String,
        #[serde(default)]
        blocked_apps: Vec<String>,
        #[serde(default)]
        bypass_subnets: Vec<String>,
    },

    /// Stop the active session
    Stop,

    /// Measure delay through the active session
    Delay {
        #[serde(default)]
        url: Option<String>,
    },

    /// Measure delay of a config that is not running
    ServerDelay {
        config: String,
        #[serde(default)]
        url: Option<String>,
    },
}

/// Response messages from the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Status response
    Status(StatusInfo),

    /// Delay in milliseconds, -1 if unavailable
    Delay { ms: i64 },

    /// Success acknowledgment
    Ok,

    /// Error response
    Error { message: String },
}

/// Session status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Current session state
    pub state: SessionState,
    /// Connection mode
    pub mode: ConnectionMode,
    /// Name of the active session
    pub remark: Option<String>,
    /// Latest statistics (absent while disconnected)
    pub stats: Option<StatsSnapshot>,
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

fn encode<T: Serialize>(body: &T) -> Result<String> {
    let mut line = serde_json::to_string(&Envelope {
        version: PROTOCOL_VERSION,
        body,
    })
    .map_err(|e| Error::Protocol(format!("failed to serialize message: {}", e)))?;
    line.push('\n');
    Ok(line)
}

fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    let mut value: Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("invalid message: {}", e)))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::Protocol("message is not a JSON object".into()))?;

    match object.remove("version").and_then(|v| v.as_u64()) {
        Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
        Some(v) => {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {} (expected {})",
                v, PROTOCOL_VERSION
            )))
        }
        None => return Err(Error::Protocol("missing protocol version".into())),
    }

    serde_json::from_value(value).map_err(|e| Error::Protocol(format!("invalid message: {}", e)))
}

/// Encode a request as a JSON line
pub fn encode_request(request: &ControlRequest) -> Result<String> {
    encode(request)
}

/// Decode a request line, checking its version
pub fn decode_request(line: &str) -> Result<ControlRequest> {
    decode(line)
}

/// Encode a response as a JSON line
pub fn encode_response(response: &ControlResponse) -> Result<String> {
    encode(response)
}

/// Decode a response line, checking its version
pub fn decode_response(line: &str) -> Result<ControlResponse> {
    decode(line)
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    controller: SessionController,
    delay_url: String,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(
        socket_path: impl AsRef<Path>,
        controller: SessionController,
        delay_url: impl Into<String>,
    ) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            controller,
            delay_url: delay_url.into(),
        }
    }

    /// Accept connections until the task is dropped
    #[cfg(unix)]
    pub async fn start(&self) -> Result<()> {
        use tokio::net::UnixListener;

        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Config(format!("Failed to bind control socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.socket_path, perms);
        }

        log::info!("Control socket listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let controller = self.controller.clone();
                    let delay_url = self.delay_url.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, controller, delay_url).await {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }

    /// Accept connections until the task is dropped
    #[cfg(not(unix))]
    pub async fn start(&self) -> Result<()> {
        Err(Error::Unsupported(
            "control socket requires Unix domain sockets".into(),
        ))
    }

    #[cfg(unix)]
    async fn handle_connection(
        stream: tokio::net::UnixStream,
        controller: SessionController,
        delay_url: String,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }

            let response = match decode_request(&line) {
                Ok(request) => Self::handle_request(request, &controller, &delay_url).await,
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            };

            writer.write_all(encode_response(&response)?.as_bytes()).await?;
            writer.flush().await?;
        }
    }

    /// Execute one request against the controller
    pub async fn handle_request(
        request: ControlRequest,
        controller: &SessionController,
        delay_url: &str,
    ) -> ControlResponse {
        match request {
            ControlRequest::Status => ControlResponse::Status(StatusInfo {
                state: controller.connection_state().await,
                mode: controller.connection_mode().await,
                remark: controller.remark().await,
                stats: controller.snapshot().await,
            }),
            ControlRequest::Start {
                remark,
                config,
                blocked_apps,
                bypass_subnets,
            } => {
                let request = StartRequest::new(remark, config)
                    .with_blocked_apps(blocked_apps)
                    .with_bypass_subnets(bypass_subnets);
                match controller.start(request).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            ControlRequest::Stop => {
                controller.stop().await;
                ControlResponse::Ok
            }
            ControlRequest::Delay { url } => ControlResponse::Delay {
                ms: controller
                    .measure_delay(url.as_deref().unwrap_or(delay_url))
                    .await,
            },
            ControlRequest::ServerDelay { config, url } => ControlResponse::Delay {
                ms: controller
                    .measure_server_delay(&config, url.as_deref().unwrap_or(delay_url))
                    .await,
            },
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Control socket client for a running daemon
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// How long to wait for the daemon to answer a request
    fn response_timeout(request: &ControlRequest) -> Duration {
        match request {
            ControlRequest::Status => Duration::from_secs(5),
            ControlRequest::Stop => Duration::from_secs(15),
            ControlRequest::Delay { .. } | ControlRequest::ServerDelay { .. } => {
                Duration::from_secs(20)
            }
            ControlRequest::Start { .. } => Duration::from_secs(60),
        }
    }

    /// Send a request and get a response
    #[cfg(unix)]
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        use tokio::net::UnixStream;

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::EngineUnreachable(format!(
                "failed to connect to control socket at {:?}: {}. Is the daemon running?",
                self.socket_path, e
            ))
        })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(encode_request(&request)?.as_bytes()).await?;
        writer.flush().await?;

        let timeout = Self::response_timeout(&request);
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout("waiting for control response".into()))??;
        if read == 0 {
            return Err(Error::Protocol("daemon closed the connection".into()));
        }

        decode_response(&line)
    }

    /// Send a request and get a response
    #[cfg(not(unix))]
    pub async fn request(&self, _request: ControlRequest) -> Result<ControlResponse> {
        Err(Error::Unsupported(
            "control socket requires Unix domain sockets".into(),
        ))
    }

    /// Get session status
    pub async fn status(&self) -> Result<StatusInfo> {
        match self.request(ControlRequest::Status).await? {
            ControlResponse::Status(info) => Ok(info),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Start a session
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let request = ControlRequest::Start {
            remark: request.remark,
            config: request.raw_config,
            blocked_apps: request.blocked_apps,
            bypass_subnets: request.bypass_subnets,
        };
        match self.request(request).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Stop the active session
    pub async fn stop(&self) -> Result<()> {
        match self.request(ControlRequest::Stop).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Measure delay through the active session
    pub async fn delay(&self, url: Option<String>) -> Result<i64> {
        match self.request(ControlRequest::Delay { url }).await? {
            ControlResponse::Delay { ms } => Ok(ms),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Measure delay of a config that is not running
    pub async fn server_delay(&self, config: String, url: Option<String>) -> Result<i64> {
        match self.request(ControlRequest::ServerDelay { config, url }).await? {
            ControlResponse::Delay { ms } => Ok(ms),
            other => Err(Self::unexpected(other)),
        }
    }

    fn unexpected(response: ControlResponse) -> Error {
        match response {
            ControlResponse::Error { message } => Error::Protocol(message),
            other => Error::Protocol(format!("unexpected response: {:?}", other)),
        }
    }
}
