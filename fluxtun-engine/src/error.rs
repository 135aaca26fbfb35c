//! Error types for the tunnel session engine

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel session
#[derive(Debug, Error)]
pub enum Error {
    /// Daemon settings error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse the settings file
    #[error("failed to parse settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    /// Malformed or unsupported proxy configuration
    #[error("failed to parse proxy config: {0}")]
    ConfigParse(String),

    /// Proxy configuration has no SOCKS inbound to tunnel into
    #[error("proxy config has no socks inbound port")]
    MissingInboundPort,

    /// The engine rejected the session or failed while starting it
    #[error("engine failed to start: {0}")]
    EngineStartFailure(String),

    /// The engine could not be reached
    #[error("engine unreachable: {0}")]
    EngineUnreachable(String),

    /// Route computation error
    #[error("route error: {0}")]
    Route(#[from] flux_route::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Control protocol error
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// Operation not supported by this engine or platform
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Session controller has shut down
    #[error("session controller has shut down")]
    Shutdown,
}

impl Error {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::EngineUnreachable(_))
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::SettingsParse(_) | Error::ConfigParse(_) | Error::MissingInboundPort
        )
    }
}
