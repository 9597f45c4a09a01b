//! Error types for tunrelay

use thiserror::Error;

/// Main error type for tunrelay
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Route validation error: {0}")]
    RouteValidation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Virtual interface error: {0}")]
    VirtualInterface(String),

    #[error("Session limit reached ({0} sessions)")]
    SessionLimit(usize),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("Tunnel not running")]
    NotRunning,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Whether this error is fatal for the whole tunnel.
    ///
    /// Only virtual interface failures are; everything else is handled per
    /// packet or per session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::VirtualInterface(_))
    }

    /// Short, stable reason label surfaced to the control bridge
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Config(_) => "ConfigError",
            Error::MalformedPacket(_) => "MalformedPacket",
            Error::RouteValidation(_) => "RouteValidationError",
            Error::Transport(_) => "TransportError",
            Error::VirtualInterface(_) => "VirtualInterfaceError",
            Error::SessionLimit(_) => "SessionLimit",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::AlreadyRunning => "AlreadyRunning",
            Error::NotRunning => "NotRunning",
            Error::ConnectionClosed => "ConnectionClosed",
            Error::Timeout => "Timeout",
        }
    }
}

/// Result type alias for tunrelay
pub type Result<T> = std::result::Result<T, Error>;
