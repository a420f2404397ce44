//! Error taxonomy for the collaboration server.
//!
//! Nothing here is fatal to the process: every error is caught at the
//! connection or document boundary where it happens and turned into a log
//! line plus a local state change (frame dropped, socket closed, flush retried).

use thiserror::Error;

/// Configuration errors raised while reading the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Wire protocol errors. The offending frame is dropped, the socket stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Truncated message tag")]
    TruncatedTag,
    #[error("Unknown message tag: {0}")]
    UnknownTag(u64),
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// CRDT engine errors. A failed update never touches document state.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to decode update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Failed to register update observer: {0}")]
    Observe(String),
}

/// Fast cache (tier 2) errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache entry {key} is not valid JSON: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable store (tier 3) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Durable store rejected {name}: HTTP {status}")]
    Rejected { name: String, status: u16 },
    #[error("Invalid durable store URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Persistence pipeline errors.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to encode document {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Document {name} could not be flushed to any tier")]
    Unflushed { name: String },
}

/// Startup failures of the server process.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Fast cache unavailable: {0}")]
    Cache(#[from] CacheError),
    #[error("Durable store misconfigured: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// WebSocket close codes used by the gateways.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INVALID_PATH: u16 = 4000;
    pub const SESSION_NOT_FOUND: u16 = 4001;
    pub const SESSION_LOOKUP_FAILED: u16 = 4002;
    pub const AUTH_FAILED: u16 = 4003;
    pub const SHELL_OPEN_FAILED: u16 = 4004;
    pub const CONNECTION_FAILED: u16 = 4005;
}

/// Terminal gateway failures. Each maps to a distinct close code.
#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Invalid terminal path")]
    InvalidPath,
    #[error("Session not found or expired")]
    SessionNotFound,
    #[error("Session lookup failed: {0}")]
    SessionLookup(#[from] CacheError),
    #[error("Invalid session payload: {0}")]
    InvalidSession(String),
    #[error("Authentication failed for {username}@{host}")]
    AuthFailed { host: String, username: String },
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Failed to open shell: {0}")]
    ShellOpen(String),
    #[error("Connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },
    #[error("Remote connection error: {0}")]
    Connection(String),
}

impl TerminalError {
    /// Close code sent to the client when this error ends the session.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidPath => close_code::INVALID_PATH,
            Self::SessionNotFound => close_code::SESSION_NOT_FOUND,
            Self::SessionLookup(_) | Self::InvalidSession(_) => close_code::SESSION_LOOKUP_FAILED,
            Self::AuthFailed { .. } | Self::InvalidKey(_) => close_code::AUTH_FAILED,
            Self::ShellOpen(_) => close_code::SHELL_OPEN_FAILED,
            Self::ConnectTimeout { .. } | Self::Connection(_) => close_code::CONNECTION_FAILED,
        }
    }
}

impl From<russh::Error> for TerminalError {
    fn from(e: russh::Error) -> Self {
        TerminalError::Connection(e.to_string())
    }
}
