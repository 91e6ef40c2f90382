//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// Every failure the supervisor reports.
#[derive(Debug)]
pub enum AppError {
    /// The config file is unreadable, malformed, or fails validation.
    Config(String),
    /// A session or execution store query failed.
    Db(String),
    /// Agent process spawn, handshake, or stdio failure.
    Adapter(String),
    /// Malformed or unexpected wire message from an agent process.
    Protocol(String),
    /// Event bus publish or subscribe failure.
    Bus(String),
    /// Job queue enqueue failure.
    Queue(String),
    /// Local file or pipe I/O failed.
    Io(String),
    /// No record with the requested id.
    NotFound(String),
    /// The adapter does not implement the requested capability.
    Unsupported(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Adapter(msg) => write!(f, "adapter: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Bus(msg) => write!(f, "bus: {msg}"),
            Self::Queue(msg) => write!(f, "queue: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {err}"))
    }
}
