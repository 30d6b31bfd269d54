//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Job specification cannot be mapped to a valid engine invocation.
    InvalidJobSpec(String),
    /// The engine process could not be launched.
    ProcessSpawnFailed(String),
    /// The engine exited without being asked to.
    UnexpectedExit(String),
    /// The status stream stayed unparsable past the tolerance threshold.
    StatusStreamMalformed(String),
    /// A checkpoint record is missing or failed its integrity check.
    CorruptCheckpoint(String),
    /// Control request not permitted from the session's current state.
    InvalidTransition(String),
    /// The engine reported a compute device failure.
    DeviceError(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// IPC communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// The orchestration engine is shutting down.
    Shutdown(String),
}

/// Stable, serializable error classification surfaced to callers and
/// observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`AppError::InvalidJobSpec`].
    InvalidJobSpec,
    /// See [`AppError::ProcessSpawnFailed`].
    ProcessSpawnFailed,
    /// See [`AppError::UnexpectedExit`].
    UnexpectedExit,
    /// See [`AppError::StatusStreamMalformed`].
    StatusStreamMalformed,
    /// See [`AppError::CorruptCheckpoint`].
    CorruptCheckpoint,
    /// See [`AppError::InvalidTransition`].
    InvalidTransition,
    /// See [`AppError::DeviceError`].
    DeviceError,
    /// See [`AppError::Config`].
    Config,
    /// See [`AppError::Db`].
    Db,
    /// See [`AppError::Io`].
    Io,
    /// See [`AppError::Ipc`].
    Ipc,
    /// See [`AppError::NotFound`].
    NotFound,
    /// See [`AppError::Shutdown`].
    Shutdown,
}

impl AppError {
    /// Stable kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidJobSpec(_) => ErrorKind::InvalidJobSpec,
            Self::ProcessSpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            Self::UnexpectedExit(_) => ErrorKind::UnexpectedExit,
            Self::StatusStreamMalformed(_) => ErrorKind::StatusStreamMalformed,
            Self::CorruptCheckpoint(_) => ErrorKind::CorruptCheckpoint,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::DeviceError(_) => ErrorKind::DeviceError,
            Self::Config(_) => ErrorKind::Config,
            Self::Db(_) => ErrorKind::Db,
            Self::Io(_) => ErrorKind::Io,
            Self::Ipc(_) => ErrorKind::Ipc,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    /// Human-readable detail without the kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::InvalidJobSpec(msg)
            | Self::ProcessSpawnFailed(msg)
            | Self::UnexpectedExit(msg)
            | Self::StatusStreamMalformed(msg)
            | Self::CorruptCheckpoint(msg)
            | Self::InvalidTransition(msg)
            | Self::DeviceError(msg)
            | Self::Config(msg)
            | Self::Db(msg)
            | Self::Io(msg)
            | Self::Ipc(msg)
            | Self::NotFound(msg)
            | Self::Shutdown(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJobSpec(msg) => write!(f, "invalid job spec: {msg}"),
            Self::ProcessSpawnFailed(msg) => write!(f, "process spawn failed: {msg}"),
            Self::UnexpectedExit(msg) => write!(f, "unexpected exit: {msg}"),
            Self::StatusStreamMalformed(msg) => write!(f, "status stream malformed: {msg}"),
            Self::CorruptCheckpoint(msg) => write!(f, "corrupt checkpoint: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::DeviceError(msg) => write!(f, "device error: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
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
