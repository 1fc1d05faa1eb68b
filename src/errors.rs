//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Remote file transport failure (read, write, list).
    Transport(String),
    /// Planning/generation collaborator failure.
    Planner(String),
    /// Generated content failed static validation.
    Validation(String),
    /// Health probe failure that is not a plain unhealthy verdict.
    Probe(String),
    /// Session lock could not be acquired within its timeout.
    LockTimeout(String),
    /// Call fast-rejected because the named circuit breaker is open.
    BreakerOpen(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller supplied input the current task state cannot accept.
    InvalidInput(String),
    /// Operation conflicts with the task's queue position or state.
    Conflict(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Planner(msg) => write!(f, "planner: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Probe(msg) => write!(f, "probe: {msg}"),
            Self::LockTimeout(msg) => write!(f, "lock timeout: {msg}"),
            Self::BreakerOpen(msg) => write!(f, "breaker open: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
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
