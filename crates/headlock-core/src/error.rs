//! Error types for Headlock Core

use thiserror::Error;

use crate::session::SessionState;

/// Result type alias using Headlock Error
pub type Result<T> = std::result::Result<T, Error>;

/// Headlock error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} already has an agent waiting")]
    AlreadyWaiting(String),

    #[error("Session {0} has no agent waiting for an instruction")]
    NotWaiting(String),

    #[error("Session {0} is already active")]
    AlreadyActive(String),

    #[error("Cannot {operation} session {session_id} in state {state}")]
    InvalidTransition {
        session_id: String,
        state: SessionState,
        operation: &'static str,
    },

    #[error("Wait on session {0} timed out")]
    TimedOut(String),

    #[error("Wait on session {0} was cancelled")]
    Cancelled(String),

    #[error("Session limit of {0} reached")]
    CapacityExceeded(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Short machine-readable code, used by transports in error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyWaiting(_) => "already_waiting",
            Error::NotWaiting(_) => "not_waiting",
            Error::AlreadyActive(_) => "already_active",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::TimedOut(_) => "timed_out",
            Error::Cancelled(_) => "cancelled",
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}
