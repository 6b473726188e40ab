//! The stable `error.code` vocabulary shared by the session manager and the
//! dispatcher (spec §7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownMessageType,
    MaxSessionsReached,
    SessionNotFound,
    SessionNotRunning,
    SpawnFailed,
    InputTooLarge,
    InvalidResize,
    ResizeFailed,
    RateLimitExceeded,
    NotAttached,
    InternalError,
}

/// An operator-readable failure from a session-manager operation, carrying
/// the wire-stable code it should be reported under.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ManagerError {
    pub code: ErrorCode,
    pub message: String,
}

impl ManagerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn session_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::SessionNotFound, format!("Session does not exist: {id}"))
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
