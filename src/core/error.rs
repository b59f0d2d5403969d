use serde::Serialize;
use std::fmt;

/// Discriminant for PTY errors, serialized to the frontend for programmatic
/// error handling (e.g., distinguishing "session gone" from "write failed").
#[derive(Debug, Clone, Serialize)]
pub enum PtyErrorCode {
    SpawnFailed,
    SessionNotFound,
    WriteFailed,
    ResizeFailed,
    KillFailed,
    IdOverflow,
}

/// Structured PTY error with a machine-readable code and human-readable message.
///
/// Serialized as JSON to the Tauri frontend. Implements `std::error::Error`
/// so it can be used with `?` in command handlers. Constructors are provided
/// for each error variant to keep call sites concise.
#[derive(Debug, Clone, Serialize)]
pub struct PtyError {
    pub code: PtyErrorCode,
    pub message: String,
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for PtyError {}

impl PtyError {
    /// PTY or shell process could not be created.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::SpawnFailed,
            message: msg.into(),
        }
    }

    /// No channel exists with the given id (already killed or never created).
    pub fn session_not_found(id: impl fmt::Display) -> Self {
        Self {
            code: PtyErrorCode::SessionNotFound,
            message: format!("channel {} not found", id),
        }
    }

    /// Writing to the PTY stdin failed (lock poison or I/O error).
    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::WriteFailed,
            message: msg.into(),
        }
    }

    /// PTY resize (SIGWINCH propagation) failed.
    pub fn resize_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::ResizeFailed,
            message: msg.into(),
        }
    }

    /// Session termination (SIGTERM/SIGKILL) failed.
    pub fn kill_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::KillFailed,
            message: msg.into(),
        }
    }

    /// Atomic session ID counter overflowed u32::MAX.
    pub fn id_overflow() -> Self {
        Self {
            code: PtyErrorCode::IdOverflow,
            message: "channel id counter overflowed u32::MAX".to_string(),
        }
    }
}

/// Errors from the Session state machine and the Session Manager surface
/// that sits above it. Unlike `PtyError`, callers generally only need the
/// message (`?` into a command handler that returns `Result<T, String>`-ish
/// shapes), so this follows the `GitError` idiom: `thiserror` derive plus a
/// custom `Serialize` impl that collapses the enum to its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is not in Ready state")]
    NotReady(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} has no peer paired")]
    NotPaired(String),

    #[error("send to peer session {0} failed: peer not ready")]
    SendFailed(String),

    #[error("confirmation template missing for scenario '{0}'")]
    TemplateMissing(String),

    #[error("pty error: {0}")]
    Pty(#[from] PtyError),
}

impl Serialize for SessionError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
