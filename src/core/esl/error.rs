//! Error types for the event-socket layer.

use std::time::Duration;

/// Errors surfaced by the switch connection layer.
///
/// Transport failures are recovered inside the manager via reconnect and
/// never propagate past the session layer; command failures degrade into
/// session-level error transitions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EslError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("connection lost")]
    ConnectionLost,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("switch rejected command: {0}")]
    CommandFailed(String),
    #[error("unknown switch instance: {0}")]
    UnknownInstance(String),
}

pub type EslResult<T> = Result<T, EslError>;
