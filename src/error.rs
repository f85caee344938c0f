//! Caller-facing error taxonomy for attendance and punch actions.
//!
//! Every variant is recoverable: the caller shows a notice and may retry once
//! the relevant lock has been released.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Why an action was refused before anything was sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Rejection {
    NoOpenWindow,
    AlreadyPunchedIn,
    NotPunchedIn,
    ActionInFlight,
    SupervisorCannotPunch,
    NotSupervisor,
    InvalidDuration,
    EmptyMessage,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::NoOpenWindow => "attendance is not open for this classroom",
            Rejection::AlreadyPunchedIn => "already punched for this attendance window",
            Rejection::NotPunchedIn => "punch in before punching out",
            Rejection::ActionInFlight => "a request for this classroom is already in flight",
            Rejection::SupervisorCannotPunch => "teachers cannot punch in or out",
            Rejection::NotSupervisor => "only teachers can start or stop attendance",
            Rejection::InvalidDuration => "attendance duration must be at least one minute",
            Rejection::EmptyMessage => "message is empty",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("rejected: {0}")]
    PreconditionRejected(Rejection),

    #[error("location permission denied: {0}")]
    LocationDenied(String),

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("server rejected request: {0}")]
    ServerRejected(String),
}

impl PresenceError {
    pub fn rejected(reason: Rejection) -> Self {
        PresenceError::PreconditionRejected(reason)
    }

    /// Precondition failures are reported synchronously and never touch the network.
    pub fn is_precondition(&self) -> bool {
        matches!(self, PresenceError::PreconditionRejected(_))
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }
}

impl From<Rejection> for PresenceError {
    fn from(reason: Rejection) -> Self {
        PresenceError::PreconditionRejected(reason)
    }
}

pub type PresenceResult<T> = Result<T, PresenceError>;
