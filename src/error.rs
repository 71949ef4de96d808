//! Error taxonomy for the collab core.
//!
//! Every user-visible failure boils down to a single `ERROR` wire frame
//! carrying one of these reasons, never an uncaught panic.

use serde::Serialize;

/// The `reason` code carried on an outbound `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Malformed or out-of-bounds frame; the frame is dropped, the session continues.
    #[error("validation failed")]
    ValidationFailed,
    /// Token bucket exhausted; the frame is dropped, the session continues.
    #[error("rate limited")]
    RateLimited,
    /// Outbound queue overflowed; the frame is dropped, the session continues.
    #[error("backpressure")]
    Backpressure,
    /// Client claims a version the room has not yet reached.
    #[error("operation rejected: version ahead of room")]
    OpRejectedVersionAhead,
    /// Client's base version predates the retained history window.
    #[error("operation rejected: version older than retained history")]
    OpRejectedVersionStale,
    /// A transformed delete's payload no longer matches the document content.
    #[error("operation rejected: precondition failed")]
    OpRejectedPrecondition,
    /// Same `clientId` reconnected; this session is displaced and closed.
    #[error("preempted by a newer session for the same client")]
    Preempted,
    /// Two consecutive heartbeat misses; session closed.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    /// Server is shutting down.
    #[error("server shutting down")]
    Shutdown,
    /// Unexpected internal failure; session closed, room continues.
    #[error("internal error")]
    Internal,
}

/// A field-level validation failure, naming the offending field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("validation failed on field `{field}`: {reason}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `operation.payload`.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

impl ValidationError {
    /// Construct a new validation error.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Rejection reasons returned by the OT engine's `integrate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// `v_c > current_version`.
    #[error("client version is ahead of the room")]
    VersionAhead,
    /// `v_c` predates the retained history window.
    #[error("client version predates retained history")]
    VersionStale,
    /// The transformed op's precondition failed when applied.
    #[error("precondition failed applying transformed operation")]
    Precondition,
}

impl From<EngineError> for ErrorReason {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::VersionAhead => ErrorReason::OpRejectedVersionAhead,
            EngineError::VersionStale => ErrorReason::OpRejectedVersionStale,
            EngineError::Precondition => ErrorReason::OpRejectedPrecondition,
        }
    }
}
