use ulid::Ulid;

use crate::model::{Facility, ReservationStatus, Transition};

/// Message shown for a slot clash.
pub const CONFLICT_MESSAGE: &str =
    "This time slot is already reserved. Please choose a different time.";

/// Message shown for any failure to persist.
pub const PERSISTENCE_MESSAGE: &str = "Failed to save reservation. Please try again.";

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing request field.
    Validation(String),
    /// Request exceeds an input size limit.
    LimitExceeded(&'static str),
    NotFound(Ulid),
    /// Slot already taken on this facility.
    Conflict(Facility),
    /// Business rule turned the request away (hard caps, late guest lists).
    Rejected(String),
    Unauthorized(String),
    InvalidTransition {
        id: Ulid,
        status: ReservationStatus,
        transition: Transition,
    },
    JournalError(String),
}

/// Coarse class of an [`EngineError`], for callers that map errors to
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Rejected,
    Unauthorized,
    InvalidTransition,
    Persistence,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) | EngineError::Rejected(_) => ErrorKind::Rejected,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::JournalError(_) => ErrorKind::Persistence,
        }
    }

    /// Text safe to show a member. Persistence details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::JournalError(_) => PERSISTENCE_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Rejected(_) => "rejected",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::JournalError(_) => "journal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => f.write_str(msg),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(_) => f.write_str(CONFLICT_MESSAGE),
            EngineError::Rejected(reason) => f.write_str(reason),
            EngineError::Unauthorized(msg) => write!(f, "not authorized: {msg}"),
            EngineError::InvalidTransition {
                id,
                status,
                transition,
            } => write!(
                f,
                "cannot {} reservation {id}: status is {status}",
                transition.as_str()
            ),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
