use thiserror::Error;
use ulid::Ulid;

use crate::model::CalendarDate;

/// Failure reading or writing the backing store. Kept apart from "no slots"
/// so callers can tell "failed to load" from "closed" or "fully booked".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store returned corrupt data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("course not found: {0}")]
    CourseNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("slot {slot_id} is not offered on {date}")]
    SlotNotOffered { slot_id: Ulid, date: CalendarDate },
    #[error("capacity exceeded: {requested} requested, {remaining} remaining")]
    CapacityExceeded { requested: u32, remaining: u32 },
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: crate::model::BookingStatus,
        to: crate::model::BookingStatus,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            EngineError::WalError(_) => true,
            _ => false,
        }
    }
}
