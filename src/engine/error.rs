use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a reservation was refused by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    SlotTaken,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::SlotTaken => "slot_taken",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyReason {
    BookingLimit,
}

impl PolicyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyReason::BookingLimit => "booking_limit",
        }
    }
}

/// Workflow actions an authority may take on a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Cancel,
    Complete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Cancel => "cancel",
            Action::Complete => "complete",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("{}: overlaps booking {with}", reason.as_str())]
    Conflict { reason: ConflictReason, with: Ulid },

    #[error("{}: try again on {retry_after}", reason.as_str())]
    PolicyViolation {
        reason: PolicyReason,
        retry_after: NaiveDate,
    },

    #[error("cannot {} a {} booking", action.as_str(), from.as_str())]
    InvalidTransition { from: BookingStatus, action: Action },

    #[error("provider {0} still has active bookings")]
    HasActiveBookings(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
