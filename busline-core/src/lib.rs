pub mod booking;
pub mod clock;
pub mod collaborators;
pub mod lock;
pub mod memory;
pub mod payment;
pub mod queue;
pub mod repository;

use uuid::Uuid;
use booking::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Seats unavailable on trip {trip_id}: {seat_ids:?}")]
    SeatConflict {
        trip_id: Uuid,
        seat_ids: Vec<String>,
    },
    #[error("Booking {booking_id} cannot move from {from} to {to}")]
    InvalidTransition {
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Trip not bookable: {0}")]
    TripNotBookable(String),
    #[error("Booking reference already taken: {0}")]
    DuplicateReference(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("{service} call failed: {message}")]
    Collaborator {
        service: String,
        message: String,
        retryable: bool,
    },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Conflicts are business outcomes the caller reports to the user; they are never retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::SeatConflict { .. } | CoreError::InvalidTransition { .. })
    }

    /// Failures worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Storage(_) => true,
            CoreError::Collaborator { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
