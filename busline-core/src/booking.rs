use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payment::TransactionStatus;
use crate::CoreError;

pub const REFERENCE_PREFIX: &str = "BK";
pub const REFERENCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const REFERENCE_SUFFIX_LEN: usize = 4;

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Cancelled,
    Expired,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "PENDING_PAYMENT",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
            BookingStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_PAYMENT" => Ok(BookingStatus::PendingPayment),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "EXPIRED" => Ok(BookingStatus::Expired),
            "FAILED" => Ok(BookingStatus::Failed),
            other => Err(CoreError::ValidationError(format!("unknown booking status {}", other))),
        }
    }
}

/// The aggregate root of a reservation. Never deleted; terminal states are kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub trip_id: Uuid,
    pub booking_reference: String,
    /// Selection order is preserved.
    pub seats: Vec<String>,
    pub status: BookingStatus,
    pub payment_status: TransactionStatus,
    pub payment_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payment_deadline: DateTime<Utc>,
    pub retry_deadline: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub reminder_sent_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        trip_id: Uuid,
        seats: Vec<String>,
        booking_reference: String,
        created_at: DateTime<Utc>,
        payment_timeout: Duration,
    ) -> Self {
        Self {
            id,
            user_id,
            trip_id,
            booking_reference,
            seats,
            status: BookingStatus::PendingPayment,
            payment_status: TransactionStatus::Pending,
            payment_order_id: None,
            created_at,
            updated_at: created_at,
            payment_deadline: created_at + payment_timeout,
            retry_deadline: None,
            confirmed_at: None,
            cancel_reason: None,
            reminder_sent_at: None,
        }
    }

    /// Still waiting for payment but past the nominal deadline.
    pub fn is_payment_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::PendingPayment && self.payment_deadline < now
    }

    /// Expired, but a late payment would still be honoured.
    pub fn in_retry_window(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Expired
            && self.retry_deadline.is_some_and(|deadline| now <= deadline)
    }

    pub fn retry_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Expired
            && self.retry_deadline.is_some_and(|deadline| deadline < now)
    }

    pub fn seat_rows(&self) -> Vec<BookingSeat> {
        self.seats
            .iter()
            .enumerate()
            .map(|(position, seat_id)| BookingSeat {
                booking_id: self.id,
                seat_id: seat_id.clone(),
                position: position as i32,
            })
            .collect()
    }
}

/// Join row between a booking and an external seat identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingSeat {
    pub booking_id: Uuid,
    pub seat_id: String,
    pub position: i32,
}

/// Fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub retry_deadline: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

/// Input for a new reservation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub user_id: Uuid,
    pub trip_id: Uuid,
    pub seat_ids: Vec<String>,
    /// Booking id a standalone seat hold was taken under. The booking adopts
    /// it, so the held seats pass to the booking without being released.
    #[serde(default)]
    pub hold_id: Option<Uuid>,
}

/// `BK` + `YYMMDD` of the creation date + a random suffix from `A-Z0-9`.
/// Uniqueness is enforced by the store; callers regenerate on collision.
pub fn generate_reference<R: Rng + ?Sized>(created_at: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..REFERENCE_SUFFIX_LEN)
        .map(|_| REFERENCE_CHARSET[rng.gen_range(0..REFERENCE_CHARSET.len())] as char)
        .collect();
    format!("{}{}{}", REFERENCE_PREFIX, created_at.format("%y%m%d"), suffix)
}

/// Rejects empty, blank, or repeated seat ids.
pub fn validate_seat_ids(seat_ids: &[String]) -> Result<(), CoreError> {
    if seat_ids.is_empty() {
        return Err(CoreError::ValidationError("at least one seat is required".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for seat_id in seat_ids {
        if seat_id.trim().is_empty() {
            return Err(CoreError::ValidationError("seat id must not be blank".to_string()));
        }
        if !seen.insert(seat_id.as_str()) {
            return Err(CoreError::ValidationError(format!("seat {} requested twice", seat_id)));
        }
    }
    Ok(())
}
