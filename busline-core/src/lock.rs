use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-bounded exclusive claim on one seat of one trip.
/// Never mutated in place: extending a hold means issuing a new lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatLock {
    pub trip_id: Uuid,
    pub seat_id: String,
    pub holder_booking_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SeatLock {
    /// A lock whose `expires_at` has passed is treated as absent, swept or not.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// What currently occupies a seat in the lock store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatClaim {
    Held(SeatLock),
    /// The lock was converted into a durable seat booking.
    Booked {
        trip_id: Uuid,
        seat_id: String,
        booking_id: Uuid,
        booked_at: DateTime<Utc>,
    },
}

impl SeatClaim {
    pub fn seat_id(&self) -> &str {
        match self {
            SeatClaim::Held(lock) => &lock.seat_id,
            SeatClaim::Booked { seat_id, .. } => seat_id,
        }
    }

    pub fn booking_id(&self) -> Uuid {
        match self {
            SeatClaim::Held(lock) => lock.holder_booking_id,
            SeatClaim::Booked { booking_id, .. } => *booking_id,
        }
    }

    /// Blocks other bookings from taking the seat at `now`.
    pub fn blocks(&self, now: DateTime<Utc>) -> bool {
        match self {
            SeatClaim::Held(lock) => lock.is_live(now),
            SeatClaim::Booked { .. } => true,
        }
    }
}

/// Sorts seat ids into the canonical order every multi-seat operation uses.
pub fn canonical_seats(seat_ids: &[String]) -> Vec<String> {
    let mut sorted = seat_ids.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}
