use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, StatusPatch};
use crate::lock::{SeatClaim, SeatLock};
use crate::payment::TransactionStatus;
use crate::queue::DelayedJob;
use crate::CoreResult;

/// Repository trait for booking data access
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Insert a new booking with its seats. Fails with `DuplicateReference`
    /// when the booking reference is already taken.
    async fn insert(&self, booking: &Booking) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>>;

    async fn list_for_user(&self, user_id: Uuid) -> CoreResult<Vec<Booking>>;

    /// Atomically move `id` from `from` to `to`. Returns `None` when the booking
    /// is no longer in `from` (another actor got there first).
    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        patch: StatusPatch,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>>;

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>>;

    /// Returns `true` only for the first caller.
    async fn mark_reminder_sent(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool>;

    /// `PENDING_PAYMENT` bookings whose payment deadline is before `now`.
    async fn find_overdue_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;

    /// `EXPIRED` bookings whose retry deadline is before `now`.
    async fn find_lapsed_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;
}

/// Storage for seat locks and their durable conversions.
/// Multi-seat operations are all-or-nothing and receive seats in canonical order.
#[async_trait]
pub trait SeatLockStore: Send + Sync {
    /// Claim every seat or none. A lock lapsed at `now` counts as absent;
    /// a seat held by `booking_id` itself is re-issued.
    async fn acquire(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatLock>>;

    /// Remove claims owned by `booking_id`. Returns how many were removed.
    async fn release(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<usize>;

    /// Turn the seats into durable booked markers for `booking_id`.
    async fn convert(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Turn booked markers owned by `booking_id` back into held locks
    /// expiring at `expires_at`. Returns how many seats were restored.
    async fn restore(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<usize>;

    /// Delete held locks with `expires_at < cutoff`.
    async fn clean_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<usize>;

    /// Claims on `trip_id` that still block other bookings at `now`.
    async fn claims(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatClaim>>;
}

/// Time-ordered work queue with poll-and-hide claiming.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// `now` is stamped as the job's creation time.
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Uuid>;

    /// Claim up to `max_items` visible jobs, hiding them for `visibility`.
    async fn poll(
        &self,
        queue_name: &str,
        max_items: usize,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> CoreResult<Vec<DelayedJob>>;

    /// Delete a processed job. Returns `false` if it was already gone.
    async fn ack(&self, job_id: Uuid) -> CoreResult<bool>;
}
