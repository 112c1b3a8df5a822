//! In-memory implementations of the store and collaborator traits.
//! Used by tests and for running the service without infrastructure.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use busline_shared::BookingNotification;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, StatusPatch};
use crate::collaborators::{Notifier, PaymentGateway, TripCatalog, TripDetails, UserDirectory, UserProfile};
use crate::lock::{SeatClaim, SeatLock};
use crate::payment::{TransactionSnapshot, TransactionStatus};
use crate::queue::DelayedJob;
use crate::repository::{BookingRepository, DelayedQueue, SeatLockStore};
use crate::{CoreError, CoreResult};

#[derive(Default)]
pub struct InMemoryBookingRepository {
    bookings: Mutex<HashMap<Uuid, Booking>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn insert(&self, booking: &Booking) -> CoreResult<()> {
        let mut bookings = self.bookings.lock().await;
        if bookings.values().any(|b| b.booking_reference == booking.booking_reference) {
            return Err(CoreError::DuplicateReference(booking.booking_reference.clone()));
        }
        if bookings.contains_key(&booking.id) {
            return Err(CoreError::Storage(format!("booking {} already exists", booking.id)));
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        Ok(self.bookings.lock().await.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> CoreResult<Vec<Booking>> {
        let bookings = self.bookings.lock().await;
        let mut found: Vec<Booking> = bookings.values().filter(|b| b.user_id == user_id).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        patch: StatusPatch,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let mut bookings = self.bookings.lock().await;
        let booking = match bookings.get_mut(&id) {
            Some(b) if b.status == from => b,
            _ => return Ok(None),
        };

        booking.status = to;
        booking.updated_at = now;
        if let Some(deadline) = patch.retry_deadline {
            booking.retry_deadline = Some(deadline);
        }
        if let Some(confirmed_at) = patch.confirmed_at {
            booking.confirmed_at = Some(confirmed_at);
        }
        if let Some(reason) = patch.cancel_reason {
            booking.cancel_reason = Some(reason);
        }
        Ok(Some(booking.clone()))
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let mut bookings = self.bookings.lock().await;
        Ok(bookings.get_mut(&id).map(|booking| {
            booking.payment_status = status;
            if payment_order_id.is_some() {
                booking.payment_order_id = payment_order_id;
            }
            booking.updated_at = now;
            booking.clone()
        }))
    }

    async fn mark_reminder_sent(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut bookings = self.bookings.lock().await;
        match bookings.get_mut(&id) {
            Some(booking) if booking.reminder_sent_at.is_none() => {
                booking.reminder_sent_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_overdue_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let bookings = self.bookings.lock().await;
        let mut found: Vec<Booking> = bookings.values().filter(|b| b.is_payment_overdue(now)).cloned().collect();
        found.sort_by_key(|b| b.payment_deadline);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn find_lapsed_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let bookings = self.bookings.lock().await;
        let mut found: Vec<Booking> = bookings.values().filter(|b| b.retry_window_elapsed(now)).cloned().collect();
        found.sort_by_key(|b| b.retry_deadline);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }
}

/// Seat claims keyed by `(trip, seat)`. One mutex section per call makes
/// multi-seat operations atomic.
#[derive(Default)]
pub struct InMemorySeatLockStore {
    claims: Mutex<BTreeMap<(Uuid, String), SeatClaim>>,
}

impl InMemorySeatLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored claim, lapsed ones included.
    pub async fn raw_claims(&self) -> Vec<SeatClaim> {
        self.claims.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl SeatLockStore for InMemorySeatLockStore {
    async fn acquire(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatLock>> {
        let mut claims = self.claims.lock().await;

        let conflicts: Vec<String> = seat_ids
            .iter()
            .filter(|seat_id| match claims.get(&(trip_id, seat_id.to_string())) {
                None => false,
                Some(SeatClaim::Booked { .. }) => true,
                Some(SeatClaim::Held(lock)) => lock.holder_booking_id != booking_id && lock.is_live(now),
            })
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            return Err(CoreError::SeatConflict { trip_id, seat_ids: conflicts });
        }

        let locks: Vec<SeatLock> = seat_ids
            .iter()
            .map(|seat_id| SeatLock {
                trip_id,
                seat_id: seat_id.clone(),
                holder_booking_id: booking_id,
                acquired_at: now,
                expires_at,
            })
            .collect();
        for lock in &locks {
            claims.insert((trip_id, lock.seat_id.clone()), SeatClaim::Held(lock.clone()));
        }
        Ok(locks)
    }

    async fn release(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<usize> {
        let mut claims = self.claims.lock().await;
        let mut removed = 0;
        for seat_id in seat_ids {
            let key = (trip_id, seat_id.clone());
            if claims.get(&key).is_some_and(|claim| claim.booking_id() == booking_id) {
                claims.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn convert(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut claims = self.claims.lock().await;

        let conflicts: Vec<String> = seat_ids
            .iter()
            .filter(|seat_id| match claims.get(&(trip_id, seat_id.to_string())) {
                None => false,
                Some(claim) => claim.booking_id() != booking_id && claim.blocks(now),
            })
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            return Err(CoreError::SeatConflict { trip_id, seat_ids: conflicts });
        }

        for seat_id in seat_ids {
            let key = (trip_id, seat_id.clone());
            if matches!(claims.get(&key), Some(SeatClaim::Booked { booking_id: owner, .. }) if *owner == booking_id) {
                continue;
            }
            claims.insert(
                key,
                SeatClaim::Booked {
                    trip_id,
                    seat_id: seat_id.clone(),
                    booking_id,
                    booked_at: now,
                },
            );
        }
        Ok(())
    }

    async fn restore(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let mut claims = self.claims.lock().await;
        let mut restored = 0;
        for seat_id in seat_ids {
            let key = (trip_id, seat_id.clone());
            if matches!(claims.get(&key), Some(SeatClaim::Booked { booking_id: owner, .. }) if *owner == booking_id) {
                claims.insert(
                    key,
                    SeatClaim::Held(SeatLock {
                        trip_id,
                        seat_id: seat_id.clone(),
                        holder_booking_id: booking_id,
                        acquired_at: now,
                        expires_at,
                    }),
                );
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn clean_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let mut claims = self.claims.lock().await;
        let before = claims.len();
        claims.retain(|_, claim| match claim {
            SeatClaim::Held(lock) => lock.expires_at >= cutoff,
            SeatClaim::Booked { .. } => true,
        });
        Ok(before - claims.len())
    }

    async fn claims(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatClaim>> {
        let claims = self.claims.lock().await;
        Ok(claims
            .iter()
            .filter(|((trip, _), claim)| *trip == trip_id && claim.blocks(now))
            .map(|(_, claim)| claim.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryDelayedQueue {
    jobs: Mutex<Vec<DelayedJob>>,
    failing_enqueues: AtomicUsize,
}

impl InMemoryDelayedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` enqueues fail with a storage error.
    pub fn fail_next_enqueues(&self, count: usize) {
        self.failing_enqueues.store(count, Ordering::SeqCst);
    }

    /// Jobs not yet acked, claimed or not.
    pub async fn pending(&self) -> Vec<DelayedJob> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl DelayedQueue for InMemoryDelayedQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Uuid> {
        let failing = self
            .failing_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(CoreError::Storage("queue unavailable".to_string()));
        }

        let job = DelayedJob::new(queue_name, payload, not_before, now);
        let id = job.id;
        self.jobs.lock().await.push(job);
        Ok(id)
    }

    async fn poll(
        &self,
        queue_name: &str,
        max_items: usize,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> CoreResult<Vec<DelayedJob>> {
        let mut jobs = self.jobs.lock().await;
        jobs.sort_by_key(|job| job.not_before);

        let mut claimed = Vec::new();
        for job in jobs.iter_mut() {
            if claimed.len() >= max_items {
                break;
            }
            if job.queue_name == queue_name && job.is_visible(now, visibility) {
                job.dequeued_at = Some(now);
                job.attempts += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, job_id: Uuid) -> CoreResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| job.id != job_id);
        Ok(jobs.len() != before)
    }
}

/// Trip catalog backed by a map. Seat-label lookups and seat booking can be
/// switched off to exercise degraded paths.
pub struct InMemoryTripCatalog {
    trips: Mutex<HashMap<Uuid, TripDetails>>,
    booked: Mutex<HashMap<(Uuid, String), Uuid>>,
    labels_available: AtomicBool,
    booking_available: AtomicBool,
}

impl Default for InMemoryTripCatalog {
    fn default() -> Self {
        Self {
            trips: Mutex::new(HashMap::new()),
            booked: Mutex::new(HashMap::new()),
            labels_available: AtomicBool::new(true),
            booking_available: AtomicBool::new(true),
        }
    }
}

impl InMemoryTripCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_trip(&self, trip: TripDetails) {
        self.trips.lock().await.insert(trip.trip_id, trip);
    }

    pub fn set_labels_available(&self, available: bool) {
        self.labels_available.store(available, Ordering::SeqCst);
    }

    pub fn set_booking_available(&self, available: bool) {
        self.booking_available.store(available, Ordering::SeqCst);
    }

    pub async fn booked_by(&self, trip_id: Uuid, seat_id: &str) -> Option<Uuid> {
        self.booked.lock().await.get(&(trip_id, seat_id.to_string())).copied()
    }
}

#[async_trait]
impl TripCatalog for InMemoryTripCatalog {
    async fn trip(&self, trip_id: Uuid) -> CoreResult<TripDetails> {
        self.trips
            .lock()
            .await
            .get(&trip_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))
    }

    async fn seat_labels(&self, _trip_id: Uuid, seat_ids: &[String]) -> CoreResult<Vec<String>> {
        if !self.labels_available.load(Ordering::SeqCst) {
            return Err(CoreError::Collaborator {
                service: "trip-service".to_string(),
                message: "seat lookup unavailable".to_string(),
                retryable: true,
            });
        }
        Ok(seat_ids.iter().map(|id| format!("No. {}", id)).collect())
    }

    async fn mark_seats_booked(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()> {
        if !self.booking_available.load(Ordering::SeqCst) {
            return Err(CoreError::Collaborator {
                service: "trip-service".to_string(),
                message: "status 503".to_string(),
                retryable: true,
            });
        }
        let mut booked = self.booked.lock().await;
        for seat_id in seat_ids {
            booked.insert((trip_id, seat_id.clone()), booking_id);
        }
        Ok(())
    }

    async fn release_seats(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()> {
        let mut booked = self.booked.lock().await;
        for seat_id in seat_ids {
            let key = (trip_id, seat_id.clone());
            if booked.get(&key) == Some(&booking_id) {
                booked.remove(&key);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<Uuid, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: UserProfile) {
        self.users.lock().await.insert(user.user_id, user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn user(&self, user_id: Uuid) -> CoreResult<UserProfile> {
        self.users
            .lock()
            .await
            .get(&user_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("user {}", user_id)))
    }
}

#[derive(Default)]
pub struct InMemoryPaymentGateway {
    transactions: Mutex<HashMap<Uuid, TransactionSnapshot>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, booking_id: Uuid, status: TransactionStatus, payment_order_id: Option<String>) {
        self.transactions.lock().await.insert(
            booking_id,
            TransactionSnapshot {
                booking_id,
                status,
                payment_order_id,
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn transaction_status(&self, booking_id: Uuid) -> CoreResult<TransactionSnapshot> {
        self.transactions
            .lock()
            .await
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("transaction for booking {}", booking_id)))
    }
}

/// Keeps every notification it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<BookingNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<BookingNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &BookingNotification) -> CoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Collaborator {
                service: "notifier".to_string(),
                message: "broker unavailable".to_string(),
                retryable: true,
            });
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}
