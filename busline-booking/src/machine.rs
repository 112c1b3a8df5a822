use busline_core::booking::{generate_reference, validate_seat_ids, Booking, BookingStatus, NewBooking, StatusPatch};
use busline_core::payment::TransactionStatus;
use busline_core::queue::TRIP_REMINDER_QUEUE;
use busline_core::{CoreError, CoreResult};
use busline_shared::{BookingNotification, NotificationKind};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::locks::SeatLockManager;
use crate::settings::BookingSettings;
use crate::Services;

const REFERENCE_ATTEMPTS: usize = 3;
const REMINDER_ENQUEUE_ATTEMPTS: usize = 3;

enum Commit {
    /// This call moved the booking from the given status.
    Applied(Booking, BookingStatus),
    /// Another caller confirmed it first.
    AlreadyConfirmed(Booking),
}

/// Owns booking status and the timers that govern it.
///
/// Every status write goes through `transition_status` keyed on the status
/// read beforehand, so two actors racing on one booking cannot both win.
pub struct BookingStateMachine {
    services: Services,
    locks: SeatLockManager,
    settings: BookingSettings,
}

impl BookingStateMachine {
    pub fn new(services: Services, settings: BookingSettings) -> Self {
        let locks = SeatLockManager::new(services.locks.clone(), services.clock.clone());
        Self { services, locks, settings }
    }

    pub fn locks(&self) -> &SeatLockManager {
        &self.locks
    }

    pub fn settings(&self) -> &BookingSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Reserve the seats and open a booking awaiting payment.
    pub async fn create(&self, request: NewBooking) -> CoreResult<Booking> {
        validate_seat_ids(&request.seat_ids)?;

        let now = self.now();
        let trip = self.services.trips.trip(request.trip_id).await?;
        if !trip.is_bookable(now) {
            return Err(CoreError::TripNotBookable(format!(
                "trip {} is {:?} and departs at {}",
                trip.trip_id, trip.status, trip.departure_time
            )));
        }

        let booking_id = match request.hold_id {
            Some(hold_id) => {
                if self.services.bookings.get(hold_id).await?.is_some() {
                    return Err(CoreError::ValidationError(format!(
                        "hold {} already belongs to a booking",
                        hold_id
                    )));
                }
                hold_id
            }
            None => Uuid::new_v4(),
        };
        self.locks
            .acquire(request.trip_id, &request.seat_ids, booking_id, self.settings.default_timeout)
            .await?;

        let mut last_err = None;
        for _ in 0..REFERENCE_ATTEMPTS {
            let reference = generate_reference(now, &mut rand::thread_rng());
            let booking = Booking::new(
                booking_id,
                request.user_id,
                request.trip_id,
                request.seat_ids.clone(),
                reference,
                now,
                self.settings.payment_timeout,
            );

            match self.services.bookings.insert(&booking).await {
                Ok(()) => {
                    info!(
                        booking_id = %booking.id,
                        reference = %booking.booking_reference,
                        trip_id = %booking.trip_id,
                        payment_deadline = %booking.payment_deadline,
                        "Booking created"
                    );
                    return Ok(booking);
                }
                Err(CoreError::DuplicateReference(reference)) => {
                    debug!(%reference, "Booking reference collision, regenerating");
                    last_err = Some(CoreError::DuplicateReference(reference));
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        if let Err(release_err) = self.locks.release(request.trip_id, &request.seat_ids, booking_id).await {
            warn!(%booking_id, error = %release_err, "Failed to release seats of unsaved booking");
        }
        Err(last_err.unwrap_or_else(|| CoreError::Storage("booking was not persisted".to_string())))
    }

    pub async fn get(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.services
            .bookings
            .get(booking_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", booking_id)))
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> CoreResult<Vec<Booking>> {
        self.services.bookings.list_for_user(user_id).await
    }

    /// Mirror the provider's transaction status without touching booking status.
    pub async fn record_payment_status(
        &self,
        booking_id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
    ) -> CoreResult<Booking> {
        self.services
            .bookings
            .update_payment_status(booking_id, status, payment_order_id, self.now())
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", booking_id)))
    }

    /// Convert the seats into durable bookings and mark the booking paid.
    ///
    /// Allowed from `PENDING_PAYMENT`, or from `EXPIRED` while the retry
    /// window is open. If another booking took one of the seats in the
    /// meantime, this booking fails and the conflict is returned.
    pub async fn confirm(&self, booking_id: Uuid) -> CoreResult<Booking> {
        let now = self.now();
        let booking = self.get(booking_id).await?;
        let expected = match booking.status {
            BookingStatus::Confirmed => return Ok(booking),
            BookingStatus::PendingPayment => BookingStatus::PendingPayment,
            BookingStatus::Expired if booking.in_retry_window(now) => BookingStatus::Expired,
            other => return Err(invalid(booking_id, other, BookingStatus::Confirmed)),
        };

        let trip = self.services.trips.trip(booking.trip_id).await?;

        if let Err(err) = self.locks.convert(booking.trip_id, &booking.seats, booking_id).await {
            if let CoreError::SeatConflict { seat_ids, .. } = &err {
                warn!(%booking_id, seats = ?seat_ids, "Seats were reassigned before payment landed");
                let reason = format!("seats no longer available: {}", seat_ids.join(","));
                if let Err(fail_err) = self.finish_terminal(&booking, expected, BookingStatus::Failed, reason).await {
                    warn!(%booking_id, error = %fail_err, "Could not fail booking after seat conflict");
                }
            }
            return Err(err);
        }

        let (confirmed, from) = match self.commit_confirmation(&booking, expected, now).await {
            Ok(Commit::Applied(confirmed, from)) => (confirmed, from),
            Ok(Commit::AlreadyConfirmed(current)) => return Ok(current),
            Err(err @ CoreError::InvalidTransition { .. }) => {
                self.undo_conversion(&booking).await;
                return Err(err);
            }
            Err(err) => {
                warn!(%booking_id, error = %err, "Confirmation not committed, returning seats to hold");
                self.restore_holds(&booking).await;
                return Err(err);
            }
        };

        info!(%booking_id, reference = %confirmed.booking_reference, %from, "Booking confirmed");

        self.schedule_reminder(&confirmed, trip.departure_time - self.settings.reminder_lead)
            .await;
        self.notify(&confirmed, NotificationKind::BookingConfirmed, None).await;
        Ok(confirmed)
    }

    /// Book the seats in the catalog and move the booking to `CONFIRMED`,
    /// following it into `EXPIRED` if the sweeper got there first.
    async fn commit_confirmation(
        &self,
        booking: &Booking,
        mut expected: BookingStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Commit> {
        self.services
            .trips
            .mark_seats_booked(booking.trip_id, &booking.seats, booking.id)
            .await?;

        let patch = StatusPatch {
            confirmed_at: Some(now),
            ..StatusPatch::default()
        };
        loop {
            if let Some(confirmed) = self
                .services
                .bookings
                .transition_status(booking.id, expected, BookingStatus::Confirmed, patch.clone(), now)
                .await?
            {
                return Ok(Commit::Applied(confirmed, expected));
            }

            let current = self.get(booking.id).await?;
            match current.status {
                BookingStatus::Confirmed => return Ok(Commit::AlreadyConfirmed(current)),
                BookingStatus::Expired if expected == BookingStatus::PendingPayment && current.in_retry_window(now) => {
                    expected = BookingStatus::Expired;
                }
                other => return Err(invalid(booking.id, other, BookingStatus::Confirmed)),
            }
        }
    }

    async fn schedule_reminder(&self, booking: &Booking, remind_at: DateTime<Utc>) {
        let payload = booking.id.to_string();
        for attempt in 1..=REMINDER_ENQUEUE_ATTEMPTS {
            match self
                .services
                .queue
                .enqueue(TRIP_REMINDER_QUEUE, &payload, remind_at, self.now())
                .await
            {
                Ok(job_id) => {
                    debug!(booking_id = %booking.id, %job_id, %remind_at, "Trip reminder scheduled");
                    return;
                }
                Err(err) if attempt < REMINDER_ENQUEUE_ATTEMPTS => {
                    warn!(booking_id = %booking.id, attempt, error = %err, "Reminder enqueue failed, retrying");
                }
                Err(err) => {
                    error!(booking_id = %booking.id, attempts = attempt, error = %err, "Failed to schedule trip reminder");
                }
            }
        }
    }

    /// Release the seats and mark the booking failed. Idempotent on `FAILED`.
    pub async fn fail(&self, booking_id: Uuid, reason: impl Into<String>) -> CoreResult<Booking> {
        let booking = self.get(booking_id).await?;
        let from = match booking.status {
            BookingStatus::Failed => return Ok(booking),
            BookingStatus::PendingPayment | BookingStatus::Expired => booking.status,
            other => return Err(invalid(booking_id, other, BookingStatus::Failed)),
        };
        self.finish_terminal(&booking, from, BookingStatus::Failed, reason.into()).await
    }

    /// Move an overdue pending booking into the retry window. Seat locks are
    /// left to lapse on their own TTL.
    pub async fn expire(&self, booking_id: Uuid) -> CoreResult<Booking> {
        let now = self.now();
        let booking = self.get(booking_id).await?;
        match booking.status {
            BookingStatus::Expired => return Ok(booking),
            BookingStatus::PendingPayment => {}
            other => return Err(invalid(booking_id, other, BookingStatus::Expired)),
        }
        if !booking.is_payment_overdue(now) {
            return Err(CoreError::ValidationError(format!(
                "booking {} is payable until {}",
                booking_id, booking.payment_deadline
            )));
        }

        let patch = StatusPatch {
            retry_deadline: Some(booking.payment_deadline + self.settings.retry_grace),
            ..StatusPatch::default()
        };
        match self
            .services
            .bookings
            .transition_status(booking_id, BookingStatus::PendingPayment, BookingStatus::Expired, patch, now)
            .await?
        {
            Some(expired) => {
                info!(%booking_id, retry_deadline = ?expired.retry_deadline, "Booking expired");
                Ok(expired)
            }
            None => {
                let current = self.get(booking_id).await?;
                Err(invalid(booking_id, current.status, BookingStatus::Expired))
            }
        }
    }

    /// User or operator cancellation. Valid while payment is still possible.
    pub async fn cancel(&self, booking_id: Uuid, reason: impl Into<String>) -> CoreResult<Booking> {
        let now = self.now();
        let booking = self.get(booking_id).await?;
        let from = match booking.status {
            BookingStatus::Cancelled => return Ok(booking),
            BookingStatus::PendingPayment => BookingStatus::PendingPayment,
            BookingStatus::Expired if booking.in_retry_window(now) => BookingStatus::Expired,
            other => return Err(invalid(booking_id, other, BookingStatus::Cancelled)),
        };
        self.finish_terminal(&booking, from, BookingStatus::Cancelled, reason.into()).await
    }

    /// Dispatch an explicit status change requested by an operator or internal caller.
    pub async fn apply_operator_transition(
        &self,
        booking_id: Uuid,
        target: BookingStatus,
        reason: Option<String>,
    ) -> CoreResult<Booking> {
        match target {
            BookingStatus::Confirmed => self.confirm(booking_id).await,
            BookingStatus::Expired => self.expire(booking_id).await,
            BookingStatus::Failed => self.fail(booking_id, reason.unwrap_or_else(|| "failed by operator".to_string())).await,
            BookingStatus::Cancelled => {
                self.cancel(booking_id, reason.unwrap_or_else(|| "cancelled by operator".to_string()))
                    .await
            }
            BookingStatus::PendingPayment => {
                let current = self.get(booking_id).await?;
                Err(invalid(booking_id, current.status, BookingStatus::PendingPayment))
            }
        }
    }

    async fn finish_terminal(
        &self,
        booking: &Booking,
        from: BookingStatus,
        to: BookingStatus,
        reason: String,
    ) -> CoreResult<Booking> {
        let now = self.now();
        let patch = StatusPatch {
            cancel_reason: Some(reason.clone()),
            ..StatusPatch::default()
        };
        let Some(updated) = self
            .services
            .bookings
            .transition_status(booking.id, from, to, patch, now)
            .await?
        else {
            let current = self.get(booking.id).await?;
            if current.status == to {
                return Ok(current);
            }
            return Err(invalid(booking.id, current.status, to));
        };

        if let Err(err) = self
            .services
            .trips
            .release_seats(booking.trip_id, &booking.seats, booking.id)
            .await
        {
            warn!(booking_id = %booking.id, error = %err, "Failed to release catalog seats");
        }
        if let Err(err) = self.locks.release(booking.trip_id, &booking.seats, booking.id).await {
            warn!(booking_id = %booking.id, error = %err, "Seat locks left to lapse");
        }
        info!(booking_id = %booking.id, %from, %to, %reason, "Booking closed");

        let kind = if to == BookingStatus::Cancelled {
            NotificationKind::BookingCancelled
        } else {
            NotificationKind::BookingFailed
        };
        self.notify(&updated, kind, Some(reason)).await;
        Ok(updated)
    }

    async fn undo_conversion(&self, booking: &Booking) {
        if let Err(err) = self
            .services
            .trips
            .release_seats(booking.trip_id, &booking.seats, booking.id)
            .await
        {
            error!(booking_id = %booking.id, error = %err, "Failed to release catalog seats");
        }
        if let Err(err) = self.locks.release(booking.trip_id, &booking.seats, booking.id).await {
            warn!(booking_id = %booking.id, error = %err, "Failed to release converted seats");
        }
    }

    /// Undo a conversion whose booking never left its unpaid status. The
    /// seats go back on hold until the lock's original expiry.
    async fn restore_holds(&self, booking: &Booking) {
        if let Ok(current) = self.get(booking.id).await {
            if current.status == BookingStatus::Confirmed {
                return;
            }
        }
        if let Err(err) = self
            .services
            .trips
            .release_seats(booking.trip_id, &booking.seats, booking.id)
            .await
        {
            error!(booking_id = %booking.id, error = %err, "Failed to release catalog seats");
        }
        let expires_at = booking.created_at + self.settings.default_timeout;
        if let Err(err) = self
            .locks
            .restore(booking.trip_id, &booking.seats, booking.id, expires_at)
            .await
        {
            error!(booking_id = %booking.id, error = %err, "Converted seats could not be returned to hold");
        }
    }

    async fn notify(&self, booking: &Booking, kind: NotificationKind, reason: Option<String>) {
        let mut notification = BookingNotification::new(
            kind,
            booking.id,
            &booking.booking_reference,
            booking.user_id,
            booking.trip_id,
            &booking.seats,
            self.now().timestamp(),
        );
        if let Some(reason) = reason {
            notification = notification.with_reason(reason);
        }
        if let Err(err) = self.services.notifier.notify(&notification).await {
            error!(booking_id = %booking.id, kind = kind.as_str(), error = %err, "Failed to publish notification");
        }
    }
}

fn invalid(booking_id: Uuid, from: BookingStatus, to: BookingStatus) -> CoreError {
    CoreError::InvalidTransition { booking_id, from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, seats, Harness};
    use busline_core::collaborators::TripCatalog;
    use busline_core::lock::SeatClaim;
    use busline_core::repository::DelayedQueue;
    use chrono::Duration;

    fn request(harness: &Harness, ids: &[&str]) -> NewBooking {
        NewBooking {
            user_id: harness.user_id,
            trip_id: harness.trip_id,
            seat_ids: seats(ids),
            hold_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_holds_seats_and_sets_deadline() {
        let harness = Harness::new().await;
        let machine = harness.machine();

        let booking = machine.create(request(&harness, &["S2", "S1"])).await.unwrap();

        assert_eq!(booking.status, BookingStatus::PendingPayment);
        assert_eq!(booking.seats, seats(&["S2", "S1"]));
        assert_eq!(booking.payment_deadline, at(10, 5, 0));
        assert!(booking.booking_reference.starts_with("BK240101"));
        assert_eq!(machine.locks().held_seats(harness.trip_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_conflict_leaves_no_booking() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let first = machine.create(request(&harness, &["S1"])).await.unwrap();

        let err = machine.create(request(&harness, &["S3", "S1"])).await.unwrap_err();
        assert!(matches!(err, CoreError::SeatConflict { .. }));

        let mine = machine.list_for_user(harness.user_id).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, first.id);
        assert_eq!(harness.locks.raw_claims().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_departed_trip() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        harness.clock.set(harness.departure);

        let err = machine.create(request(&harness, &["S1"])).await.unwrap_err();
        assert!(matches!(err, CoreError::TripNotBookable(_)));
        assert!(harness.locks.raw_claims().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_schedules_reminder_and_notifies() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1", "S2"])).await.unwrap();

        harness.clock.set(at(10, 3, 0));
        let confirmed = machine.confirm(booking.id).await.unwrap();

        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.confirmed_at, Some(at(10, 3, 0)));
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, Some(booking.id));

        let jobs = harness.queue.pending().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue_name, TRIP_REMINDER_QUEUE);
        assert_eq!(jobs[0].payload, booking.id.to_string());
        assert_eq!(jobs[0].not_before, harness.departure - Duration::hours(2));

        let sent = harness.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::BookingConfirmed);

        let claims = harness.locks.raw_claims().await;
        assert!(claims.iter().all(|claim| matches!(claim, SeatClaim::Booked { .. })));
    }

    #[tokio::test]
    async fn test_confirm_twice_is_a_no_op() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        machine.confirm(booking.id).await.unwrap();
        let again = machine.confirm(booking.id).await.unwrap();

        assert_eq!(again.status, BookingStatus::Confirmed);
        assert_eq!(harness.queue.pending().await.len(), 1);
        assert_eq!(harness.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_confirm_has_same_effects_as_on_time() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1", "S2"])).await.unwrap();

        harness.clock.set(at(10, 5, 1));
        let expired = machine.expire(booking.id).await.unwrap();
        assert_eq!(expired.retry_deadline, Some(at(11, 5, 0)));

        harness.clock.set(at(10, 30, 0));
        let confirmed = machine.confirm(booking.id).await.unwrap();

        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(harness.queue.pending().await.len(), 1);
        assert_eq!(harness.notifier.sent().await[0].kind, NotificationKind::BookingConfirmed);
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S2").await, Some(booking.id));
    }

    #[tokio::test]
    async fn test_confirm_after_seat_steal_fails_booking() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1", "S2"])).await.unwrap();

        harness.clock.set(at(10, 5, 1));
        machine.expire(booking.id).await.unwrap();

        harness.clock.set(at(10, 10, 0));
        let thief = machine.create(request(&harness, &["S2"])).await.unwrap();

        harness.clock.set(at(10, 12, 0));
        let err = machine.confirm(booking.id).await.unwrap_err();
        match err {
            CoreError::SeatConflict { seat_ids, .. } => assert_eq!(seat_ids, seats(&["S2"])),
            other => panic!("unexpected error {:?}", other),
        }

        let failed = machine.get(booking.id).await.unwrap();
        assert_eq!(failed.status, BookingStatus::Failed);
        assert!(harness.queue.pending().await.is_empty());
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, None);

        let held = machine.locks().held_seats(harness.trip_id).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].booking_id(), thief.id);
    }

    #[tokio::test]
    async fn test_confirm_after_grace_is_rejected() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        harness.clock.set(at(10, 5, 1));
        machine.expire(booking.id).await.unwrap();

        harness.clock.set(at(11, 10, 0));
        let err = machine.confirm(booking.id).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition { from: BookingStatus::Expired, to: BookingStatus::Confirmed, .. }
        ));
    }

    #[tokio::test]
    async fn test_confirm_losing_race_to_cancel_undoes_conversion() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        harness.bookings.preempt(booking.id, BookingStatus::Cancelled).await;
        let err = machine.confirm(booking.id).await.unwrap_err();

        assert!(matches!(err, CoreError::InvalidTransition { from: BookingStatus::Cancelled, .. }));
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, None);
        assert!(harness.locks.raw_claims().await.is_empty());
        assert!(harness.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_racing_the_sweeper_still_confirms() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness.clock.set(at(10, 5, 30));

        harness.bookings.preempt(booking.id, BookingStatus::Expired).await;
        let confirmed = machine.confirm(booking.id).await.unwrap();

        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(harness.queue.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_before_deadline_is_refused() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        harness.clock.set(at(10, 5, 0));
        assert!(machine.expire(booking.id).await.is_err());
        assert_eq!(machine.get(booking.id).await.unwrap().status, BookingStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_cancel_releases_seats_without_reminder() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1", "S2"])).await.unwrap();

        let cancelled = machine.cancel(booking.id, "changed plans").await.unwrap();

        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed plans"));
        assert!(harness.locks.raw_claims().await.is_empty());
        assert!(harness.queue.pending().await.is_empty());
        assert_eq!(harness.notifier.sent().await[0].kind, NotificationKind::BookingCancelled);

        assert!(machine.confirm(booking.id).await.is_err());
    }

    #[tokio::test]
    async fn test_confirmed_booking_cannot_be_cancelled() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        machine.confirm(booking.id).await.unwrap();

        let err = machine.cancel(booking.id, "too late").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_fail_is_idempotent() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        machine.fail(booking.id, "card declined").await.unwrap();
        let again = machine.fail(booking.id, "card declined").await.unwrap();

        assert_eq!(again.status, BookingStatus::Failed);
        assert_eq!(harness.notifier.sent().await.len(), 1);
        assert!(harness.locks.raw_claims().await.is_empty());
    }

    #[tokio::test]
    async fn test_operator_cannot_reopen_booking() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        let err = machine
            .apply_operator_transition(booking.id, BookingStatus::PendingPayment, None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let failed = machine
            .apply_operator_transition(booking.id, BookingStatus::Failed, Some("fraud".into()))
            .await
            .unwrap();
        assert_eq!(failed.cancel_reason.as_deref(), Some("fraud"));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_confirm() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness.notifier.set_failing(true);

        let confirmed = machine.confirm(booking.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);

        let jobs = harness.queue.poll(TRIP_REMINDER_QUEUE, 10, harness.departure, Duration::seconds(30)).await;
        assert_eq!(jobs.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reminder_enqueue_is_retried() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness.queue.fail_next_enqueues(2);

        machine.confirm(booking.id).await.unwrap();

        let jobs = harness.queue.pending().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload, booking.id.to_string());
    }

    #[tokio::test]
    async fn test_reminder_enqueue_failure_does_not_block_confirm() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness.queue.fail_next_enqueues(REMINDER_ENQUEUE_ATTEMPTS);

        let confirmed = machine.confirm(booking.id).await.unwrap();

        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert!(harness.queue.pending().await.is_empty());
        assert_eq!(harness.notifier.sent().await[0].kind, NotificationKind::BookingConfirmed);
    }

    #[tokio::test]
    async fn test_reminder_job_is_stamped_with_clock_time() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        harness.clock.set(at(10, 2, 0));
        machine.confirm(booking.id).await.unwrap();

        assert_eq!(harness.queue.pending().await[0].created_at, at(10, 2, 0));
    }

    #[tokio::test]
    async fn test_catalog_failure_returns_seats_to_hold() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1", "S2"])).await.unwrap();
        harness.trips.set_booking_available(false);

        harness.clock.set(at(10, 3, 0));
        let err = machine.confirm(booking.id).await.unwrap_err();
        assert!(err.is_transient());

        assert_eq!(machine.get(booking.id).await.unwrap().status, BookingStatus::PendingPayment);
        assert!(harness.queue.pending().await.is_empty());
        let claims = harness.locks.raw_claims().await;
        assert_eq!(claims.len(), 2);
        for claim in claims {
            match claim {
                SeatClaim::Held(lock) => assert_eq!(lock.expires_at, at(10, 5, 0)),
                other => panic!("seat still booked: {:?}", other),
            }
        }

        harness.clock.set(at(10, 30, 0));
        let next = machine.create(request(&harness, &["S1"])).await.unwrap();
        assert_eq!(next.status, BookingStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_confirm_succeeds_once_catalog_recovers() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();

        harness.trips.set_booking_available(false);
        assert!(machine.confirm(booking.id).await.is_err());
        harness.trips.set_booking_available(true);

        harness.clock.set(at(10, 4, 0));
        let confirmed = machine.confirm(booking.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, Some(booking.id));
    }

    #[tokio::test]
    async fn test_status_write_failure_releases_catalog_seats() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness.bookings.break_booking(booking.id).await;

        let err = machine.confirm(booking.id).await.unwrap_err();

        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, None);
        assert!(matches!(harness.locks.raw_claims().await[0], SeatClaim::Held(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_catalog_seats() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let booking = machine.create(request(&harness, &["S1"])).await.unwrap();
        harness
            .trips
            .mark_seats_booked(harness.trip_id, &seats(&["S1"]), booking.id)
            .await
            .unwrap();

        machine.cancel(booking.id, "changed plans").await.unwrap();

        assert_eq!(harness.trips.booked_by(harness.trip_id, "S1").await, None);
    }

    #[tokio::test]
    async fn test_create_adopts_standalone_hold() {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let hold_id = Uuid::new_v4();
        machine
            .locks()
            .acquire(harness.trip_id, &seats(&["S1", "S2"]), hold_id, Duration::minutes(5))
            .await
            .unwrap();

        let booking = machine
            .create(NewBooking {
                hold_id: Some(hold_id),
                ..request(&harness, &["S1", "S2"])
            })
            .await
            .unwrap();

        assert_eq!(booking.id, hold_id);
        let held = machine.locks().held_seats(harness.trip_id).await.unwrap();
        assert!(held.iter().all(|claim| claim.booking_id() == hold_id));

        let err = machine
            .create(NewBooking {
                hold_id: Some(hold_id),
                ..request(&harness, &["S3"])
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        assert_eq!(machine.locks().held_seats(harness.trip_id).await.unwrap().len(), 2);
    }
}
