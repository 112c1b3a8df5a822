use std::sync::Arc;

use busline_core::booking::Booking;
use busline_core::collaborators::PaymentGateway;
use busline_core::payment::{PaymentAction, TransactionStatus};
use busline_core::CoreResult;
use tracing::{debug, info};
use uuid::Uuid;

use crate::machine::BookingStateMachine;

/// Applies payment-service transaction status to bookings.
pub struct PaymentReconciler {
    machine: Arc<BookingStateMachine>,
    payments: Arc<dyn PaymentGateway>,
}

impl PaymentReconciler {
    pub fn new(machine: Arc<BookingStateMachine>, payments: Arc<dyn PaymentGateway>) -> Self {
        Self { machine, payments }
    }

    /// Persist the payment status, then drive the booking through the state machine.
    pub async fn apply(
        &self,
        booking_id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
    ) -> CoreResult<Booking> {
        let recorded = self
            .machine
            .record_payment_status(booking_id, status, payment_order_id)
            .await?;
        debug!(%booking_id, payment_status = %status, "Payment status recorded");

        match status.action() {
            PaymentAction::Confirm => self.machine.confirm(booking_id).await,
            PaymentAction::Fail => self.machine.fail(booking_id, format!("payment {}", status)).await,
            PaymentAction::Record => Ok(recorded),
        }
    }

    /// Ask the payment service for the current status and apply it.
    pub async fn refresh(&self, booking_id: Uuid) -> CoreResult<Booking> {
        let snapshot = self.payments.transaction_status(booking_id).await?;
        info!(%booking_id, payment_status = %snapshot.status, "Payment status fetched");
        self.apply(booking_id, snapshot.status, snapshot.payment_order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, seats, Harness};
    use busline_core::booking::{BookingStatus, NewBooking};
    use busline_core::CoreError;

    async fn setup() -> (Harness, Arc<BookingStateMachine>, PaymentReconciler, Booking) {
        let harness = Harness::new().await;
        let machine = harness.machine();
        let reconciler = PaymentReconciler::new(machine.clone(), harness.payments.clone());
        let booking = machine
            .create(NewBooking {
                user_id: harness.user_id,
                trip_id: harness.trip_id,
                seat_ids: seats(&["S1", "S2"]),
                hold_id: None,
            })
            .await
            .unwrap();
        (harness, machine, reconciler, booking)
    }

    #[tokio::test]
    async fn test_paid_confirms() {
        let (_harness, _, reconciler, booking) = setup().await;

        let confirmed = reconciler
            .apply(booking.id, TransactionStatus::Paid, Some("PO-1".into()))
            .await
            .unwrap();

        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.payment_status, TransactionStatus::Paid);
        assert_eq!(confirmed.payment_order_id.as_deref(), Some("PO-1"));
    }

    #[tokio::test]
    async fn test_in_flight_statuses_only_record() {
        let (harness, _, reconciler, booking) = setup().await;

        for status in [TransactionStatus::Pending, TransactionStatus::Processing, TransactionStatus::Underpaid] {
            let updated = reconciler.apply(booking.id, status, None).await.unwrap();
            assert_eq!(updated.status, BookingStatus::PendingPayment);
            assert_eq!(updated.payment_status, status);
        }
        assert!(harness.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_payment_fails_booking() {
        let (harness, _, reconciler, booking) = setup().await;

        let failed = reconciler.apply(booking.id, TransactionStatus::Cancelled, None).await.unwrap();

        assert_eq!(failed.status, BookingStatus::Failed);
        assert_eq!(failed.cancel_reason.as_deref(), Some("payment CANCELLED"));
        assert!(harness.locks.raw_claims().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_booking_is_not_found() {
        let (_harness, _, reconciler, _) = setup().await;
        let err = reconciler.apply(Uuid::new_v4(), TransactionStatus::Paid, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_refresh_queries_payment_service() {
        let (harness, _, reconciler, booking) = setup().await;
        harness.clock.set(at(10, 2, 0));
        harness
            .payments
            .set_status(booking.id, TransactionStatus::Paid, Some("PO-9".into()))
            .await;

        let confirmed = reconciler.refresh(booking.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.confirmed_at, Some(at(10, 2, 0)));
    }

    #[tokio::test]
    async fn test_late_payment_is_recorded_even_when_rejected() {
        let (harness, machine, reconciler, booking) = setup().await;
        harness.clock.set(at(10, 5, 1));
        machine.expire(booking.id).await.unwrap();

        harness.clock.set(at(11, 10, 0));
        let err = reconciler.apply(booking.id, TransactionStatus::Paid, None).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = machine.get(booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Expired);
        assert_eq!(stored.payment_status, TransactionStatus::Paid);
    }
}
