use std::sync::Arc;

use busline_core::CoreError;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::machine::BookingStateMachine;
use crate::Services;

/// Counts from one sweep. `errors` covers every pass and row that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub locks_removed: usize,
    pub bookings_expired: usize,
    pub bookings_failed: usize,
    pub errors: usize,
}

/// Finalizes locks and bookings whose timers have lapsed.
///
/// The three passes are independent: a failing pass or row is logged and
/// the rest of the sweep carries on.
pub struct ExpirationSweeper {
    machine: Arc<BookingStateMachine>,
    services: Services,
}

impl ExpirationSweeper {
    pub fn new(machine: Arc<BookingStateMachine>, services: Services) -> Self {
        Self { machine, services }
    }

    pub async fn sweep(&self) -> SweepReport {
        let now = self.services.clock.now();
        let settings = self.machine.settings();
        let mut report = SweepReport::default();

        match self.machine.locks().clean_expired(now - settings.expiration_grace).await {
            Ok(removed) => report.locks_removed = removed,
            Err(err) => {
                error!(error = %err, "Seat lock sweep failed");
                report.errors += 1;
            }
        }

        match self.services.bookings.find_overdue_pending(now, settings.sweep_batch_size).await {
            Ok(overdue) => {
                for booking in overdue {
                    match self.machine.expire(booking.id).await {
                        Ok(_) => report.bookings_expired += 1,
                        Err(err) => record_row_error(&mut report, booking.id, "expire", err),
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Overdue booking scan failed");
                report.errors += 1;
            }
        }

        match self.services.bookings.find_lapsed_expired(now, settings.sweep_batch_size).await {
            Ok(lapsed) => {
                for booking in lapsed {
                    match self.machine.fail(booking.id, "payment not received within grace period").await {
                        Ok(_) => report.bookings_failed += 1,
                        Err(err) => record_row_error(&mut report, booking.id, "fail", err),
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Lapsed booking scan failed");
                report.errors += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                locks_removed = report.locks_removed,
                expired = report.bookings_expired,
                failed = report.bookings_failed,
                errors = report.errors,
                "Sweep finished"
            );
        }
        report
    }
}

fn record_row_error(report: &mut SweepReport, booking_id: uuid::Uuid, action: &str, err: CoreError) {
    if err.is_conflict() {
        // Another actor moved the booking first.
        debug!(%booking_id, action, error = %err, "Sweep skipped booking");
        return;
    }
    warn!(%booking_id, action, error = %err, "Sweep could not update booking");
    report.errors += 1;
}
