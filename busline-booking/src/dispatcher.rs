use busline_core::booking::{Booking, BookingStatus};
use busline_core::queue::DelayedJob;
use busline_core::CoreResult;
use busline_shared::{BookingNotification, NotificationKind, TripReminderDetails};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::settings::DispatchSettings;
use crate::Services;

/// Placeholder shown when seat numbers cannot be fetched.
pub const UNKNOWN_SEAT_LABEL: &str = "TBA";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub degraded: usize,
    pub skipped: usize,
    /// Retryable failures left for another claim.
    pub failed: usize,
    /// Failures acked without sending: permanent, or out of attempts.
    pub dropped: usize,
}

enum Outcome {
    Sent { degraded: bool },
    Skipped(&'static str),
}

/// Sends pre-departure reminders for jobs released by the delayed queue.
///
/// Delivery is at-least-once: a job is acked only after the reminder went
/// out and the booking was marked, and a marked booking is never reminded
/// again. A job that fails permanently, or transiently `max_attempts` times,
/// is acked and dropped.
pub struct TripReminderDispatcher {
    services: Services,
    settings: DispatchSettings,
}

impl TripReminderDispatcher {
    pub fn new(services: Services, settings: DispatchSettings) -> Self {
        Self { services, settings }
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    /// Claim one batch of due jobs and process it.
    pub async fn dispatch_once(&self) -> CoreResult<DispatchReport> {
        let now = self.services.clock.now();
        let jobs = self
            .services
            .queue
            .poll(&self.settings.queue_name, self.settings.batch_size, now, self.settings.visibility)
            .await?;

        let mut report = DispatchReport {
            claimed: jobs.len(),
            ..DispatchReport::default()
        };

        for job in jobs {
            match self.process(&job).await {
                Ok(outcome) => {
                    match outcome {
                        Outcome::Sent { degraded } => {
                            report.sent += 1;
                            if degraded {
                                report.degraded += 1;
                            }
                        }
                        Outcome::Skipped(why) => {
                            debug!(job_id = %job.id, payload = %job.payload, why, "Reminder skipped");
                            report.skipped += 1;
                        }
                    }
                    if let Err(err) = self.services.queue.ack(job.id).await {
                        warn!(job_id = %job.id, error = %err, "Failed to ack reminder job");
                    }
                }
                Err(err) if err.is_transient() && i64::from(job.attempts) < i64::from(self.settings.max_attempts) => {
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %err,
                        "Reminder dispatch failed, job will be retried"
                    );
                    report.failed += 1;
                }
                Err(err) => {
                    error!(
                        job_id = %job.id,
                        payload = %job.payload,
                        attempts = job.attempts,
                        error = %err,
                        "Reminder dropped"
                    );
                    report.dropped += 1;
                    if let Err(ack_err) = self.services.queue.ack(job.id).await {
                        warn!(job_id = %job.id, error = %ack_err, "Failed to ack dropped reminder job");
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                skipped = report.skipped,
                failed = report.failed,
                dropped = report.dropped,
                "Reminder batch processed"
            );
        }
        Ok(report)
    }

    async fn process(&self, job: &DelayedJob) -> CoreResult<Outcome> {
        let Ok(booking_id) = Uuid::parse_str(job.payload.trim()) else {
            warn!(job_id = %job.id, payload = %job.payload, "Malformed reminder payload");
            return Ok(Outcome::Skipped("malformed payload"));
        };

        let Some(booking) = self.services.bookings.get(booking_id).await? else {
            return Ok(Outcome::Skipped("booking not found"));
        };
        if booking.status != BookingStatus::Confirmed {
            return Ok(Outcome::Skipped("booking not confirmed"));
        }
        if booking.reminder_sent_at.is_some() {
            return Ok(Outcome::Skipped("already reminded"));
        }

        let trip = self.services.trips.trip(booking.trip_id).await?;
        let now = self.services.clock.now();
        if trip.departure_time <= now {
            return Ok(Outcome::Skipped("trip departed"));
        }

        let user = self.services.users.user(booking.user_id).await?;
        let (seat_labels, degraded) = self.seat_labels(&booking).await;

        let recipient = user.email.hint();
        let notification = BookingNotification::new(
            NotificationKind::TripReminder,
            booking.id,
            &booking.booking_reference,
            booking.user_id,
            booking.trip_id,
            &booking.seats,
            now.timestamp(),
        )
        .with_reminder(TripReminderDetails {
            passenger_name: user.full_name,
            email: user.email,
            origin: trip.origin,
            destination: trip.destination,
            departure_time: trip.departure_time.timestamp(),
            bus_name: trip.bus_name,
            plate_number: trip.plate_number,
            seat_labels,
            degraded,
        });

        self.services.notifier.notify(&notification).await?;
        if !self.services.bookings.mark_reminder_sent(booking.id, now).await? {
            debug!(booking_id = %booking.id, "Reminder was marked by another dispatcher");
        }
        info!(booking_id = %booking.id, %recipient, degraded, "Trip reminder sent");
        Ok(Outcome::Sent { degraded })
    }

    async fn seat_labels(&self, booking: &Booking) -> (Vec<String>, bool) {
        match self.services.trips.seat_labels(booking.trip_id, &booking.seats).await {
            Ok(labels) if labels.len() == booking.seats.len() => (labels, false),
            Ok(labels) => {
                warn!(booking_id = %booking.id, expected = booking.seats.len(), got = labels.len(), "Seat labels incomplete");
                (vec![UNKNOWN_SEAT_LABEL.to_string(); booking.seats.len()], true)
            }
            Err(err) => {
                warn!(booking_id = %booking.id, error = %err, "Seat labels unavailable, sending degraded reminder");
                (vec![UNKNOWN_SEAT_LABEL.to_string(); booking.seats.len()], true)
            }
        }
    }
}
