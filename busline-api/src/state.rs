use std::sync::Arc;

use busline_booking::{
    BookingSettings, BookingStateMachine, DispatchSettings, ExpirationSweeper, PaymentReconciler, Services,
    TripReminderDispatcher,
};
use busline_core::{CoreError, CoreResult};
use busline_store::Config;
use chrono::Duration;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<BookingStateMachine>,
    pub reconciler: Arc<PaymentReconciler>,
    pub sweeper: Arc<ExpirationSweeper>,
    pub dispatcher: Arc<TripReminderDispatcher>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wire the booking components over one set of stores and collaborators.
    pub fn new(
        services: Services,
        booking: BookingSettings,
        dispatch: DispatchSettings,
        metrics: Metrics,
    ) -> Self {
        let machine = Arc::new(BookingStateMachine::new(services.clone(), booking));
        let reconciler = Arc::new(PaymentReconciler::new(machine.clone(), services.payments.clone()));
        let sweeper = Arc::new(ExpirationSweeper::new(machine.clone(), services.clone()));
        let dispatcher = Arc::new(TripReminderDispatcher::new(services, dispatch));
        Self {
            machine,
            reconciler,
            sweeper,
            dispatcher,
            metrics,
        }
    }
}

pub fn booking_settings(config: &Config) -> CoreResult<BookingSettings> {
    let booking = &config.booking;
    Ok(BookingSettings {
        default_timeout: seconds("booking.default_timeout_secs", booking.default_timeout_secs)?,
        payment_timeout: seconds("booking.payment_timeout_secs", booking.payment_timeout_secs)?,
        retry_grace: seconds("booking.retry_grace_secs", booking.retry_grace_secs)?,
        expiration_grace: seconds("booking.expiration_grace_secs", booking.expiration_grace_secs)?,
        reminder_lead: seconds("booking.reminder_lead_secs", booking.reminder_lead_secs)?,
        sweep_batch_size: booking.sweep_batch_size,
    })
}

pub fn dispatch_settings(config: &Config) -> CoreResult<DispatchSettings> {
    Ok(DispatchSettings {
        batch_size: config.workers.reminder_batch_size,
        visibility: seconds("workers.visibility_timeout_secs", config.workers.visibility_timeout_secs)?,
        max_attempts: config.workers.reminder_max_attempts,
        ..DispatchSettings::default()
    })
}

fn seconds(key: &str, value: u64) -> CoreResult<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CoreError::Config(format!("{} is out of range: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_follow_config() {
        let mut config: Config = Config::defaults().unwrap().build().unwrap().try_deserialize().unwrap();
        config.booking.payment_timeout_secs = 600;
        config.workers.reminder_batch_size = 25;
        config.workers.reminder_max_attempts = 8;

        let booking = booking_settings(&config).unwrap();
        assert_eq!(booking.payment_timeout, Duration::minutes(10));
        assert_eq!(booking.retry_grace, Duration::hours(1));
        assert_eq!(booking.expiration_grace, Duration::minutes(1));

        let dispatch = dispatch_settings(&config).unwrap();
        assert_eq!(dispatch.batch_size, 25);
        assert_eq!(dispatch.visibility, Duration::seconds(30));
        assert_eq!(dispatch.max_attempts, 8);
    }

    #[test]
    fn test_out_of_range_timer_is_rejected() {
        let err = seconds("booking.retry_grace_secs", u64::MAX).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
