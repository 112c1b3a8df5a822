use busline_core::queue::TRIP_REMINDER_QUEUE;
use chrono::Duration;

/// Timers governing seat holds and the booking lifecycle.
#[derive(Debug, Clone)]
pub struct BookingSettings {
    /// TTL of a seat lock taken at booking creation.
    pub default_timeout: Duration,
    pub payment_timeout: Duration,
    /// How long after the payment deadline a late payment is still honoured.
    pub retry_grace: Duration,
    /// Slack before the sweeper physically deletes a lapsed lock.
    pub expiration_grace: Duration,
    pub reminder_lead: Duration,
    pub sweep_batch_size: i64,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::minutes(5),
            payment_timeout: Duration::minutes(5),
            retry_grace: Duration::minutes(60),
            expiration_grace: Duration::minutes(1),
            reminder_lead: Duration::hours(2),
            sweep_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue_name: String,
    pub batch_size: usize,
    pub visibility: Duration,
    /// Claims after which a job that keeps failing is dropped.
    pub max_attempts: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue_name: TRIP_REMINDER_QUEUE.to_string(),
            batch_size: 10,
            visibility: Duration::seconds(30),
            max_attempts: 5,
        }
    }
}
