use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRIP_REMINDER_QUEUE: &str = "trip-reminders";

/// A unit of deferred work. `dequeued_at` is the claimed-until anchor: a claimed
/// job stays hidden until `dequeued_at + visibility` has passed or it is acked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayedJob {
    pub id: Uuid,
    pub queue_name: String,
    pub payload: String,
    pub not_before: DateTime<Utc>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl DelayedJob {
    pub fn new(queue_name: &str, payload: &str, not_before: DateTime<Utc>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            payload: payload.to_string(),
            not_before,
            dequeued_at: None,
            attempts: 0,
            created_at,
        }
    }

    pub fn is_visible(&self, now: DateTime<Utc>, visibility: Duration) -> bool {
        if self.not_before > now {
            return false;
        }
        match self.dequeued_at {
            None => true,
            Some(claimed) => claimed + visibility <= now,
        }
    }
}
