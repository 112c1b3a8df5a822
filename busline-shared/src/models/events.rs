use uuid::Uuid;
use crate::pii::Masked;

/// Which lifecycle moment a booking notification describes.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BookingConfirmed,
    BookingFailed,
    BookingCancelled,
    TripReminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingConfirmed => "BOOKING_CONFIRMED",
            NotificationKind::BookingFailed => "BOOKING_FAILED",
            NotificationKind::BookingCancelled => "BOOKING_CANCELLED",
            NotificationKind::TripReminder => "TRIP_REMINDER",
        }
    }
}

/// Event handed to the notification service. Rendering and delivery happen downstream.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingNotification {
    pub kind: NotificationKind,
    pub booking_id: Uuid,
    pub booking_reference: String,
    pub user_id: Uuid,
    pub trip_id: Uuid,
    pub seats: Vec<String>,
    pub reason: Option<String>,
    pub occurred_at: i64,
    pub reminder: Option<TripReminderDetails>,
}

impl BookingNotification {
    pub fn new(
        kind: NotificationKind,
        booking_id: Uuid,
        booking_reference: &str,
        user_id: Uuid,
        trip_id: Uuid,
        seats: &[String],
        occurred_at: i64,
    ) -> Self {
        Self {
            kind,
            booking_id,
            booking_reference: booking_reference.to_string(),
            user_id,
            trip_id,
            seats: seats.to_vec(),
            reason: None,
            occurred_at,
            reminder: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_reminder(mut self, reminder: TripReminderDetails) -> Self {
        self.reminder = Some(reminder);
        self
    }

    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Everything a pre-departure reminder template needs.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct TripReminderDetails {
    pub passenger_name: String,
    pub email: Masked<String>,
    pub origin: String,
    pub destination: String,
    pub departure_time: i64,
    pub bus_name: String,
    pub plate_number: String,
    pub seat_labels: Vec<String>,
    /// Set when some details could not be fetched and placeholders were used.
    pub degraded: bool,
}
