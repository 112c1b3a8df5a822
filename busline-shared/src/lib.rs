pub mod models;
pub mod pii;

pub use models::events::{BookingNotification, NotificationKind, TripReminderDetails};
pub use pii::Masked;
