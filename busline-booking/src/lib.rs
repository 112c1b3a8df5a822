pub mod dispatcher;
pub mod locks;
pub mod machine;
pub mod reconciler;
pub mod settings;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use busline_core::clock::Clock;
use busline_core::collaborators::{Notifier, PaymentGateway, TripCatalog, UserDirectory};
use busline_core::repository::{BookingRepository, DelayedQueue, SeatLockStore};

pub use dispatcher::{DispatchReport, TripReminderDispatcher};
pub use locks::SeatLockManager;
pub use machine::BookingStateMachine;
pub use reconciler::PaymentReconciler;
pub use settings::{BookingSettings, DispatchSettings};
pub use sweeper::{ExpirationSweeper, SweepReport};

/// Stores and collaborators shared by every component of the booking core.
#[derive(Clone)]
pub struct Services {
    pub bookings: Arc<dyn BookingRepository>,
    pub locks: Arc<dyn SeatLockStore>,
    pub queue: Arc<dyn DelayedQueue>,
    pub trips: Arc<dyn TripCatalog>,
    pub users: Arc<dyn UserDirectory>,
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}
