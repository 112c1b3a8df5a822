//! Fixtures for the unit tests: in-memory stores driven by a manual clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use busline_core::booking::{Booking, BookingStatus, StatusPatch};
use busline_core::clock::ManualClock;
use busline_core::collaborators::{Role, TripDetails, TripStatus, UserProfile};
use busline_core::memory::{
    InMemoryBookingRepository, InMemoryDelayedQueue, InMemoryPaymentGateway, InMemorySeatLockStore,
    InMemoryTripCatalog, InMemoryUserDirectory, RecordingNotifier,
};
use busline_core::payment::TransactionStatus;
use busline_core::repository::BookingRepository;
use busline_core::{CoreError, CoreResult};
use busline_shared::Masked;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{BookingSettings, BookingStateMachine, Services};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
}

pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, second).unwrap()
}

pub fn seats(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub bookings: Arc<ScriptedBookingRepository>,
    pub locks: Arc<InMemorySeatLockStore>,
    pub queue: Arc<InMemoryDelayedQueue>,
    pub trips: Arc<InMemoryTripCatalog>,
    pub users: Arc<InMemoryUserDirectory>,
    pub payments: Arc<InMemoryPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub trip_id: Uuid,
    pub user_id: Uuid,
    pub departure: DateTime<Utc>,
}

impl Harness {
    pub async fn new() -> Self {
        let harness = Self {
            clock: Arc::new(ManualClock::new(start())),
            bookings: Arc::new(ScriptedBookingRepository::default()),
            locks: Arc::new(InMemorySeatLockStore::new()),
            queue: Arc::new(InMemoryDelayedQueue::new()),
            trips: Arc::new(InMemoryTripCatalog::new()),
            users: Arc::new(InMemoryUserDirectory::new()),
            payments: Arc::new(InMemoryPaymentGateway::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            trip_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            departure: start() + Duration::hours(22),
        };

        harness
            .trips
            .add_trip(TripDetails {
                trip_id: harness.trip_id,
                origin: "Hanoi".to_string(),
                destination: "Da Nang".to_string(),
                departure_time: harness.departure,
                bus_name: "Sleeper 40".to_string(),
                plate_number: "29B-123.45".to_string(),
                status: TripStatus::Scheduled,
            })
            .await;
        harness
            .users
            .add_user(UserProfile {
                user_id: harness.user_id,
                full_name: "Nguyen Van An".to_string(),
                email: Masked("an@example.com".to_string()),
                roles: BTreeSet::from([Role::Passenger]),
            })
            .await;
        harness
    }

    pub fn services(&self) -> Services {
        Services {
            bookings: self.bookings.clone(),
            locks: self.locks.clone(),
            queue: self.queue.clone(),
            trips: self.trips.clone(),
            users: self.users.clone(),
            payments: self.payments.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn machine(&self) -> Arc<BookingStateMachine> {
        Arc::new(BookingStateMachine::new(self.services(), BookingSettings::default()))
    }
}

/// Booking repository that can inject races and storage failures.
#[derive(Default)]
pub struct ScriptedBookingRepository {
    inner: InMemoryBookingRepository,
    preempt: Mutex<HashMap<Uuid, BookingStatus>>,
    broken: Mutex<HashSet<Uuid>>,
}

impl ScriptedBookingRepository {
    /// The next status write on `id` finds the booking already moved to `status`.
    pub async fn preempt(&self, id: Uuid, status: BookingStatus) {
        self.preempt.lock().await.insert(id, status);
    }

    /// Every status write on `id` fails with a storage error.
    pub async fn break_booking(&self, id: Uuid) {
        self.broken.lock().await.insert(id);
    }
}

#[async_trait]
impl BookingRepository for ScriptedBookingRepository {
    async fn insert(&self, booking: &Booking) -> CoreResult<()> {
        self.inner.insert(booking).await
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        self.inner.get(id).await
    }

    async fn list_for_user(&self, user_id: Uuid) -> CoreResult<Vec<Booking>> {
        self.inner.list_for_user(user_id).await
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        patch: StatusPatch,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        if self.broken.lock().await.contains(&id) {
            return Err(CoreError::Storage("connection reset".to_string()));
        }

        let preempted = self.preempt.lock().await.remove(&id);
        if let Some(status) = preempted {
            if let Some(current) = self.inner.get(id).await? {
                let forced = StatusPatch {
                    retry_deadline: Some(current.payment_deadline + Duration::minutes(60)),
                    ..StatusPatch::default()
                };
                self.inner.transition_status(id, current.status, status, forced, now).await?;
            }
        }
        self.inner.transition_status(id, from, to, patch, now).await
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        self.inner.update_payment_status(id, status, payment_order_id, now).await
    }

    async fn mark_reminder_sent(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        self.inner.mark_reminder_sent(id, now).await
    }

    async fn find_overdue_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        self.inner.find_overdue_pending(now, limit).await
    }

    async fn find_lapsed_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        self.inner.find_lapsed_expired(now, limit).await
    }
}
