use std::sync::Arc;

use busline_core::booking::validate_seat_ids;
use busline_core::clock::Clock;
use busline_core::lock::{canonical_seats, SeatClaim, SeatLock};
use busline_core::repository::SeatLockStore;
use busline_core::{CoreError, CoreResult};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grants and revokes time-bounded exclusive claims on `(trip, seat)` pairs.
///
/// Every multi-seat call hands the store the seats in canonical order, so
/// overlapping requests always contend on the same first seat.
#[derive(Clone)]
pub struct SeatLockManager {
    store: Arc<dyn SeatLockStore>,
    clock: Arc<dyn Clock>,
}

impl SeatLockManager {
    pub fn new(store: Arc<dyn SeatLockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Claim every seat or none.
    pub async fn acquire(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        ttl: Duration,
    ) -> CoreResult<Vec<SeatLock>> {
        validate_seat_ids(seat_ids)?;
        if ttl <= Duration::zero() {
            return Err(CoreError::ValidationError("lock ttl must be positive".to_string()));
        }

        let seats = canonical_seats(seat_ids);
        let now = self.clock.now();
        match self.store.acquire(trip_id, &seats, booking_id, now, now + ttl).await {
            Ok(locks) => {
                info!(%trip_id, %booking_id, seats = ?seats, expires_at = %(now + ttl), "Seats locked");
                Ok(locks)
            }
            Err(err @ CoreError::SeatConflict { .. }) => {
                debug!(%trip_id, %booking_id, error = %err, "Seat lock refused");
                Err(err)
            }
            Err(err) => {
                warn!(%trip_id, %booking_id, error = %err, "Seat lock store failed");
                Err(err)
            }
        }
    }

    /// Owner-checked and idempotent.
    pub async fn release(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<usize> {
        let seats = canonical_seats(seat_ids);
        let removed = self.store.release(trip_id, &seats, booking_id).await?;
        debug!(%trip_id, %booking_id, removed, "Seat locks released");
        Ok(removed)
    }

    /// Turn the booking's seats into durable booked markers.
    pub async fn convert(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()> {
        let seats = canonical_seats(seat_ids);
        self.store.convert(trip_id, &seats, booking_id, self.clock.now()).await?;
        debug!(%trip_id, %booking_id, "Seat locks converted");
        Ok(())
    }

    /// Hand booked seats back to the booking as held locks expiring at
    /// `expires_at`. Used when a confirmation cannot be committed.
    pub async fn restore(
        &self,
        trip_id: Uuid,
        seat_ids: &[String],
        booking_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let seats = canonical_seats(seat_ids);
        let restored = self
            .store
            .restore(trip_id, &seats, booking_id, self.clock.now(), expires_at)
            .await?;
        info!(%trip_id, %booking_id, restored, %expires_at, "Booked seats returned to hold");
        Ok(restored)
    }

    /// Remove held locks that expired before `now`.
    pub async fn clean_expired(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let removed = self.store.clean_expired(now).await?;
        if removed > 0 {
            info!(removed, "Expired seat locks cleaned");
        }
        Ok(removed)
    }

    /// Seats on the trip that another booking cannot take right now.
    pub async fn held_seats(&self, trip_id: Uuid) -> CoreResult<Vec<SeatClaim>> {
        self.store.claims(trip_id, self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seats, start};
    use busline_core::clock::ManualClock;
    use busline_core::memory::InMemorySeatLockStore;

    fn manager() -> (SeatLockManager, Arc<ManualClock>, Arc<InMemorySeatLockStore>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InMemorySeatLockStore::new());
        (SeatLockManager::new(store.clone(), clock.clone()), clock, store)
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_acquires_have_one_winner() {
        let (manager, _, store) = manager();
        let trip = Uuid::new_v4();

        let requests = [
            seats(&["S1", "S2"]),
            seats(&["S2", "S3"]),
            seats(&["S3", "S1"]),
            seats(&["S1", "S2", "S3"]),
        ];
        let mut handles = Vec::new();
        for request in requests {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(trip, &request, Uuid::new_v4(), Duration::minutes(5)).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(matches!(err, CoreError::SeatConflict { .. })),
            }
        }
        assert_eq!(winners, 1);

        let owners: std::collections::HashSet<Uuid> =
            store.raw_claims().await.iter().map(|claim| claim.booking_id()).collect();
        assert_eq!(owners.len(), 1);
    }

    #[tokio::test]
    async fn test_lapsed_lock_is_absent_before_sweep() {
        let (manager, clock, _) = manager();
        let trip = Uuid::new_v4();
        manager.acquire(trip, &seats(&["S1"]), Uuid::new_v4(), Duration::minutes(5)).await.unwrap();

        clock.advance(Duration::minutes(5));
        assert!(manager.acquire(trip, &seats(&["S1"]), Uuid::new_v4(), Duration::minutes(5)).await.is_err());

        clock.advance(Duration::seconds(1));
        let taken = manager.acquire(trip, &seats(&["S1"]), Uuid::new_v4(), Duration::minutes(5)).await;
        assert!(taken.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_owner_checked_and_idempotent() {
        let (manager, _, _) = manager();
        let trip = Uuid::new_v4();
        let owner = Uuid::new_v4();
        manager.acquire(trip, &seats(&["S1", "S2"]), owner, Duration::minutes(5)).await.unwrap();

        assert_eq!(manager.release(trip, &seats(&["S1", "S2"]), Uuid::new_v4()).await.unwrap(), 0);
        assert_eq!(manager.release(trip, &seats(&["S1", "S2"]), owner).await.unwrap(), 2);
        assert_eq!(manager.release(trip, &seats(&["S1", "S2"]), owner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_expired_is_idempotent() {
        let (manager, clock, _) = manager();
        let trip = Uuid::new_v4();
        manager.acquire(trip, &seats(&["S1", "S2"]), Uuid::new_v4(), Duration::minutes(5)).await.unwrap();

        clock.advance(Duration::minutes(10));
        assert_eq!(manager.clean_expired(clock.now()).await.unwrap(), 2);
        assert_eq!(manager.clean_expired(clock.now()).await.unwrap(), 0);
        assert!(manager.held_seats(trip).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_extends_hold() {
        let (manager, clock, _) = manager();
        let trip = Uuid::new_v4();
        let owner = Uuid::new_v4();
        manager.acquire(trip, &seats(&["S1"]), owner, Duration::minutes(5)).await.unwrap();

        clock.advance(Duration::minutes(4));
        let locks = manager.acquire(trip, &seats(&["S1"]), owner, Duration::minutes(5)).await.unwrap();
        assert_eq!(locks[0].expires_at, clock.now() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_rejects_bad_seat_lists() {
        let (manager, _, _) = manager();
        let trip = Uuid::new_v4();
        let err = manager.acquire(trip, &[], Uuid::new_v4(), Duration::minutes(5)).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }
}
