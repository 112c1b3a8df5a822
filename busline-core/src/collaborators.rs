//! Interfaces of the services this core talks to but does not own.

use std::collections::BTreeSet;

use async_trait::async_trait;
use busline_shared::{BookingNotification, Masked};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payment::TransactionSnapshot;
use crate::CoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Scheduled,
    Departed,
    Cancelled,
}

/// Trip, route and bus details as served by the trip catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripDetails {
    pub trip_id: Uuid,
    pub origin: String,
    pub destination: String,
    pub departure_time: DateTime<Utc>,
    pub bus_name: String,
    pub plate_number: String,
    pub status: TripStatus,
}

impl TripDetails {
    pub fn is_bookable(&self, now: DateTime<Utc>) -> bool {
        self.status == TripStatus::Scheduled && self.departure_time > now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Passenger,
    Operator,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: Masked<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

impl UserProfile {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[async_trait]
pub trait TripCatalog: Send + Sync {
    async fn trip(&self, trip_id: Uuid) -> CoreResult<TripDetails>;

    /// Human-readable seat numbers, in the order of `seat_ids`.
    async fn seat_labels(&self, trip_id: Uuid, seat_ids: &[String]) -> CoreResult<Vec<String>>;

    /// Record the seats as permanently booked. Must be idempotent per booking.
    async fn mark_seats_booked(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()>;

    /// Undo `mark_seats_booked` for a booking that did not end up confirmed.
    async fn release_seats(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, user_id: Uuid) -> CoreResult<UserProfile>;
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn transaction_status(&self, booking_id: Uuid) -> CoreResult<TransactionSnapshot>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &BookingNotification) -> CoreResult<()>;
}
