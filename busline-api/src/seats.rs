use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use busline_core::booking::BookingStatus;
use busline_core::lock::{SeatClaim, SeatLock};
use busline_core::CoreError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReserveSeatsRequest {
    pub trip_id: Uuid,
    pub seat_ids: Vec<String>,
    /// A fresh holder id is issued when absent.
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveSeatsResponse {
    pub booking_id: Uuid,
    pub locks: Vec<SeatLock>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseSeatsRequest {
    pub trip_id: Uuid,
    pub seat_ids: Vec<String>,
    pub booking_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseSeatsResponse {
    pub released: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/seats/reserve", post(reserve_seats))
        .route("/seats/release", post(release_seats))
        .route("/trips/{id}/held-seats", get(held_seats))
}

/// POST /seats/reserve
/// Lock seats without opening a booking
pub async fn reserve_seats(
    State(state): State<AppState>,
    Json(req): Json<ReserveSeatsRequest>,
) -> Result<Json<ReserveSeatsResponse>, AppError> {
    let booking_id = req.booking_id.unwrap_or_else(Uuid::new_v4);
    let ttl = state.machine.settings().default_timeout;
    let locks = state
        .machine
        .locks()
        .acquire(req.trip_id, &req.seat_ids, booking_id, ttl)
        .await?;
    Ok(Json(ReserveSeatsResponse { booking_id, locks }))
}

/// POST /seats/release
/// Seats of a confirmed booking are released only through the booking lifecycle
pub async fn release_seats(
    State(state): State<AppState>,
    Json(req): Json<ReleaseSeatsRequest>,
) -> Result<Json<ReleaseSeatsResponse>, AppError> {
    match state.machine.get(req.booking_id).await {
        Ok(booking) if booking.status == BookingStatus::Confirmed => {
            return Err(AppError::Conflict(format!(
                "booking {} is confirmed; cancel it instead",
                req.booking_id
            )));
        }
        Ok(_) | Err(CoreError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }

    let released = state
        .machine
        .locks()
        .release(req.trip_id, &req.seat_ids, req.booking_id)
        .await?;
    Ok(Json(ReleaseSeatsResponse { released }))
}

/// GET /trips/{id}/held-seats
pub async fn held_seats(
    State(state): State<AppState>,
    Path(trip_id): Path<Uuid>,
) -> Result<Json<Vec<SeatClaim>>, AppError> {
    Ok(Json(state.machine.locks().held_seats(trip_id).await?))
}
