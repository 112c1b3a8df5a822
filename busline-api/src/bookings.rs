use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use busline_core::booking::{Booking, BookingStatus, NewBooking};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: Uuid,
    pub trip_id: Uuid,
    pub seat_ids: Vec<String>,
    /// `booking_id` returned by `POST /seats/reserve`; the booking takes over that hold.
    pub hold_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListBookingsQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelBookingRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: BookingStatus,
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/status", put(change_status))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /bookings
/// Hold the seats and open a PENDING_PAYMENT booking
pub async fn create_booking(
    State(state): State<AppState>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let booking = state
        .machine
        .create(NewBooking {
            user_id: req.user_id,
            trip_id: req.trip_id,
            seat_ids: req.seat_ids,
            hold_id: req.hold_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// GET /bookings/{id}
pub async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.machine.get(booking_id).await?))
}

/// GET /bookings?user_id=
/// Newest first
pub async fn list_bookings(
    State(state): State<AppState>,
    Query(query): Query<ListBookingsQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.machine.list_for_user(query.user_id).await?))
}

/// POST /bookings/{id}/cancel
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    body: Option<Json<CancelBookingRequest>>,
) -> Result<Json<Booking>, AppError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled by user".to_string());
    let booking = state.machine.cancel(booking_id, reason).await?;
    tracing::info!(%booking_id, "Booking cancelled via API");
    Ok(Json(booking))
}

/// PUT /bookings/{id}/status
/// Explicit status change requested by an operator
pub async fn change_status(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<StatusChangeRequest>,
) -> Result<Json<Booking>, AppError> {
    tracing::info!(%booking_id, requested = %req.status, "Operator status change requested");
    let booking = state
        .machine
        .apply_operator_transition(booking_id, req.status, req.reason)
        .await?;
    Ok(Json(booking))
}
