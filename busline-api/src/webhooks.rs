use axum::{
    extract::{Path, State},
    routing::{post, put},
    Json, Router,
};
use busline_core::booking::{Booking, BookingStatus};
use busline_core::payment::TransactionStatus;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Status push from the payment service.
#[derive(Debug, Deserialize)]
pub struct PaymentStatusUpdate {
    pub payment_status: TransactionStatus,
    /// The sender's view of the booking; informational only.
    pub booking_status: Option<BookingStatus>,
    pub payment_order_id: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bookings/{id}/payment-status", put(update_payment_status))
        .route("/bookings/{id}/payment-status/refresh", post(refresh_payment_status))
}

/// PUT /bookings/{id}/payment-status
pub async fn update_payment_status(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(update): Json<PaymentStatusUpdate>,
) -> Result<Json<Booking>, AppError> {
    tracing::info!(
        %booking_id,
        payment_status = %update.payment_status,
        reported_booking_status = ?update.booking_status,
        "Received payment status update"
    );
    let booking = state
        .reconciler
        .apply(booking_id, update.payment_status, update.payment_order_id)
        .await?;
    Ok(Json(booking))
}

/// POST /bookings/{id}/payment-status/refresh
/// Pull the current status from the payment service
pub async fn refresh_payment_status(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.reconciler.refresh(booking_id).await?))
}
