use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use busline_core::CoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable".to_string())
            }
            AppError::BadGateway(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let msg = err.to_string();
        match err {
            CoreError::SeatConflict { .. } | CoreError::InvalidTransition { .. } => AppError::Conflict(msg),
            CoreError::NotFound(_) => AppError::NotFound(msg),
            CoreError::ValidationError(_) | CoreError::TripNotBookable(_) => AppError::BadRequest(msg),
            CoreError::Storage(_) => AppError::Unavailable(msg),
            CoreError::Collaborator { .. } => AppError::BadGateway(msg),
            CoreError::DuplicateReference(_) | CoreError::Config(_) => AppError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::booking::BookingStatus;
    use uuid::Uuid;

    fn status_of(err: CoreError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_core_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        assert_eq!(
            status_of(CoreError::SeatConflict { trip_id: id, seat_ids: vec!["S1".into()] }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CoreError::InvalidTransition {
                booking_id: id,
                from: BookingStatus::Failed,
                to: BookingStatus::Confirmed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(CoreError::NotFound("booking".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CoreError::ValidationError("empty".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CoreError::TripNotBookable("departed".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CoreError::Storage("reset".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_of(CoreError::Collaborator {
                service: "trip-service".into(),
                message: "502".into(),
                retryable: true,
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_of(CoreError::Config("bad".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
