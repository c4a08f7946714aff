use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::api::ErrorBody;
use crate::services::admission::AdmissionError;
use crate::services::batch::BatchError;
use crate::services::encryption::EncryptionError;
use crate::services::review::ReviewError;
use crate::services::scheduler::SchedulerError;
use crate::services::storage::StorageError;

/// Error returned by API handlers, rendered as a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported image format")]
    UnsupportedMedia,

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("Image storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Image encryption failed: {0}")]
    Encryption(#[from] EncryptionError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Storage(_) => StatusCode::BAD_GATEWAY,
            ApiError::Encryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Batch(e) => match e {
                BatchError::NotFound(_) => StatusCode::NOT_FOUND,
                BatchError::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
                BatchError::Admission(AdmissionError::InsufficientCredits { .. }) => {
                    StatusCode::PAYMENT_REQUIRED
                }
                BatchError::Admission(AdmissionError::EmptyBatch) => StatusCode::BAD_REQUEST,
                BatchError::Admission(AdmissionError::BatchTooLarge { .. }) => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                BatchError::Scheduler(SchedulerError::UnknownJob(_)) => StatusCode::NOT_FOUND,
                BatchError::Scheduler(
                    SchedulerError::Transition(_) | SchedulerError::BatchCancelled,
                ) => StatusCode::CONFLICT,
                BatchError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
                BatchError::Review(ReviewError::NotFound(_)) => StatusCode::NOT_FOUND,
                BatchError::Review(ReviewError::Discarded(_)) => StatusCode::CONFLICT,
                BatchError::Review(ReviewError::EmptyEdit | ReviewError::Invalid(_)) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Batch(BatchError::Admission(AdmissionError::InsufficientCredits {
                required,
                available,
                shortfall,
            })) => ErrorBody {
                error: self.to_string(),
                required: Some(*required),
                available: Some(*available),
                shortfall: Some(*shortfall),
            },
            _ => ErrorBody::message(self.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_insufficient_credits_maps_to_payment_required() {
        let err = ApiError::Batch(BatchError::Admission(AdmissionError::InsufficientCredits {
            required: 5,
            available: 2,
            shortfall: 3,
        }));
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        let body = err.body();
        assert_eq!(body.shortfall, Some(3));
        assert_eq!(body.available, Some(2));
    }

    #[test]
    fn test_review_errors_map_to_client_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::Batch(BatchError::Review(ReviewError::NotFound(id))).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Batch(BatchError::Scheduler(SchedulerError::BatchCancelled)).status(),
            StatusCode::CONFLICT
        );
        assert!(ApiError::Batch(BatchError::NotFound(id))
            .body()
            .shortfall
            .is_none());
    }
}
